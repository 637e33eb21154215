use crate::metrics_defs::REVERSE_LOOKUP_FAILURE;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reverse-DNS lookups, consumed by the upstream client for entries that
/// request the `reverse` attribute.
#[async_trait]
pub trait Reverser: Send + Sync {
    /// Enqueues a lookup and returns the slot the result lands in. The
    /// receiver yields the first PTR name without its trailing dot, or an
    /// empty string when the lookup fails or times out.
    async fn lookup(&self, ip: IpAddr) -> oneshot::Receiver<String>;
}

struct Job {
    ip: IpAddr,
    out: oneshot::Sender<String>,
}

#[derive(Clone)]
enum Resolver {
    /// In-process resolution with hickory.
    Hickory(Arc<TokioAsyncResolver>),
    /// libc getnameinfo on the blocking pool.
    System,
}

/// Worker pool shared across all concurrent fetches. The queue is bounded to
/// `workers * 10`; a full queue backpressures into the upstream fetch.
pub struct DnsReverser {
    queue: mpsc::Sender<Job>,
}

impl DnsReverser {
    pub fn new(workers: usize, prefer_in_process: bool) -> Result<DnsReverser, hickory_resolver::error::ResolveError> {
        let resolver = if prefer_in_process {
            Resolver::Hickory(Arc::new(TokioAsyncResolver::tokio_from_system_conf()?))
        } else {
            Resolver::System
        };

        let (queue, rx) = mpsc::channel::<Job>(workers * 10);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            let resolver = resolver.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { return };
                    let name = resolve(&resolver, job.ip).await;
                    let _ = job.out.send(name);
                }
            });
        }

        Ok(DnsReverser { queue })
    }
}

#[async_trait]
impl Reverser for DnsReverser {
    async fn lookup(&self, ip: IpAddr) -> oneshot::Receiver<String> {
        let (out, rx) = oneshot::channel();
        // A send error means the workers are gone; the dropped sender makes
        // the receiver resolve to an empty name at the call site.
        let _ = self.queue.send(Job { ip, out }).await;
        rx
    }
}

async fn resolve(resolver: &Resolver, ip: IpAddr) -> String {
    let result = tokio::time::timeout(LOOKUP_TIMEOUT, async {
        match resolver {
            Resolver::Hickory(resolver) => resolver
                .reverse_lookup(ip)
                .await
                .ok()
                .and_then(|names| names.iter().next().map(|ptr| ptr.0.to_utf8())),
            Resolver::System => tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
                .await
                .ok()
                .flatten(),
        }
    })
    .await;

    match result {
        Ok(Some(name)) if !name.is_empty() => name.trim_end_matches('.').to_string(),
        _ => {
            tracing::debug!(ip = %ip, "reverse lookup failed");
            metrics::counter!(REVERSE_LOOKUP_FAILURE.name).increment(1);
            String::new()
        }
    }
}
