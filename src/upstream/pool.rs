use crate::errors::FetchError;
use http::StatusCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;

const LATENCY_PINGS: u32 = 4;
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Latency assigned to a pop that answered none of its pings, so it sorts
/// behind every reachable one.
const UNREACHABLE_LATENCY: Duration = Duration::from_secs(60 * 60);

/// One upstream edge server. `requests` and `errors` are bumped atomically
/// outside any lock; `last_error` is written under the client mutex.
#[derive(Debug)]
pub struct Server {
    pub ip: String,
    pub pop: String,
    pub latency: Duration,
    pub last_error: Mutex<Option<SystemTime>>,
    pub requests: AtomicI64,
    pub errors: AtomicI64,
}

impl Server {
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            ip: self.ip.clone(),
            pop: self.pop.clone(),
            latency_ms: self.latency.as_millis() as u64,
            last_error: self
                .last_error
                .lock()
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Shape served by `/debug`.
#[derive(Debug, Serialize)]
pub struct ServerSnapshot {
    pub ip: String,
    pub pop: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<u64>,
    pub requests: i64,
    pub errors: i64,
}

#[derive(Debug, Deserialize)]
struct PopRecord {
    ip: String,
    pop: String,
}

/// Fetches the pop list and measures each pop, carrying request/error
/// counters over from the previous pool by IP. The result is sorted by
/// latency ascending.
pub async fn discover(
    probe: &reqwest::Client,
    pops_url: &str,
    current: &[Arc<Server>],
) -> Result<Vec<Arc<Server>>, FetchError> {
    let response = probe.get(pops_url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(FetchError::PopsStatus(response.status()));
    }
    let pops: Vec<PopRecord> = response.json().await?;

    let counters: HashMap<String, (i64, i64)> = current
        .iter()
        .map(|s| {
            (
                s.ip.clone(),
                (
                    s.requests.load(Ordering::Relaxed),
                    s.errors.load(Ordering::Relaxed),
                ),
            )
        })
        .collect();

    let mut probes = JoinSet::new();
    for record in pops {
        let probe = probe.clone();
        let carried = counters.get(&record.ip).copied();
        probes.spawn(async move {
            let latency = measure_latency(&probe, &record.ip).await;
            tracing::debug!(ip = %record.ip, pop = %record.pop, ?latency, "probed pop");
            let (requests, errors) = carried.unwrap_or((0, 0));
            Arc::new(Server {
                ip: record.ip,
                pop: record.pop,
                latency,
                last_error: Mutex::new(None),
                requests: AtomicI64::new(requests),
                errors: AtomicI64::new(errors),
            })
        });
    }

    let mut servers = Vec::new();
    while let Some(result) = probes.join_next().await {
        match result {
            Ok(server) => servers.push(server),
            Err(e) => tracing::error!(error = %e, "pop probe task failed"),
        }
    }

    servers.sort_by_key(|s| s.latency);
    Ok(servers)
}

/// Average of the successful ping round trips, or [`UNREACHABLE_LATENCY`]
/// when none succeed.
async fn measure_latency(probe: &reqwest::Client, ip: &str) -> Duration {
    let url = format!("http://{ip}/ping");
    let mut measures = Vec::new();

    for _ in 0..LATENCY_PINGS {
        let start = Instant::now();
        match probe.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => measures.push(start.elapsed()),
            _ => {}
        }
    }

    if measures.is_empty() {
        return UNREACHABLE_LATENCY;
    }
    measures.iter().sum::<Duration>() / measures.len() as u32
}
