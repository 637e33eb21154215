pub mod pool;

use crate::clock::Clock;
use crate::errors::FetchError;
use crate::fields::Fields;
use crate::metrics_defs::{UPSTREAM_REQUEST_DURATION, UPSTREAM_RETRY};
use crate::reverse::Reverser;
use crate::types::{Response, SharedEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use self::pool::Server;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use url::Url;

pub const API_BASE_URL: &str = "https://pro.ip-api.com";

/// How long a server is skipped after an error.
const ERROR_COOLDOWN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CONNS_PER_HOST: usize = 100;

/// The upstream the batcher flushes into.
#[async_trait]
pub trait Client: Send + Sync {
    /// Issues one upstream batch request for all entries. On success every
    /// entry holds its response and a fresh expiry; on failure entries are
    /// left untouched.
    async fn fetch(&self, entries: &[SharedEntry]) -> Result<(), FetchError>;

    /// Single lookup for the caller's own IP; bypasses the batcher.
    async fn fetch_self(&self, lang: &str, fields: Fields) -> Result<Response, FetchError>;

    /// Server pool snapshot for the debug endpoint.
    fn debug(&self) -> serde_json::Value;
}

#[derive(Serialize)]
struct BatchQuery {
    query: String,
    lang: String,
    fields: u64,
}

struct State {
    servers: Vec<Arc<Server>>,
    /// Lazily built HTTP client per target host. The key is either a pop IP
    /// or the upstream hostname for the DNS fallback.
    clients: HashMap<String, reqwest::Client>,
}

/// Batch client for pro.ip-api.com, with latency-ranked edge servers and
/// error-aware failover.
pub struct IpApiClient {
    base: Url,
    batch_url: String,
    self_url: String,
    ttl: Duration,
    retries: u32,
    reverser: Arc<dyn Reverser>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl IpApiClient {
    pub fn new(
        base: Url,
        api_key: &str,
        ttl: Duration,
        retries: u32,
        reverser: Arc<dyn Reverser>,
        clock: Arc<dyn Clock>,
    ) -> IpApiClient {
        IpApiClient {
            batch_url: format!("{base}batch?key={api_key}"),
            self_url: format!("{base}json/?key={api_key}"),
            base,
            ttl,
            retries,
            reverser,
            clock,
            state: Mutex::new(State {
                servers: Vec::new(),
                clients: HashMap::new(),
            }),
        }
    }

    /// Keeps the server pool fresh in the background: fetch the pop list,
    /// probe latencies, publish, sleep `refresh`; back off a minute when the
    /// pops endpoint is unreachable.
    pub fn spawn_pool_refresh(self: &Arc<Self>, pops_url: String, refresh: Duration) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let probe = match reqwest::Client::builder().timeout(pool::PING_TIMEOUT).build() {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build pop probe client");
                    return;
                }
            };

            loop {
                let current = client.state.lock().servers.clone();
                match pool::discover(&probe, &pops_url, &current).await {
                    Ok(servers) => {
                        tracing::info!(servers = servers.len(), "refreshed server pool");
                        client.state.lock().servers = servers;
                        tokio::time::sleep(refresh).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to fetch pops");
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            }
        });
    }

    /// Picks the best server without a recent error, falling back to plain
    /// hostname DNS, and returns it with the HTTP client pinned to it.
    fn server_and_client(&self) -> Result<(Option<Arc<Server>>, reqwest::Client), FetchError> {
        let mut state = self.state.lock();

        let cooldown = self.clock.now().checked_sub(ERROR_COOLDOWN);
        let server = state
            .servers
            .iter()
            .find(|s| match (*s.last_error.lock(), cooldown) {
                (None, _) => true,
                (Some(at), Some(cutoff)) => at < cutoff,
                (Some(_), None) => false,
            })
            .cloned();

        let host = match &server {
            Some(server) => server.ip.clone(),
            None => self.base.host_str().unwrap_or_default().to_string(),
        };

        if !state.clients.contains_key(&host) {
            let mut builder = reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .pool_max_idle_per_host(MAX_CONNS_PER_HOST)
                .pool_idle_timeout(IDLE_TIMEOUT);

            // Dial the pop's address while keeping the upstream hostname for
            // TLS and the Host header.
            if let Some(server) = &server {
                if let (Ok(ip), Some(api_host), Some(port)) = (
                    server.ip.parse::<IpAddr>(),
                    self.base.host_str(),
                    self.base.port_or_known_default(),
                ) {
                    builder = builder.resolve(api_host, SocketAddr::new(ip, port));
                }
            }

            state.clients.insert(host.clone(), builder.build()?);
        }

        let client = state.clients[&host].clone();
        Ok((server, client))
    }

    fn mark_error(&self, server: &Option<Arc<Server>>) {
        if let Some(server) = server {
            server.errors.fetch_add(1, Ordering::Relaxed);
            *server.last_error.lock() = Some(self.clock.now());
        }
        metrics::counter!(UPSTREAM_RETRY.name).increment(1);
    }
}

#[async_trait]
impl Client for IpApiClient {
    async fn fetch(&self, entries: &[SharedEntry]) -> Result<(), FetchError> {
        // Build the payload once. Status is force-merged so failed lookups
        // are detectable; reverse is resolved locally instead of upstream.
        let mut queries = Vec::with_capacity(entries.len());
        let mut reverse_ips: Vec<Option<IpAddr>> = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut e = entry.write();
            e.fields = e.fields.merge(Fields::STATUS);

            let mut reverse_ip = None;
            if e.fields.contains(Fields::REVERSE) {
                if let Ok(ip) = e.ip.parse() {
                    e.fields = e.fields.remove(Fields::REVERSE);
                    reverse_ip = Some(ip);
                }
            }

            queries.push(BatchQuery {
                query: e.ip.clone(),
                lang: e.lang.clone(),
                fields: e.fields.as_u64(),
            });
            reverse_ips.push(reverse_ip);
        }

        let mut reverses: Vec<Option<oneshot::Receiver<String>>> =
            Vec::with_capacity(entries.len());
        for ip in reverse_ips {
            reverses.push(match ip {
                Some(ip) => Some(self.reverser.lookup(ip).await),
                None => None,
            });
        }

        let body = serde_json::to_vec(&queries)?;

        let mut last_error = None;
        for _ in 0..self.retries {
            let (server, client) = self.server_and_client()?;
            if let Some(server) = &server {
                server.requests.fetch_add(1, Ordering::Relaxed);
            }

            let started = Instant::now();
            let result = client
                .post(&self.batch_url)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;
            metrics::histogram!(UPSTREAM_REQUEST_DURATION.name)
                .record(started.elapsed().as_secs_f64());

            let responses = match result {
                Ok(response) => match response.json::<Vec<Response>>().await {
                    Ok(responses) => responses,
                    Err(e) => {
                        self.mark_error(&server);
                        last_error = Some(FetchError::Http(e));
                        continue;
                    }
                },
                Err(e) => {
                    self.mark_error(&server);
                    last_error = Some(FetchError::Http(e));
                    continue;
                }
            };

            if responses.len() != entries.len() {
                if responses.len() == 1 {
                    if let Some(message) = &responses[0].message {
                        return Err(FetchError::Upstream(message.clone()));
                    }
                }
                return Err(FetchError::CountMismatch {
                    got: responses.len(),
                    want: entries.len(),
                });
            }

            let expires = self.clock.now() + self.ttl;
            for (entry, response) in entries.iter().zip(responses) {
                let mut e = entry.write();
                e.response = response;
                e.expires = Some(expires);
            }

            // Join the reverse lookups and fold the names in. Failed lookups
            // yield an empty name; failed geo lookups keep no reverse at all.
            for (entry, slot) in entries.iter().zip(reverses.iter_mut()) {
                if let Some(rx) = slot.take() {
                    let name = rx.await.unwrap_or_default();
                    let mut e = entry.write();
                    e.fields = e.fields.merge(Fields::REVERSE);
                    if e.response.status.as_deref() != Some("fail") {
                        e.response.reverse = Some(name);
                    }
                }
            }

            return Ok(());
        }

        Err(last_error.unwrap_or(FetchError::RetryLimitReached))
    }

    async fn fetch_self(&self, lang: &str, fields: Fields) -> Result<Response, FetchError> {
        let url = format!("{}&lang={lang}&fields={}", self.self_url, fields.as_u64());

        let mut last_error = None;
        for _ in 0..self.retries {
            let (server, client) = self.server_and_client()?;
            if let Some(server) = &server {
                server.requests.fetch_add(1, Ordering::Relaxed);
            }

            let started = Instant::now();
            let result = client.get(&url).send().await;
            metrics::histogram!(UPSTREAM_REQUEST_DURATION.name)
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(response) => match response.json::<Response>().await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        self.mark_error(&server);
                        last_error = Some(FetchError::Http(e));
                    }
                },
                Err(e) => {
                    self.mark_error(&server);
                    last_error = Some(FetchError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::RetryLimitReached))
    }

    fn debug(&self) -> serde_json::Value {
        let snapshots: Vec<_> = self
            .state
            .lock()
            .servers
            .iter()
            .map(|s| s.snapshot())
            .collect();
        serde_json::to_value(snapshots).unwrap_or(serde_json::Value::Null)
    }
}
