//! Shared helpers for tests: a scripted upstream client, a gate to hold
//! batches in flight, and a canned reverser.

use crate::clock::Clock;
use crate::errors::FetchError;
use crate::fields::Fields;
use crate::reverse::Reverser;
use crate::types::{Response, SharedEntry};
use crate::upstream::Client;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot, watch};

/// TTL the mock applies to fetched entries.
pub const MOCK_TTL: Duration = Duration::from_secs(60);

/// Deterministic response per cache key, mirrored by the end-to-end tests.
pub fn mock_response_for(key: &str) -> Response {
    match key {
        "1.1.1.1en" => Response {
            country: Some("Some Country".into()),
            city: Some("Some City".into()),
            query: Some("1.1.1.1".into()),
            ..Response::default()
        },
        "1.1.1.1ja" => Response {
            country: Some("Some japanese Country".into()),
            city: Some("Some japanese City".into()),
            query: Some("1.1.1.1".into()),
            ..Response::default()
        },
        "2.2.2.2en" => Response {
            status: Some("success".into()),
            country: Some("Some other Country".into()),
            country_code: Some("SO".into()),
            region: Some("SX".into()),
            region_name: Some("Some other Region".into()),
            city: Some("Some other City".into()),
            zip: Some("some other zip".into()),
            lat: Some(13.0),
            lon: Some(37.0),
            timezone: Some("some/timezone".into()),
            isp: Some("Some other ISP".into()),
            org: Some("Some other Org".into()),
            r#as: Some("Some other AS".into()),
            query: Some("2.2.2.2".into()),
            ..Response::default()
        },
        _ => Response {
            country: Some(key.to_string()),
            city: Some(key.to_string()),
            query: Some(key[..key.len() - 2].to_string()),
            ..Response::default()
        },
    }
}

/// Upstream stand-in that records batch contents and fails any batch
/// containing `0.0.0.0en`.
pub struct MockUpstream {
    clock: Arc<dyn Clock>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl MockUpstream {
    pub fn new(clock: Arc<dyn Clock>) -> MockUpstream {
        MockUpstream {
            clock,
            batches: Mutex::new(Vec::new()),
        }
    }

    /// The keys of every batch fetched so far, in dispatch order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Client for MockUpstream {
    async fn fetch(&self, entries: &[SharedEntry]) -> Result<(), FetchError> {
        let keys: Vec<String> = entries.iter().map(|e| e.read().key()).collect();
        self.batches.lock().push(keys.clone());

        if keys.iter().any(|key| key == "0.0.0.0en") {
            return Err(FetchError::Upstream("test error".into()));
        }

        let expires = self.clock.now() + MOCK_TTL;
        for entry in entries {
            let mut e = entry.write();
            let key = e.key();
            e.response = mock_response_for(&key);
            e.expires = Some(expires);
        }
        Ok(())
    }

    async fn fetch_self(&self, _lang: &str, _fields: Fields) -> Result<Response, FetchError> {
        Ok(Response {
            status: Some("success".into()),
            country: Some("Self Country".into()),
            query: Some("198.51.100.1".into()),
            ..Response::default()
        })
    }

    fn debug(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Wraps [`MockUpstream`] behind a gate so tests can observe a batch while it
/// is in flight. Every `fetch` blocks until [`GatedUpstream::release`].
pub struct GatedUpstream {
    mock: MockUpstream,
    gate: Semaphore,
    inflight: watch::Sender<usize>,
}

impl GatedUpstream {
    pub fn new(clock: Arc<dyn Clock>) -> GatedUpstream {
        GatedUpstream {
            mock: MockUpstream::new(clock),
            gate: Semaphore::new(0),
            inflight: watch::Sender::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Resolves once at least one fetch is blocked on the gate.
    pub async fn wait_for_inflight(&self) {
        let mut rx = self.inflight.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.mock.batches()
    }
}

#[async_trait]
impl Client for GatedUpstream {
    async fn fetch(&self, entries: &[SharedEntry]) -> Result<(), FetchError> {
        self.inflight.send_modify(|n| *n += 1);
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        self.inflight.send_modify(|n| *n -= 1);
        self.mock.fetch(entries).await
    }

    async fn fetch_self(&self, lang: &str, fields: Fields) -> Result<Response, FetchError> {
        self.mock.fetch_self(lang, fields).await
    }

    fn debug(&self) -> serde_json::Value {
        self.mock.debug()
    }
}

/// Reverser returning a fixed name for every lookup.
#[derive(Default)]
pub struct MockReverser {
    name: String,
}

impl MockReverser {
    pub fn with_name(name: &str) -> MockReverser {
        MockReverser { name: name.to_string() }
    }
}

#[async_trait]
impl Reverser for MockReverser {
    async fn lookup(&self, _ip: IpAddr) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(self.name.clone());
        rx
    }
}
