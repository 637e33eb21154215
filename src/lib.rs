pub mod api;
pub mod batcher;
pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod fields;
pub mod metrics_defs;
pub mod reverse;
pub mod types;
pub mod upstream;
pub mod wait;

#[cfg(test)]
mod testutils;

use crate::api::ProxyService;
use crate::batcher::Batcher;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::ProxyError;
use crate::reverse::DnsReverser;
use crate::upstream::IpApiClient;
use std::sync::Arc;
use tokio::net::TcpListener;
use url::Url;

/// Wires the components together and serves until the listener fails.
pub async fn run(config: Config) -> Result<(), ProxyError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let reverser = Arc::new(DnsReverser::new(
        config.reverse_workers,
        config.reverse_prefer_in_process,
    )?);

    let base = Url::parse(upstream::API_BASE_URL).expect("upstream base URL is valid");
    let client = Arc::new(IpApiClient::new(
        base,
        &config.ip_api_key,
        config.cache_ttl,
        config.retries,
        reverser,
        Arc::clone(&clock),
    ));
    client.spawn_pool_refresh(config.pops_url.clone(), config.pops_refresh);

    let batcher = Batcher::new(config.cache_size, client.clone(), clock);
    tokio::spawn({
        let batcher = batcher.clone();
        async move { batcher.process_loop().await }
    });

    let listener = TcpListener::bind(&config.listen).await?;
    tracing::info!(addr = %config.listen, "listening");
    api::serve(listener, ProxyService::new(batcher, client)).await
}
