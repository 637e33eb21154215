use geoip_proxy::config::{Config, LogOutput};
use metrics_exporter_statsd::StatsdBuilder;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(1);
        }
    };

    init_tracing(&config);
    init_statsd_recorder(&config);

    tokio::select! {
        result = geoip_proxy::run(config) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "fatal error");
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_output {
        LogOutput::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogOutput::Console => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn init_statsd_recorder(config: &Config) {
    if let Some(host) = &config.statsd_host {
        let recorder = StatsdBuilder::from(host.clone(), config.statsd_port)
            .build(Some("geoip_proxy"))
            .expect("could not create statsd recorder");

        metrics::set_global_recorder(recorder).expect("could not set global metrics recorder");
    }
}
