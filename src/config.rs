use std::env;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_POPS_URL: &str = "https://d2e7s0viy93a0y.cloudfront.net/pops.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {var}: {source}")]
    InvalidDuration {
        var: &'static str,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Runtime configuration, read once at startup from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen: String,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub retries: u32,
    pub pops_url: String,
    pub pops_refresh: Duration,
    pub ip_api_key: String,
    pub reverse_workers: usize,
    pub reverse_prefer_in_process: bool,
    pub log_output: LogOutput,
    pub log_level: String,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Ok(Config {
            listen: string_env("LISTEN", "127.0.0.1:8080"),
            cache_size: number_env("CACHE_SIZE", 1024 * 1024 * 1024)?,
            cache_ttl: duration_env("CACHE_TTL", Duration::from_secs(24 * 60 * 60))?,
            retries: number_env("RETRIES", 4)?,
            pops_url: string_env("POPS_URL", DEFAULT_POPS_URL),
            pops_refresh: duration_env("POPS_REFRESH", Duration::from_secs(60 * 60))?,
            ip_api_key: string_env("IP_API_KEY", ""),
            reverse_workers: number_env("REVERSE_WORKERS", 10)?,
            reverse_prefer_in_process: env::var("REVERSE_PREFERGO").as_deref() != Ok("false"),
            log_output: match env::var("LOG_OUTPUT").as_deref() {
                Ok("json") => LogOutput::Json,
                _ => LogOutput::Console,
            },
            log_level: string_env("LOG_LEVEL", "info"),
            statsd_host: env::var("STATSD_HOST").ok().filter(|host| !host.is_empty()),
            statsd_port: number_env("STATSD_PORT", 8125)?,
        })
    }
}

fn string_env(var: &'static str, default: &str) -> String {
    match env::var(var) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn number_env<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { var, source }),
        _ => Ok(default),
    }
}

fn duration_env(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => humantime::parse_duration(&value)
            .map_err(|source| ConfigError::InvalidDuration { var, source }),
        _ => Ok(default),
    }
}
