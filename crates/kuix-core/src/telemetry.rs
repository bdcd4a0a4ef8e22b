//! Tracing initialization for the core binary.
//!
//! Filtering comes from `KUIX_LOG` (default `info`). With `--log-json` the
//! fmt layer emits newline-delimited JSON records.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "KUIX_LOG";

pub fn init(log_json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
