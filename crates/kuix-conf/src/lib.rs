//! Minimal configuration loading for KuiX.
//!
//! This crate is imported by both the core and the worker host and
//! deliberately carries almost no dependencies. It owns two concerns:
//!
//! - the `config.json` document that seeds a core
//!   (`{ipc_host, ipc_port, auth_key, process_count, artificial_latency}`),
//! - the working-directory scaffolding (`<root>/kuiX/{Logs,Strategies,Components}`).
//!
//! An empty `auth_key` means the core generates one at startup. A
//! `process_count` of `-1` resolves to the machine's available parallelism.

mod loader;
mod workdir;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use loader::{generate_json_config, load_json_config, DEFAULT_CONFIG_PATH};
pub use workdir::Workdir;

/// Core configuration, one-to-one with `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Host for the control-channel listener. Loopback by design.
    pub ipc_host: String,
    pub ipc_port: u16,
    /// Shared secret for the handshake; empty means auto-generate.
    pub auth_key: String,
    /// Number of worker-host processes to run; -1 means one per CPU.
    pub process_count: i64,
    /// Pacing knob in seconds, forwarded to child processes.
    pub artificial_latency: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ipc_host: "localhost".to_owned(),
            ipc_port: 6969,
            auth_key: String::new(),
            process_count: -1,
            artificial_latency: 0.1,
        }
    }
}

impl CoreConfig {
    /// Resolve `process_count`, mapping -1 (and other non-positive values)
    /// to the available CPU count.
    pub fn resolved_process_count(&self) -> usize {
        if self.process_count > 0 {
            self.process_count as usize
        } else {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        }
    }
}

/// Errors raised while loading or generating configuration and while
/// scaffolding the working directory.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to set up working directory {path}: {source}")]
    Setup {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_documented_config() {
        let config = CoreConfig::default();
        assert_eq!(config.ipc_host, "localhost");
        assert_eq!(config.ipc_port, 6969);
        assert_eq!(config.auth_key, "");
        assert_eq!(config.process_count, -1);
        assert_eq!(config.artificial_latency, 0.1);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"ipc_port": 7000}"#).unwrap();
        assert_eq!(config.ipc_port, 7000);
        assert_eq!(config.ipc_host, "localhost");
        assert_eq!(config.process_count, -1);
    }

    #[test]
    fn negative_process_count_resolves_to_cpu_count() {
        let config = CoreConfig::default();
        assert!(config.resolved_process_count() >= 1);

        let fixed = CoreConfig {
            process_count: 3,
            ..CoreConfig::default()
        };
        assert_eq!(fixed.resolved_process_count(), 3);
    }
}
