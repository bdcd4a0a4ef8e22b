//! Worker-host child process spawning.
//!
//! The child runs the `kuix-host` binary with positional arguments
//! `(identifier, auth_key, host, port, artificial_latency)`. Supervision
//! happens over the control channel, not through the child handle; a
//! spawned child is left to connect back on its own.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use kuix_proto::{ErrorKind, KuixError};
use tokio::process::Command;
use tracing::info;

/// Locate the worker-host binary: a sibling of the current executable if
/// one exists, otherwise resolved through `PATH`.
pub fn default_host_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("kuix-host")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("kuix-host"))
}

/// Spawns worker-host children pointed back at this core.
#[derive(Debug, Clone)]
pub struct HostSpawner {
    binary: PathBuf,
    ipc_host: String,
    port: u16,
    auth_key: String,
    artificial_latency: f64,
}

impl HostSpawner {
    pub fn new(
        binary: impl Into<PathBuf>,
        ipc_host: impl Into<String>,
        port: u16,
        auth_key: impl Into<String>,
        artificial_latency: f64,
    ) -> Self {
        Self {
            binary: binary.into(),
            ipc_host: ipc_host.into(),
            port,
            auth_key: auth_key.into(),
            artificial_latency,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Launch one child. Returns as soon as the OS process exists; the
    /// host announces itself by connecting back.
    pub fn spawn(&self, identifier: &str) -> Result<(), KuixError> {
        let child = Command::new(&self.binary)
            .arg(identifier)
            .arg(&self.auth_key)
            .arg(&self.ipc_host)
            .arg(self.port.to_string())
            .arg(self.artificial_latency.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                KuixError::wrap(
                    ErrorKind::ProcessLaunchError,
                    format!(
                        "failed to launch worker host '{identifier}' from '{}'",
                        self.binary.display()
                    ),
                    e,
                )
            })?;
        info!(
            %identifier,
            pid = child.id(),
            binary = %self.binary.display(),
            "worker host process spawned",
        );
        // The child is intentionally not awaited here; the tokio reaper
        // collects it if it exits.
        drop(child);
        Ok(())
    }
}
