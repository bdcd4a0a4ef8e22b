//! kuix-host - Worker host child process.
//!
//! Spawned by the core with positional arguments
//! `(identifier, auth_key, host, port, artificial_latency)`. Runs until the
//! control channel closes or the core sends `close_process`.

use anyhow::Context;
use clap::Parser;
use kuix_host::{host::HostOptions, telemetry, WorkerHost};

#[derive(Parser)]
#[command(name = "kuix-host")]
#[command(about = "KuiX worker host process")]
#[command(version)]
struct Args {
    /// Unique identifier of this host within the core.
    identifier: String,

    /// Authentication key for the control channel.
    auth_key: String,

    /// Core host to connect to.
    host: String,

    /// Core port to connect to.
    port: u16,

    /// Pacing knob in seconds, forwarded by the core.
    #[arg(default_value_t = 0.1)]
    artificial_latency: f64,

    /// Emit newline-delimited JSON log records.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_json);

    let options = HostOptions {
        identifier: args.identifier.clone(),
        auth_key: args.auth_key,
        host: args.host,
        port: args.port,
        artificial_latency: args.artificial_latency,
        exit_on_close: true,
    };
    let host = WorkerHost::connect(options)
        .await
        .with_context(|| format!("worker host '{}' failed to start", args.identifier))?;

    host.wait_closed().await;
    Ok(())
}
