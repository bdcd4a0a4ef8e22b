//! kuix-core - Core orchestrator binary.
//!
//! Subcommands:
//! - `kuix-core init-config` - write a default `config.json`
//! - `kuix-core serve` - run a core, pre-spawning the configured number of
//!   worker-host processes, until ctrl-c

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kuix_conf::{generate_json_config, load_json_config, DEFAULT_CONFIG_PATH};
use kuix_core::{telemetry, Core, CoreOptions};
use tracing::{error, info};

/// Core orchestrator for the KuiX framework.
#[derive(Parser)]
#[command(name = "kuix-core")]
#[command(about = "KuiX core orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file populated with default values.
    InitConfig {
        /// Where to write the config file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },

    /// Run a core until ctrl-c.
    Serve {
        /// Config file to load.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Root under which the kuiX working directories are created.
        #[arg(long, default_value = "")]
        root: PathBuf,

        /// Worker-host binary to spawn (defaults to a sibling of this
        /// executable).
        #[arg(long)]
        host_binary: Option<PathBuf>,

        /// Emit newline-delimited JSON log records.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::InitConfig { path } => {
            telemetry::init(false);
            generate_json_config(&path)
                .with_context(|| format!("could not generate {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::Serve {
            config,
            root,
            host_binary,
            log_json,
        } => {
            telemetry::init(log_json);
            let config = load_json_config(&config)
                .with_context(|| format!("could not load {}", config.display()))?;

            let mut options = CoreOptions::new(config.clone()).with_root(root);
            if let Some(binary) = host_binary {
                options = options.with_host_binary(binary);
            }
            let core = Core::setup(options).await.context("core setup failed")?;
            core.start().await;

            // Bring up the configured process pool.
            for index in 0..config.resolved_process_count() {
                let identifier = format!("kx-{index}");
                if let Err(e) = core.create_process_and_wait(&identifier).await {
                    error!(%identifier, error = %e, "worker host failed to come up");
                }
            }
            info!(
                addr = %core.local_addr(),
                hosts = core.tracker().count().await,
                "core serving; press ctrl-c to stop",
            );

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            for host_id in core.tracker().identifiers().await {
                if let Err(e) = core.close_process(&host_id).await {
                    error!(host = %host_id, error = %e, "error while closing a worker host");
                }
            }
            core.close().await;
            Ok(())
        }
    }
}
