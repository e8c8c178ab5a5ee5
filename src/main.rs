// SPDX-License-Identifier: BSD-3-Clause

//! CoMo entry point.
//!
//! One binary hosts every role: run it plain for the inline supervisor,
//! with `--multiprocess` to spawn each stage as a child process, or with
//! `--role` (used by those children) to run a single stage.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use como_config::Config;
use como_controller::{Supervisor, query};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Supervise the whole pipeline.
    Supervisor,
    /// Capture stage only (spawned by the supervisor).
    Capture,
    /// Export stage only.
    Export,
    /// Storage stage only.
    Storage,
}

/// Continuous network monitoring.
#[derive(Debug, Parser)]
#[command(name = "como", version, about)]
struct Args {
    /// Configuration file.
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Which stage to run.
    #[arg(long, value_enum, default_value = "supervisor")]
    role: Role,

    /// Run each stage as a child process instead of a thread.
    #[arg(long)]
    multiprocess: bool,

    /// Serve the query port after an inline run completes.
    #[arg(long)]
    serve_queries: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    match args.role {
        Role::Supervisor => {
            let supervisor = Supervisor::new(config.clone())?;
            if args.multiprocess {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
                let exe = std::env::current_exe()?;
                rt.block_on(supervisor.run_multiprocess(&exe, &args.config))?;
            } else {
                let report = supervisor.run_inline()?;
                info!(
                    pkts = report.capture.pkts,
                    records = report.export.records,
                    "run complete"
                );
                if args.serve_queries {
                    serve_queries(&supervisor, config)?;
                }
            }
        }
        Role::Capture => {
            let run_dir = run_dir(&config);
            let stats = como_controller::roles::run_capture(&config, &run_dir)?;
            info!(pkts = stats.pkts, batches = stats.batches, "capture exited");
        }
        Role::Export => {
            let run_dir = run_dir(&config);
            let stats = como_controller::roles::run_export(&config, &run_dir)?;
            info!(records = stats.records, "export exited");
        }
        Role::Storage => {
            let run_dir = run_dir(&config);
            como_controller::roles::run_storage(&config, &run_dir, None)?;
        }
    }
    Ok(())
}

fn run_dir(config: &Config) -> PathBuf {
    config.storage.basedir.join("run")
}

/// Keeps storage up and answers queries until interrupted.
fn serve_queries(supervisor: &Supervisor, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    let run_dir = supervisor.run_dir().to_path_buf();

    // storage must be reachable again for readers
    let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let storage_cfg = config.clone();
    let storage_dir = run_dir.clone();
    let _storage = std::thread::Builder::new().name("como-storage".into()).spawn(move || {
        como_controller::roles::run_storage(&storage_cfg, &storage_dir, Some(stop_rx))
    })?;

    rt.block_on(local.run_until(async move {
        let addr = format!("127.0.0.1:{}", config.query.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "query port open");
        query::serve(listener, run_dir, config).await?;
        Ok(())
    }))
}
