// SPDX-License-Identifier: BSD-3-Clause

//! Pipeline lifecycle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use como_config::Config;
use como_engine::capture::CaptureStats;
use como_engine::export::ExportStats;
use como_ipc::PeerClass;
use como_ipc::bus::socket_path;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::roles;

const SOCKET_WAIT: Duration = Duration::from_secs(10);
const STORAGE_RESPAWN_BUDGET: u32 = 3;

/// Final counters of an inline pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Capture-side counters.
    pub capture: CaptureStats,
    /// Export-side counters.
    pub export: ExportStats,
}

/// The supervisor.
pub struct Supervisor {
    config: Config,
    run_dir: PathBuf,
}

impl Supervisor {
    /// Creates a supervisor for the given configuration. Bus sockets live
    /// in `run` under the storage base directory.
    pub fn new(config: Config) -> Result<Self, Error> {
        let run_dir = config.storage.basedir.join("run");
        std::fs::create_dir_all(&run_dir)?;
        // stale sockets of a previous run would fool the boot ordering
        for class in [PeerClass::Storage, PeerClass::Capture, PeerClass::Export] {
            match std::fs::remove_file(socket_path(&run_dir, class)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(Supervisor { config, run_dir })
    }

    /// The directory holding the bus sockets.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Runs the pipeline inline: one thread per stage, boot in reverse
    /// data-flow order, join in flow order. Returns when capture finishes
    /// (end of input) or fails.
    pub fn run_inline(&self) -> Result<PipelineReport, Error> {
        let config = self.config.clone();
        let run_dir = self.run_dir.clone();

        let (storage_stop, stop_rx) = tokio::sync::oneshot::channel();
        let storage = thread::Builder::new().name("como-storage".into()).spawn({
            let config = config.clone();
            let run_dir = run_dir.clone();
            move || roles::run_storage(&config, &run_dir, Some(stop_rx))
        })?;
        wait_for_socket(&self.run_dir, PeerClass::Storage)?;

        let capture = thread::Builder::new().name("como-capture".into()).spawn({
            let config = config.clone();
            let run_dir = run_dir.clone();
            move || roles::run_capture(&config, &run_dir)
        })?;
        wait_for_socket(&self.run_dir, PeerClass::Capture)?;

        let export = thread::Builder::new().name("como-export".into()).spawn({
            let config = config.clone();
            let run_dir = run_dir.clone();
            move || roles::run_export(&config, &run_dir)
        })?;

        let capture_stats = join_stage(capture, "capture")?;
        let export_stats = join_stage(export, "export")?;
        let _ = storage_stop.send(());
        let () = join_stage(storage, "storage")?;

        info!(
            pkts = capture_stats.pkts,
            records = export_stats.records,
            "pipeline finished"
        );
        Ok(PipelineReport { capture: capture_stats, export: export_stats })
    }

    /// Runs the pipeline as child processes of `exe` (normally the
    /// current binary re-executed with `--role`). Storage gets a bounded
    /// respawn budget; a dead capture or export tears everything down.
    pub async fn run_multiprocess(&self, exe: &Path, config_path: &Path) -> Result<(), Error> {
        let spawn = |role: &str| -> Result<Child, Error> {
            let child = Command::new(exe)
                .arg("--role")
                .arg(role)
                .arg("--config")
                .arg(config_path)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            info!(role, pid = child.id(), "child spawned");
            Ok(child)
        };

        let mut storage = spawn("storage")?;
        wait_for_socket(&self.run_dir, PeerClass::Storage)?;
        let mut capture = spawn("capture")?;
        wait_for_socket(&self.run_dir, PeerClass::Capture)?;
        let mut export = spawn("export")?;

        let mut respawns = 0u32;
        loop {
            tokio::select! {
                status = capture.wait() => {
                    let status = status?;
                    return if status.success() {
                        info!("capture finished, shutting down");
                        let _ = export.wait().await;
                        let _ = storage.kill().await.ok();
                        Ok(())
                    } else {
                        error!(%status, "capture died, aborting pipeline");
                        let _ = export.kill().await.ok();
                        let _ = storage.kill().await.ok();
                        Err(Error::StageFailed { role: "capture", reason: status.to_string() })
                    };
                }
                status = export.wait() => {
                    let status = status?;
                    error!(%status, "export died, aborting pipeline");
                    let _ = capture.kill().await.ok();
                    let _ = storage.kill().await.ok();
                    return Err(Error::StageFailed { role: "export", reason: status.to_string() });
                }
                status = storage.wait() => {
                    let status = status?;
                    respawns += 1;
                    if respawns > STORAGE_RESPAWN_BUDGET {
                        error!("storage respawn budget exhausted");
                        let _ = capture.kill().await.ok();
                        let _ = export.kill().await.ok();
                        return Err(Error::RespawnBudget { budget: STORAGE_RESPAWN_BUDGET });
                    }
                    warn!(%status, respawns, "storage died, respawning");
                    storage = spawn("storage")?;
                }
            }
        }
    }
}

fn join_stage<T>(handle: thread::JoinHandle<Result<T, Error>>, role: &'static str) -> Result<T, Error> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(Error::StageFailed { role, reason: "stage thread panicked".to_owned() }),
    }
}

/// Waits for a peer's socket file to appear, bounded by [`SOCKET_WAIT`].
fn wait_for_socket(run_dir: &Path, class: PeerClass) -> Result<(), Error> {
    let path = socket_path(run_dir, class);
    let deadline = Instant::now() + SOCKET_WAIT;
    while !path.exists() {
        if Instant::now() > deadline {
            return Err(Error::StageFailed {
                role: "supervisor",
                reason: format!("{} never appeared", path.display()),
            });
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
