// SPDX-License-Identifier: BSD-3-Clause

//! Per-role mainloop entry points.
//!
//! Each function hosts one stage on a fresh current-thread runtime; the
//! inline supervisor calls them on threads, the `--role` binary entry
//! calls exactly one of them in a child process.

use std::path::Path;

use como_config::Config;
use como_engine::capture::{CaptureLoop, CaptureOptions, CaptureStats};
use como_engine::export::{ExportLoop, ExportStats};
use como_engine::module::{ModuleHandle, ModuleRegistry};
use como_engine::Sniffer;
use como_ipc::{IpcListener, PeerClass};
use como_pkt::Timestamp;
use como_shmem::{Arena, ShmHandle, ShmRegion};
use como_storage::StorageServer;
use tracing::info;

use crate::error::Error;

/// Builds a current-thread runtime.
fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

/// The module registry every stage shares: built-ins only (dynamic
/// loading is out of scope; modules register at build time).
#[must_use]
pub fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    como_modules::register_builtins(&mut registry);
    registry
}

/// Instantiates and initializes every configured module.
pub fn build_modules(config: &Config) -> Result<Vec<ModuleHandle>, Error> {
    let registry = registry();
    let default_ivl = Timestamp::from_duration(config.capture.flush_ivl);
    config
        .modules
        .iter()
        .enumerate()
        .map(|(id, spec)| Ok(ModuleHandle::build(&registry, id as u32, spec, default_ivl)?))
        .collect()
}

fn build_sniffers(config: &Config) -> Result<Vec<(String, Box<dyn Sniffer>)>, Error> {
    config
        .sniffers
        .iter()
        .map(|s| Ok((s.name.clone(), como_sniffers::build(&s.kind, &s.device, &s.args)?)))
        .collect()
}

/// Storage stage: serves streams until `stop` fires (inline) or forever
/// (child process, killed by the supervisor).
pub fn run_storage(
    config: &Config,
    run_dir: &Path,
    stop: Option<tokio::sync::oneshot::Receiver<()>>,
) -> Result<(), Error> {
    let rt = runtime()?;
    let local = tokio::task::LocalSet::new();
    let server = StorageServer::new(config.storage.basedir.clone(), config.storage.segment_size);
    let run_dir = run_dir.to_path_buf();
    rt.block_on(local.run_until(async move {
        let listener = IpcListener::bind_unix(&run_dir, PeerClass::Storage)?;
        match stop {
            Some(stop) => server.run_until(listener, stop).await,
            None => server.run(listener).await,
        }
    }))?;
    Ok(())
}

/// Export stage: connects upstream and downstream, then runs to `EXIT`.
pub fn run_export(config: &Config, run_dir: &Path) -> Result<ExportStats, Error> {
    let modules = build_modules(config)?;
    let rt = runtime()?;
    let local = tokio::task::LocalSet::new();
    let run_dir = run_dir.to_path_buf();
    let stats = rt.block_on(local.run_until(async move {
        let export = ExportLoop::connect(&run_dir, modules).await?;
        export.run().await
    }))?;
    Ok(stats)
}

/// Capture stage: owns the arena and the sniffers.
pub fn run_capture(config: &Config, run_dir: &Path) -> Result<CaptureStats, Error> {
    let modules = build_modules(config)?;
    let sniffers = build_sniffers(config)?;
    let arena = Arena::new(ShmRegion::map(ShmHandle::new(config.memory as usize)?)?);
    let opts = CaptureOptions::from(&config.capture);
    info!(memory = config.memory, sniffers = sniffers.len(), "capture starting");

    let rt = runtime()?;
    let local = tokio::task::LocalSet::new();
    let run_dir = run_dir.to_path_buf();
    let stats = rt.block_on(local.run_until(async move {
        let listener = IpcListener::bind_unix(&run_dir, PeerClass::Capture)?;
        let capture = CaptureLoop::new(arena, opts, modules, sniffers, Some(listener))?;
        capture.run().await
    }))?;
    Ok(stats)
}
