// SPDX-License-Identifier: BSD-3-Clause

//! Query dispatch.
//!
//! Status queries are answered from stream metadata; historical queries
//! walk a module's stream through the storage client, find record
//! boundaries with the module's `load` and render with `print`. The
//! HTTP-ish front-end is out of scope; this is the core walk it drives,
//! plus a minimal line protocol for the query port.

use std::path::Path;

use como_config::Config;
use como_engine::module::{Module, PrintPhase};
use como_ipc::PeerClass;
use como_ipc::message::OpenMode;
use como_pkt::Timestamp;
use como_storage::StorageClient;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::Error;
use crate::roles;

const CHUNK: u64 = 256 * 1024;

/// A parsed historical query.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    /// Module name as configured.
    pub module: String,
    /// Inclusive lower timestamp bound.
    pub start: Option<Timestamp>,
    /// Exclusive upper timestamp bound.
    pub end: Option<Timestamp>,
    /// Format arguments forwarded to the module's print callbacks.
    pub format: Vec<String>,
}

/// Builds the module instance serving a query.
fn query_module(config: &Config, name: &str) -> Result<Box<dyn Module>, Error> {
    let spec = config
        .modules
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::UnknownModule { module: name.to_owned() })?;
    let mut module = roles::registry().build(spec.kind())?;
    let _ = module
        .init(&spec.args)
        .map_err(|source| como_engine::Error::Module { module: name.to_owned(), source })?;
    Ok(module)
}

/// Walks a module's stream and renders matching records into `out`.
/// Returns the number of records printed.
pub async fn run_query(
    run_dir: &Path,
    config: &Config,
    args: &QueryArgs,
    out: &mut String,
) -> Result<usize, Error> {
    let spec = config
        .modules
        .iter()
        .find(|m| m.name == args.module)
        .ok_or_else(|| Error::UnknownModule { module: args.module.clone() })?;
    let mut module = query_module(config, &args.module)?;

    let mut client = StorageClient::connect(run_dir, PeerClass::Query).await?;
    let handle = client.open(spec.output(), OpenMode::ReaderNonBlock, 0).await?;

    out.push_str(&module.print_phase(PrintPhase::Header, &args.format));
    let mut printed = 0usize;
    let mut offset = 0u64;
    'walk: loop {
        let Some(region) = client.region(handle, offset, CHUNK).await? else {
            break;
        };
        let bytes = region.as_slice();
        let mut at = 0usize;
        while at < bytes.len() {
            match module.load(&bytes[at..]) {
                Ok((len, ts)) => {
                    if args.end.is_some_and(|end| ts >= end) {
                        break 'walk;
                    }
                    if !args.start.is_some_and(|start| ts < start) {
                        out.push_str(&module.print(&bytes[at..at + len]));
                        printed += 1;
                    }
                    at += len;
                }
                Err(e) => {
                    // lost sync inside this region; resume at the next one
                    warn!(module = %args.module, error = %e, "record walk lost sync");
                    break;
                }
            }
        }
        offset = region.offset() + bytes.len() as u64;
    }
    out.push_str(&module.print_phase(PrintPhase::Footer, &args.format));
    client.close(handle, false).await?;
    Ok(printed)
}

/// One line of status per configured module: name, output stream and
/// committed stream head.
pub async fn status(run_dir: &Path, config: &Config) -> Result<String, Error> {
    let mut client = StorageClient::connect(run_dir, PeerClass::Query).await?;
    let mut out = String::from("module stream head\n");
    for spec in &config.modules {
        let handle = client.open(spec.output(), OpenMode::ReaderNonBlock, 0).await?;
        out.push_str(&format!("{} {} {}\n", spec.name, spec.output(), handle.offset));
        client.close(handle, false).await?;
    }
    Ok(out)
}

/// Serves the query port with a one-line protocol:
/// `status` or `fetch <module> [start-sec] [end-sec] [format=...]`.
/// Each historical query runs as its own short-lived task.
pub async fn serve(
    listener: TcpListener,
    run_dir: std::path::PathBuf,
    config: Config,
) -> Result<(), Error> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "query connection");
        let run_dir = run_dir.clone();
        let config = config.clone();
        let _ = tokio::task::spawn_local(async move {
            if let Err(e) = serve_one(stream, &run_dir, &config).await {
                warn!(error = %e, "query failed");
            }
        });
    }
}

async fn serve_one(
    stream: tokio::net::TcpStream,
    run_dir: &Path,
    config: &Config,
) -> Result<(), Error> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    let _ = BufReader::new(read).read_line(&mut line).await?;
    let mut words = line.split_whitespace();

    let reply = match words.next() {
        Some("status") => status(run_dir, config).await?,
        Some("fetch") => match words.next() {
            None => "error: fetch needs a module name\n".to_owned(),
            Some(module) => {
                let mut args = QueryArgs { module: module.to_owned(), ..QueryArgs::default() };
                for w in words {
                    if let Some(fmt) = w.strip_prefix("format=") {
                        args.format.push(format!("format={fmt}"));
                    } else if let Ok(sec) = w.parse::<u32>() {
                        let ts = Timestamp::from_secs(sec);
                        if args.start.is_none() {
                            args.start = Some(ts);
                        } else {
                            args.end = Some(ts);
                        }
                    }
                }
                let mut out = String::new();
                match run_query(run_dir, config, &args, &mut out).await {
                    Ok(_) => out,
                    Err(e) => format!("error: {e}\n"),
                }
            }
        },
        _ => "error: expected `status` or `fetch <module> ...`\n".to_owned(),
    };
    write.write_all(reply.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}
