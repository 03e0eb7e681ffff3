//! strata operator CLI.
//!
//! Runs an origin in-process and issues operations through a context's
//! blocking client, exactly as an embedding caller would.
//!
//! Usage:
//!   # Keep an origin with three contexts running until Ctrl-C
//!   strata --container /var/lib/strata/origin.bin serve --contexts 3
//!
//!   # One-shot operations
//!   strata --container origin.bin put /notes/today.md ./today.md
//!   strata --container origin.bin ls /notes
//!   strata --config strata.ron cat /notes/today.md
//!
//! `RUST_LOG` controls log output (default `info`), written to stderr.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use strata_kernel::coord::{ContextHandle, Origin};
use strata_kernel::StrataConfig;
use strata_types::{FileType, Op, Reply};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DUMP_TIMEOUT: Duration = Duration::from_secs(30);

/// Log-structured VFS with synchronous cross-context access.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Run a strata origin and operate on its store")]
struct Args {
    /// RON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Container file, overriding the config
    #[arg(long, global = true)]
    container: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run contexts until interrupted
    Serve {
        /// Number of contexts to spawn
        #[arg(long, default_value_t = 1)]
        contexts: usize,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Store a local file (or stdin) at PATH
    Put { path: String, file: Option<PathBuf> },
    /// Remove a file, or a directory tree with -r
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },
    /// Show attributes
    Stat { path: String },
    /// Rewrite the container without superseded ranges
    Compact,
    /// List every stored path
    Dump,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let origin = Origin::new(config);

    match args.command {
        Command::Serve { contexts } => serve(&origin, contexts.max(1)).await,
        command => {
            let context = ready_context(&origin).await?;
            let outcome = run_one(&context, command).await;
            context.shutdown().await;
            outcome
        }
    }
}

fn load_config(args: &Args) -> Result<StrataConfig> {
    let mut config = match &args.config {
        Some(path) => StrataConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StrataConfig::default(),
    };
    if let Some(container) = &args.container {
        config.store.container = container.clone();
    }
    Ok(config)
}

fn ready_timeout(origin: &Origin) -> Duration {
    origin.config().coordinator.leader_timeout() * 2
}

async fn ready_context(origin: &Origin) -> Result<ContextHandle> {
    let context = origin.spawn_context()?;
    context.wait_ready(ready_timeout(origin)).await?;
    Ok(context)
}

async fn serve(origin: &Origin, count: usize) -> Result<()> {
    let mut contexts = Vec::with_capacity(count);
    for _ in 0..count {
        contexts.push(origin.spawn_context()?);
    }
    for context in &contexts {
        let role = context.wait_ready(ready_timeout(origin)).await?;
        tracing::info!(context = %context.id(), ?role, "context ready");
    }
    tracing::info!(
        container = %origin.config().store.container.display(),
        mode = %origin.config().store.mode,
        contexts = count,
        "strata serving, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");

    // Secondaries first so the primary is not replaced on the way out.
    contexts.sort_by_key(|c| c.is_primary());
    for context in contexts {
        context.shutdown().await;
    }
    Ok(())
}

/// Issue one op through the context's blocking client.
async fn call(context: &ContextHandle, op: Op) -> Result<Reply> {
    let client = context.client().clone();
    let reply = tokio::task::spawn_blocking(move || client.call(op)).await??;
    Ok(reply)
}

async fn run_one(context: &ContextHandle, command: Command) -> Result<()> {
    let mut out = Vec::new();
    match command {
        Command::Serve { .. } => anyhow::bail!("serve runs its own contexts"),
        Command::Ls { path } => {
            let mut entries = call(context, Op::readdir(path)).await?.into_entries()?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries {
                let suffix = match entry.kind {
                    FileType::Directory => "/",
                    FileType::Symlink => "@",
                    FileType::File => "",
                };
                writeln!(out, "{}{suffix}", entry.name)?;
            }
        }
        Command::Cat { path } => {
            let bytes = call(context, Op::read(path)).await?.into_bytes()?;
            out.write_all(&bytes)?;
        }
        Command::Put { path, file } => {
            let data = match file {
                Some(file) => std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut data = Vec::new();
                    std::io::stdin().read_to_end(&mut data)?;
                    data
                }
            };
            let len = data.len();
            call(context, Op::write(path.clone(), data)).await?;
            call(context, Op::Flush).await?;
            tracing::info!(path = %path, bytes = len, "stored");
        }
        Command::Rm { path, recursive } => {
            let op = if recursive {
                Op::Rmdir { path, recursive }
            } else {
                Op::unlink(path)
            };
            call(context, op).await?;
            call(context, Op::Flush).await?;
        }
        Command::Mkdir { path, parents } => {
            call(context, Op::mkdir(path, parents)).await?;
            call(context, Op::Flush).await?;
        }
        Command::Stat { path } => {
            let attr = call(context, Op::stat(path.clone())).await?.into_attr()?;
            writeln!(out, "path:  {path}")?;
            writeln!(out, "kind:  {:?}", attr.kind)?;
            writeln!(out, "size:  {}", attr.size)?;
            writeln!(out, "mode:  {:o}", attr.mode)?;
            writeln!(out, "owner: {}:{}", attr.uid, attr.gid)?;
            writeln!(out, "mtime: {}", attr.mtime)?;
            writeln!(out, "atime: {}", attr.atime)?;
            writeln!(out, "links: {}", attr.nlink)?;
        }
        Command::Compact => {
            let reclaimed = call(context, Op::Compact).await?.into_count()?;
            writeln!(out, "reclaimed {reclaimed} bytes")?;
        }
        Command::Dump => {
            let client = context.client().clone();
            let text = tokio::task::spawn_blocking(move || client.request_path_dump(DUMP_TIMEOUT)).await??;
            if !text.is_empty() {
                writeln!(out, "{text}")?;
            }
        }
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&out)?;
    stdout.flush()?;
    Ok(())
}
