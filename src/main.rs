//! chitusync CLI
//!
//! `watch` is the long-running mode; everything else is a one-shot command
//! against the board. Configuration comes from an optional TOML file with
//! CLI flags overriding it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use chitusync::config::SyncConfig;
use chitusync::events;
use chitusync::mirror;
use chitusync::print_job::PrintController;
use chitusync::progress::{render_events, TransferBar};
use chitusync::protocol::{self, Command as McCommand};
use chitusync::reconcile::Pipeline;
use chitusync::session::{shared, Connection};
use chitusync::transfer;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Mirror a folder of sliced print files onto a ChiTu-class printer board"
)]
struct Args {
    /// Config file (TOML); flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Folder to mirror
    #[arg(short, long, global = true)]
    folder: Option<PathBuf>,

    /// Printer host or IP
    #[arg(short, long, global = true)]
    printer: Option<String>,

    /// Printer control port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Pause between upload chunks, in milliseconds
    #[arg(long, global = true)]
    chunk_delay_ms: Option<u64>,

    /// Keep files on the board that are gone locally
    #[arg(long, global = true)]
    no_delete: bool,

    /// Append a JSONL record per reconciliation operation
    #[arg(long, global = true)]
    op_log: Option<PathBuf>,

    /// Verbose logging (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Watch the folder and keep the board in sync until interrupted
    Watch,
    /// Run a single reconciliation pass and exit
    Sync,
    /// List the files on the board
    List,
    /// Upload one file to the board
    Upload { file: PathBuf },
    /// Delete one file from the board
    Delete { name: String },
    /// Start printing a file already on the board
    Print {
        name: String,
        /// Keep polling status until the print finishes
        #[arg(long)]
        watch: bool,
    },
    /// Stop the running print
    Stop,
    /// Query print status once
    Status,
    /// Show the printer's identity
    Info,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "chitusync=info",
        1 => "chitusync=debug",
        _ => "chitusync=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_target(false)
        .init();
}

/// Merge the config file (if any) with CLI overrides.
fn build_config(args: &Args) -> Result<SyncConfig> {
    let mut cfg = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(folder) = &args.folder {
        cfg.sync_folder = folder.clone();
    }
    if let Some(printer) = &args.printer {
        cfg.printer_host = printer.clone();
    }
    if let Some(port) = args.port {
        cfg.printer_port = port;
    }
    if let Some(delay) = args.chunk_delay_ms {
        cfg.chunk_delay_ms = delay;
    }
    if args.no_delete {
        cfg.remote_delete = false;
    }
    if let Some(path) = &args.op_log {
        cfg.op_log = Some(path.clone());
    }
    Ok(cfg)
}

/// Config for commands that only need a reachable printer, not a folder.
fn printer_only_config(args: &Args) -> Result<SyncConfig> {
    let cfg = build_config(args)?;
    if cfg.printer_host.trim().is_empty() {
        bail!("no printer host given (use --printer or a config file)");
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Cmd::Watch => watch_cmd(&args).await,
        Cmd::Sync => sync_cmd(&args).await,
        Cmd::List => list_cmd(&args).await,
        Cmd::Upload { file } => upload_cmd(&args, file).await,
        Cmd::Delete { name } => delete_cmd(&args, name).await,
        Cmd::Print { name, watch } => print_cmd(&args, name, *watch).await,
        Cmd::Stop => stop_cmd(&args).await,
        Cmd::Status => status_cmd(&args).await,
        Cmd::Info => info_cmd(&args).await,
    }
}

async fn watch_cmd(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let (tx, rx) = events::channel();
    let pipeline = Pipeline::new(config, tx)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let renderer = tokio::spawn(render_events(rx));
    pipeline.run(shutdown_rx).await?;
    renderer.abort();
    Ok(())
}

async fn sync_cmd(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let (tx, rx) = events::channel();
    let mut pipeline = Pipeline::new(config, tx)?;

    let renderer = tokio::spawn(render_events(rx));
    pipeline.run_pass().await;
    drop(pipeline);
    // Channel closes with the pipeline; the renderer drains and exits
    let _ = renderer.await;
    Ok(())
}

async fn list_cmd(args: &Args) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, _rx) = events::channel();
    let mut conn = Connection::new(config.endpoint(), tx);
    let session = conn.ensure_connected().await?;

    let snapshot = mirror::list_remote(session).await?;
    if snapshot.files.is_empty() {
        println!("(no files on board)");
        return Ok(());
    }
    for record in snapshot.files.values() {
        println!("{:>12}  {}", record.size, record.name);
    }
    Ok(())
}

async fn upload_cmd(args: &Args, file: &PathBuf) -> Result<()> {
    let config = printer_only_config(args)?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("file has no usable name")?
        .to_string();
    if !protocol::is_print_file(&name) {
        bail!("{name} is not a print file ({:?})", protocol::PRINT_EXTENSIONS);
    }

    let (tx, mut rx) = events::channel();
    let mut conn = Connection::new(config.endpoint(), tx.clone());
    let session = conn.ensure_connected().await?;

    let renderer = tokio::spawn(async move {
        let mut bar = TransferBar::new();
        while let Some(event) = rx.recv().await {
            if let events::SyncEvent::Transfer(progress) = event {
                bar.update(&progress);
            }
        }
    });
    let result =
        transfer::upload(session, file, &name, config.endpoint().chunk_delay, &tx).await;
    drop(conn);
    drop(tx);
    let _ = renderer.await;
    result?;
    println!("uploaded {name}");
    Ok(())
}

async fn delete_cmd(args: &Args, name: &str) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, _rx) = events::channel();
    let mut conn = Connection::new(config.endpoint(), tx);
    let session = conn.ensure_connected().await?;

    let reply = session.exchange(&McCommand::Delete(name.to_string())).await?;
    if protocol::is_error_reply(&reply) {
        bail!("board refused delete of {name}: {reply}");
    }
    println!("deleted {name}");
    Ok(())
}

async fn print_cmd(args: &Args, name: &str, watch_it: bool) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, rx) = events::channel();
    let conn = shared(Connection::new(config.endpoint(), tx.clone()));
    let controller = PrintController::new(conn, tx, config.status_poll_interval());

    controller.start_print(name).await?;
    println!("print started: {name}");
    if watch_it {
        let renderer = tokio::spawn(render_events(rx));
        let outcome = controller.watch_job().await;
        drop(controller);
        renderer.abort();
        outcome?;
        println!("print finished");
    }
    Ok(())
}

async fn stop_cmd(args: &Args) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, _rx) = events::channel();
    let conn = shared(Connection::new(config.endpoint(), tx.clone()));
    let controller = PrintController::new(conn, tx, config.status_poll_interval());
    controller.stop_print().await?;
    println!("print stopped");
    Ok(())
}

async fn status_cmd(args: &Args) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, _rx) = events::channel();
    let conn = shared(Connection::new(config.endpoint(), tx.clone()));
    let controller = PrintController::new(conn, tx, config.status_poll_interval());

    let status = controller.poll_status().await?;
    if status.is_active() {
        println!(
            "printing: {:.1}% ({}/{} bytes)",
            status.percent(),
            status.bytes_read,
            status.total_bytes
        );
    } else {
        println!("idle");
    }
    Ok(())
}

async fn info_cmd(args: &Args) -> Result<()> {
    let config = printer_only_config(args)?;
    let (tx, _rx) = events::channel();
    let mut conn = Connection::new(config.endpoint(), tx);
    conn.ensure_connected().await?;

    let info = conn
        .printer_info()
        .context("connected but no identity received")?;
    println!("name:     {}", info.name);
    println!("firmware: {}", info.version);
    println!("mac:      {}", info.mac);
    println!("ip:       {}", info.ip);
    println!("id:       {}", info.id);
    Ok(())
}
