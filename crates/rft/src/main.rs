//! rft — robust file transfer over UDP, one binary for both roles.
//!
//! Server mode serves files from a root directory; client mode requests
//! files from a host and stores them under a destination directory.
//! Exit codes: 0 on clean completion, 1 when any transfer failed, 2 on a
//! usage error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use rft_core::config::EngineConfig;
use rft_engine::{ClientEngine, Event, EventQueue, GilbertLoss, ServerEngine, UdpDriver};

#[derive(Debug, Parser)]
#[command(name = "rft", about = "Robust file transfer over UDP", version)]
struct Args {
    /// Operate in server mode
    #[arg(short = 's', long = "server", conflicts_with_all = ["host", "host_flag"])]
    server: bool,

    /// The hostname to request from (hostname or IPv4 address)
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Files to transfer
    #[arg(value_name = "FILES")]
    files: Vec<String>,

    /// The hostname to request from (flag form)
    #[arg(long = "host", value_name = "HOST")]
    host_flag: Option<String>,

    /// Files to transfer (flag form)
    #[arg(long = "files", value_name = "FILE", num_args = 1..)]
    files_flag: Vec<String>,

    /// The port number to use (the client binds port + 1)
    #[arg(short = 't', long = "port", value_name = "PORT", default_value_t = 8080)]
    port: u16,

    /// Packet loss probability (Gilbert model, good → bad)
    #[arg(short = 'p', value_name = "P")]
    p: Option<f64>,

    /// Packets-remain-lost probability (Gilbert model, bad → good)
    #[arg(short = 'q', value_name = "Q")]
    q: Option<f64>,

    /// The destination of the transferred files
    #[arg(long = "dest", value_name = "PATH", default_value = "/tmp")]
    dest: PathBuf,

    /// Directory served files are looked up under (server mode)
    #[arg(long = "root", value_name = "PATH", default_value = ".")]
    root: PathBuf,
}

enum Mode {
    Server,
    Client { host: String, files: Vec<String> },
}

impl Args {
    /// Resolve the role. Positional and flag forms are interchangeable.
    fn mode(&self) -> Result<Mode, String> {
        let host = self.host.clone().or_else(|| self.host_flag.clone());
        let mut files = self.files.clone();
        files.extend(self.files_flag.iter().cloned());

        if self.server {
            if !files.is_empty() {
                return Err("cannot specify files in server mode".into());
            }
            return Ok(Mode::Server);
        }
        match host {
            Some(host) => {
                if files.is_empty() {
                    return Err("must specify files in client mode".into());
                }
                Ok(Mode::Client { host, files })
            }
            None => Err("run with -s for server mode or give a host for client mode".into()),
        }
    }

    /// Gilbert parameters: if only one of {p, q} is given the other
    /// defaults to it; if neither, the channel is transparent.
    fn loss(&self) -> (f64, f64) {
        match (self.p, self.q) {
            (Some(p), Some(q)) => (p, q),
            (Some(p), None) => (p, p),
            (None, Some(q)) => (q, q),
            (None, None) => (0.0, 1.0),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug rft -s
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("rft: {message}");
            return ExitCode::from(2);
        }
    };

    let result = match mode {
        Mode::Server => run_server(&args).await.map(|()| ExitCode::SUCCESS),
        Mode::Client { host, files } => run_client(&args, host, files).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("rft: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Load config and overlay the CLI flags.
fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = EngineConfig::load().context("loading configuration")?;
    config.transport.port = args.port;
    config.transport.dest = args.dest.clone();
    config.transport.serve_root = args.root.clone();
    let (p, q) = args.loss();
    config.transport.loss_p = p;
    config.transport.loss_q = q;
    Ok(config)
}

/// Set the abort flag and wake the dispatcher on Ctrl-C. The handler does
/// nothing heavier; all teardown happens on the dispatcher.
fn watch_for_interrupt(queue: Arc<EventQueue>, abort: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            abort.store(true, Ordering::SeqCst);
            queue.push(Event::Abort);
        }
    });
}

async fn run_server(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let bind: SocketAddr = ([0, 0, 0, 0], config.transport.port).into();

    let queue = Arc::new(EventQueue::new());
    let abort = Arc::new(AtomicBool::new(false));
    let loss = GilbertLoss::new(config.transport.loss_p, config.transport.loss_q);
    let (driver, sink) = UdpDriver::bind(bind, queue.clone(), loss, abort.clone()).await?;
    tracing::info!(%bind, "server listening");

    let driver_task = tokio::spawn(driver.run());
    watch_for_interrupt(queue.clone(), abort.clone());

    ServerEngine::new(queue, sink, config, abort).run().await?;

    // The engine dropped its sink; the driver drains queued sends and exits.
    let _ = driver_task.await;
    Ok(())
}

async fn run_client(args: &Args, host: String, files: Vec<String>) -> Result<ExitCode> {
    let config = build_config(args)?;

    let server = tokio::net::lookup_host((host.as_str(), config.transport.port))
        .await
        .with_context(|| format!("resolving {host}"))?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("no IPv4 address for {host}"))?;
    let bind: SocketAddr = ([0, 0, 0, 0], config.transport.port.wrapping_add(1)).into();

    let queue = Arc::new(EventQueue::new());
    let abort = Arc::new(AtomicBool::new(false));
    let loss = GilbertLoss::new(config.transport.loss_p, config.transport.loss_q);
    let (driver, sink) = UdpDriver::bind(bind, queue.clone(), loss, abort.clone()).await?;
    tracing::info!(%bind, %server, "client running");

    let driver_task = tokio::spawn(driver.run());
    watch_for_interrupt(queue.clone(), abort.clone());

    let reports = ClientEngine::new(queue, sink, config, abort, server)
        .run(files)
        .await;
    // The engine dropped its sink; the driver drains queued sends (the
    // final finish messages among them) and exits.
    let _ = driver_task.await;

    let mut failed = false;
    for report in &reports {
        match &report.outcome {
            Ok(path) => println!("{}: stored at {}", report.filename, path.display()),
            Err(error) => {
                failed = true;
                eprintln!("rft: {}: {error}", report.filename);
            }
        }
    }
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
