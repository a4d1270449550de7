//! Bazaar Gateway Daemon - marketplace connection/session/RPC runtime
//!
//! This binary runs the gateway: it accepts client connections over
//! tcp/tls/unix transports, upgrades them to the JSON-RPC session
//! protocol, and persists recoverable login state across reconnects.
//!
//! # Usage
//!
//! ```bash
//! # Start the gateway (foreground)
//! bazaard start
//!
//! # Start the gateway (background/daemonized)
//! bazaard start -d
//!
//! # Start with a config file
//! bazaard start --config /etc/bazaar/gateway.toml
//!
//! # Stop the gateway
//! bazaard stop
//!
//! # Check gateway status
//! bazaard status
//!
//! # Enable debug logging
//! RUST_LOG=bazaard=debug bazaard start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: graceful shutdown (drain connections, stop loops)

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bazaard::config::Config;
use bazaard::dispatch::UnroutedHandler;
use bazaard::pool::LoopPool;
use bazaard::server::GatewayServer;

/// Bazaar gateway - marketplace connection runtime
#[derive(Parser, Debug)]
#[command(name = "bazaard", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Path to the TOML configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Stop the running gateway
    Stop,
    /// Show gateway status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("bazaar")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("bazaard.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("bazaard.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let path = pid_file_path();
    let _ = fs::remove_file(path);
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_gateway_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_gateway(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_gateway_running() {
                eprintln!("Gateway is already running (PID {pid})");
                eprintln!("Use 'bazaard stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_gateway(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_gateway_running() {
                println!("Stopping gateway (PID {pid})...");
                stop_gateway(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Gateway stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Gateway did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Gateway is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_gateway_running() {
                println!("Gateway is running (PID {pid})");
                Ok(())
            } else {
                println!("Gateway is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

/// Loads config, builds the pool, and drives the gateway on the accept
/// loop until a shutdown signal arrives.
///
/// Not a `#[tokio::main]` entry point: the execution pool owns every
/// runtime, and this thread becomes the accept loop.
fn run_gateway(config_path: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bazaard=info".parse()?)
                .add_directive("bazaar_core=info".parse()?)
                .add_directive("bazaar_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "bazaar gateway starting"
    );

    let config_path = config_path.or_else(|| env::var("BAZAAR_CONFIG").ok().map(PathBuf::from));
    let config = match config_path {
        Some(path) => {
            info!(config = %path.display(), "loading configuration");
            Config::load(&path)?
        }
        None => Config::default(),
    };

    let pool = Arc::new(LoopPool::new(config.workers)?);
    let cancel = CancellationToken::new();

    // Signal watcher lives on the scheduler loop
    let shutdown_token = cancel.clone();
    pool.scheduler().spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = GatewayServer::new(config, Arc::clone(&pool), Arc::new(UnroutedHandler), cancel);

    if let Err(e) = pool.run(server.run()) {
        error!(error = %e, "Gateway error");
        pool.stop();
        return Err(e.into());
    }

    pool.stop();
    info!("bazaar gateway stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
