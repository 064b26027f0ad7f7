//! Conductor Daemon - line-oriented TCP session server
//!
//! This binary runs the conductor server in the foreground or as a
//! background daemon. Clients connect over TCP (telnet, netcat) and get an
//! echo for every line they send plus a periodic heartbeat.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! conductord start
//!
//! # Start the daemon (background/daemonized) on another port
//! conductord start -d --port 4000
//!
//! # Stop the daemon
//! conductord stop
//!
//! # Check daemon status
//! conductord status
//! ```
//!
//! Settings come from `--config`, else `$CONDUCTOR_CONFIG`, else
//! `<config dir>/conductor/conductor.config`. A missing file is created with
//! defaults.

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use conductor_core::Settings;
use conductord::Conductor;

/// Environment variable overriding the settings file location
const CONFIG_ENV: &str = "CONDUCTOR_CONFIG";

/// Conductor daemon - line-oriented TCP session server
#[derive(Parser, Debug)]
#[command(name = "conductord", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Settings file to load (and save on exit)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Override the bind address for this run
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Override the bind port for this run
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("conductor")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("conductord.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("conductord.log")
}

fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("conductor.config")
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

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
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
        host: None,
        port: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            host,
            port,
        } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'conductord stop' to stop it first.");
                process::exit(1);
            }

            // Resolve before daemonizing: the daemon's working directory is `/`.
            let config = absolute(config_path(config));

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config, host, port);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Makes a relative path absolute against the current directory.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
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

#[tokio::main]
async fn run_daemon(config: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let stored = Settings::load(&config)
        .with_context(|| format!("Failed to load settings from {}", config.display()))?;

    let level = if stored.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("conductord={level}").parse()?)
                .add_directive(format!("conductor={level}").parse()?)
                .add_directive(format!("conductor_core={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = %config.display(),
        "Conductor daemon starting"
    );

    // Command-line overrides apply to this run only and are not saved.
    let mut settings = stored.clone();
    if let Some(host) = host {
        settings.host_address = host;
    }
    if let Some(port) = port {
        settings.host_port = port;
    }

    let conductor = Conductor::new(settings);
    let result = conductor
        .run(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    if let Err(e) = stored.save(&config) {
        error!(error = %e, "Failed to save settings");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Conductor daemon stopped");
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
