//! I/O daemon for tether.
//!
//! `spawn` owns one child process and serves its stdio on a Unix socket, so
//! the child outlives whichever client happens to be watching it. `link`
//! attaches the current terminal to a daemon started that way.

mod link;
mod spawn;

use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tether_core::WindowSize;

fn parse_duration(s: &str) -> Result<Duration, String> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{s}' is not a valid duration"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!(
            "unknown duration unit '{other}', expected 'ms', 's' or 'm'"
        )),
    }
}

#[derive(Parser)]
#[command(name = "tether-iodaemon")]
#[command(about = "Keeps a process alive independently of whoever watches it")]
#[command(version)]
struct Cli {
    /// How long to wait for the first link before giving up (e.g. 500ms, 10s)
    #[arg(long, default_value = "10s", value_parser = parse_duration, global = true)]
    timeout: Duration,

    /// Run the child on a pseudo-terminal
    #[arg(long, global = true)]
    tty: bool,

    /// Initial terminal width
    #[arg(long, default_value = "80", global = true)]
    window_columns: u16,

    /// Initial terminal height
    #[arg(long, default_value = "24", global = true)]
    window_rows: u16,

    /// Write a diagnostic trace to <socket>.trace
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a program and serve its i/o on a socket
    Spawn {
        /// Control socket path
        socket: PathBuf,

        /// Program followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Attach this terminal to a spawned program
    Link {
        /// Control socket path
        socket: PathBuf,
    },
}

impl Commands {
    fn socket(&self) -> &Path {
        match self {
            Commands::Spawn { socket, .. } | Commands::Link { socket } => socket,
        }
    }
}

fn trace_path(socket: &Path) -> PathBuf {
    let mut path = OsString::from(socket.as_os_str());
    path.push(".trace");
    PathBuf::from(path)
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    if cli.debug {
        let path = trace_path(cli.command.socket());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        // stdout carries the liveness lines, so logs stay on stderr
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("fatal: could not set up tracing: {e:#}");
        std::process::exit(1);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Spawn { socket, command } => {
            let options = spawn::SpawnOptions {
                socket,
                command,
                tty: cli
                    .tty
                    .then(|| WindowSize::new(cli.window_columns, cli.window_rows)),
                timeout: cli.timeout,
            };
            spawn::run(options).await
        }
        Commands::Link { socket } => link::run(&socket).await,
    }
}
