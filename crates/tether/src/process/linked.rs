use super::control::ProcessControl;
use super::direct::resolve_executable;
use crate::config::check_path_segment;
use crate::fanout::FanoutWriter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tether_core::{Error, ProcessSpec, Result, Signal, WindowSize};
use tether_link::{Link, LinkWriter};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Where supervised processes live.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Supervision<'a> {
    pub iodaemon: &'a Path,
    pub socket_dir: &'a Path,
    pub link_timeout: Duration,
}

impl Supervision<'_> {
    /// The daemon socket for process `id`, which must name a file directly
    /// inside the socket directory.
    pub(crate) fn socket_path(&self, id: &str) -> Result<PathBuf> {
        let name = format!("{id}.sock");
        check_path_segment(&name).map_err(|_| Error::InvalidHandle(id.to_string()))?;
        Ok(self.socket_dir.join(name))
    }
}

/// Controls a child owned by an i/o daemon, over a link to that daemon.
pub(crate) struct LinkedControl {
    writer: LinkWriter,
    link: Mutex<Option<Link>>,
}

impl LinkedControl {
    /// Links to the daemon behind `socket`, relaying output into the given
    /// writers.
    pub(crate) async fn connect(
        socket: &Path,
        stdout: FanoutWriter,
        stderr: FanoutWriter,
    ) -> Result<Self> {
        let link = Link::connect(socket, stdout, stderr).await?;
        Ok(Self {
            writer: link.writer(),
            link: Mutex::new(Some(link)),
        })
    }

    pub(crate) fn writer(&self) -> LinkWriter {
        self.writer.clone()
    }
}

#[async_trait]
impl ProcessControl for LinkedControl {
    async fn signal(&self, signal: Signal) -> Result<()> {
        self.writer.signal(signal).await
    }

    async fn set_window_size(&self, size: WindowSize) -> Result<()> {
        self.writer.set_window_size(size).await
    }

    async fn wait(&self) -> Result<i32> {
        let link = self
            .link
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Protocol("link was already waited for".into()))?;
        link.wait().await
    }
}

pub(crate) struct Launched {
    pub control: LinkedControl,
    pub pid: u32,
}

/// Starts an i/o daemon for `spec` and links to it. The daemon starts the
/// child as soon as the link connects.
pub(crate) async fn spawn(
    spec: &ProcessSpec,
    id: &str,
    supervision: Supervision<'_>,
    stdout: FanoutWriter,
    stderr: FanoutWriter,
) -> Result<Launched> {
    let program = resolve_executable(spec)?;
    let socket = supervision.socket_path(id)?;

    let mut command = Command::new(supervision.iodaemon);
    command
        .arg("--timeout")
        .arg(format!("{}ms", supervision.link_timeout.as_millis()));
    if let Some(tty) = &spec.tty {
        let size = tty.window_size.unwrap_or_default();
        command
            .arg("--tty")
            .arg("--window-columns")
            .arg(size.columns.to_string())
            .arg("--window-rows")
            .arg(size.rows.to_string());
    }
    command
        .arg("spawn")
        .arg(&socket)
        .arg("--")
        .arg(&program)
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        // keep group-wide signals aimed at this process away from the daemon
        .process_group(0);
    if let Some(dir) = &spec.dir {
        command.current_dir(dir);
    }

    let mut daemon = command
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("failed to start i/o daemon: {}", e)))?;
    let announcements = daemon
        .stdout
        .take()
        .ok_or_else(|| Error::SpawnFailed("i/o daemon stdout was not captured".into()))?;
    let mut announcements = BufReader::new(announcements).lines();

    // the daemon is reaped in the background however this turns out
    tokio::spawn(async move {
        match daemon.wait().await {
            Ok(status) => debug!(%status, "i/o daemon exited"),
            Err(e) => warn!(error = %e, "failed to reap i/o daemon"),
        }
    });

    match next_announcement(&mut announcements).await?.as_deref() {
        Some("ready") => {}
        Some(other) => {
            return Err(Error::SpawnFailed(format!(
                "unexpected i/o daemon output: {:?}",
                other
            )));
        }
        None => {
            return Err(Error::SpawnFailed(
                "i/o daemon exited before it was ready".into(),
            ));
        }
    }

    let control = LinkedControl::connect(&socket, stdout, stderr).await?;

    let pid = match next_announcement(&mut announcements).await? {
        Some(line) => parse_pid(&line)?,
        None => {
            return Err(Error::SpawnFailed(format!(
                "{}: i/o daemon could not start the process",
                spec.path
            )));
        }
    };
    debug!(pid, socket = %socket.display(), "supervised process started");

    Ok(Launched { control, pid })
}

async fn next_announcement(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<Option<String>> {
    Ok(lines.next_line().await?)
}

fn parse_pid(line: &str) -> Result<u32> {
    line.strip_prefix("pid:")
        .and_then(|pid| pid.trim().parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed pid line from i/o daemon: {:?}", line)))
}
