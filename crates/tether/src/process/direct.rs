use super::control::ProcessControl;
use crate::fanin::{InputSink, WriteSink};
use async_trait::async_trait;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{BoxedReader, Error, ProcessSpec, Result, Signal, WindowSize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

/// Streams and control for a freshly started child.
pub(crate) struct Started {
    pub control: Box<dyn ProcessControl>,
    pub pid: u32,
    pub stdin: Box<dyn InputSink>,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
}

pub(crate) fn resolve_executable(spec: &ProcessSpec) -> Result<PathBuf> {
    which::which(&spec.path).map_err(|_| Error::UnknownExecutable(spec.path.clone()))
}

pub(crate) fn command(program: &Path, spec: &ProcessSpec) -> Command {
    let mut command = Command::new(program);
    command.args(&spec.args).envs(&spec.env);
    if let Some(dir) = &spec.dir {
        command.current_dir(dir);
    }
    command
}

pub(crate) fn spawn_failed(spec: &ProcessSpec, e: std::io::Error) -> Error {
    Error::SpawnFailed(format!("{}: {}", spec.path, e))
}

/// Starts `spec` with piped stdio in its own process group.
pub(crate) fn spawn(spec: &ProcessSpec) -> Result<Started> {
    let program = resolve_executable(spec)?;

    let mut child = command(&program, spec)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| spawn_failed(spec, e))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed(format!("{}: exited during spawn", spec.path)))?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
        return Err(Error::SpawnFailed(format!(
            "{}: stdio was not captured",
            spec.path
        )));
    };

    debug!(pid, path = %program.display(), "spawned process");

    Ok(Started {
        control: Box::new(ChildControl::new(child, pid)),
        pid,
        stdin: Box::new(WriteSink(stdin)),
        stdout: Box::new(stdout),
        stderr: Some(Box::new(stderr)),
    })
}

/// Controls a child of this process. Signals go to the child's whole
/// process group.
pub(crate) struct ChildControl {
    pid: Pid,
    child: Mutex<Option<Child>>,
    exited: AtomicBool,
}

impl ChildControl {
    pub(crate) fn new(child: Child, pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            child: Mutex::new(Some(child)),
            exited: AtomicBool::new(false),
        }
    }
}

pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 255,
    }
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn signal(&self, signal: Signal) -> Result<()> {
        // the pid may already belong to someone else once reaped
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        killpg(self.pid, signal.as_nix()).map_err(std::io::Error::from)?;
        Ok(())
    }

    async fn set_window_size(&self, _size: WindowSize) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Protocol("process was already waited for".into()))?;

        let status = child.wait().await?;
        self.exited.store(true, Ordering::SeqCst);
        Ok(exit_code(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn unknown_programs_are_rejected() {
        let spec = ProcessSpec::new("definitely-not-a-real-program-7f3a");
        assert!(matches!(
            resolve_executable(&spec),
            Err(Error::UnknownExecutable(_))
        ));
    }

    #[tokio::test]
    async fn signal_reaches_the_process_group() {
        let started = spawn(&ProcessSpec::new("sh").args(["-c", "sleep 30"])).unwrap();

        started.control.signal(Signal::Kill).await.unwrap();

        assert_eq!(started.control.wait().await.unwrap(), 137);
    }

    #[tokio::test]
    async fn signals_after_exit_are_ignored() {
        let started = spawn(&ProcessSpec::new("true")).unwrap();
        assert_eq!(started.control.wait().await.unwrap(), 0);

        started.control.signal(Signal::Kill).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_twice_is_an_error() {
        let started = spawn(&ProcessSpec::new("true")).unwrap();
        started.control.wait().await.unwrap();

        assert!(matches!(
            started.control.wait().await,
            Err(Error::Protocol(_))
        ));
    }
}
