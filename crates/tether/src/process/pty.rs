use super::control::ProcessControl;
use super::direct::{ChildControl, Started, command, resolve_executable, spawn_failed};
use crate::fanin::WriteSink;
use async_trait::async_trait;
use std::os::fd::OwnedFd;
use tether_core::{
    AsyncOwnedFd, Error, ProcessSpec, Pty, Result, Signal, WindowSize, set_controlling_terminal,
    set_window_size,
};
use tracing::debug;

/// Starts `spec` as a session leader with a fresh pseudo-terminal as its
/// controlling terminal. Output arrives merged on the terminal, so there is
/// no separate stderr stream.
pub(crate) fn spawn(spec: &ProcessSpec, size: WindowSize) -> Result<Started> {
    let program = resolve_executable(spec)?;
    let pty = Pty::new(size)?;
    let (stdin, stdout, stderr) = pty.slave_stdio()?;

    let mut command = command(&program, spec);
    command.stdin(stdin).stdout(stdout).stderr(stderr);
    // SAFETY: only setsid and ioctl run between fork and exec.
    unsafe {
        command.pre_exec(set_controlling_terminal);
    }

    let child = command.spawn().map_err(|e| spawn_failed(spec, e))?;
    // the master reports EOF only after every slave handle is gone
    drop(command);
    drop(pty.slave);

    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed(format!("{}: exited during spawn", spec.path)))?;
    debug!(pid, path = %program.display(), ?size, "spawned process on a terminal");

    let reader = AsyncOwnedFd::new(pty.master.try_clone()?)?;
    let writer = AsyncOwnedFd::new(pty.master.try_clone()?)?;

    Ok(Started {
        control: Box::new(PtyControl {
            child: ChildControl::new(child, pid),
            master: pty.master,
        }),
        pid,
        stdin: Box::new(WriteSink(writer)),
        stdout: Box::new(reader),
        stderr: None,
    })
}

struct PtyControl {
    child: ChildControl,
    master: OwnedFd,
}

#[async_trait]
impl ProcessControl for PtyControl {
    async fn signal(&self, signal: Signal) -> Result<()> {
        self.child.signal(signal).await
    }

    /// The kernel delivers SIGWINCH to the foreground group on resize.
    async fn set_window_size(&self, size: WindowSize) -> Result<()> {
        set_window_size(&self.master, size)?;
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        self.child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanin::InputSink;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn child_sees_a_terminal_of_the_requested_size() {
        let spec = ProcessSpec::new("sh").args(["-c", "stty size"]);
        let mut started = spawn(&spec, WindowSize::new(100, 30)).unwrap();

        let mut out = String::new();
        started.stdout.read_to_string(&mut out).await.unwrap();

        assert_eq!(out.trim(), "30 100");
        assert_eq!(started.control.wait().await.unwrap(), 0);
        assert!(started.stderr.is_none());
    }

    #[tokio::test]
    async fn resizing_updates_the_terminal() {
        let spec = ProcessSpec::new("sh").args(["-c", "read _; stty size"]);
        let mut started = spawn(&spec, WindowSize::new(80, 24)).unwrap();

        started
            .control
            .set_window_size(WindowSize::new(132, 43))
            .await
            .unwrap();
        started.stdin.write_all(b"go\n").await.unwrap();

        let mut out = String::new();
        started.stdout.read_to_string(&mut out).await.unwrap();

        assert!(out.contains("43 132"), "unexpected output: {out:?}");
        started.control.wait().await.unwrap();
    }
}
