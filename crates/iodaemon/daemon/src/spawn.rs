use anyhow::{Context, bail};
use nix::sys::signal::{Signal as NixSignal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    AsyncOwnedFd, Pty, WindowSize, pipe, set_controlling_terminal, set_window_size,
};
use tether_link::{Input, InputReader, send_descriptors, signal_from_code};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct SpawnOptions {
    pub socket: PathBuf,
    pub command: Vec<String>,
    pub tty: Option<WindowSize>,
    pub timeout: Duration,
}

/// The read ends every linking client receives.
struct Handout {
    stdout: OwnedFd,
    stderr: OwnedFd,
    exit_status: OwnedFd,
}

impl Handout {
    async fn send(&self, stream: &UnixStream) -> tether_core::Result<()> {
        send_descriptors(stream, [&self.stdout, &self.stderr, &self.exit_status]).await
    }
}

/// The child's end of each stream, consumed by the spawn.
struct ChildStdio {
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
}

/// What connections share once the child runs.
struct Session {
    pid: Pid,
    stdin: Mutex<Option<AsyncOwnedFd>>,
    terminal: Option<OwnedFd>,
}

impl Session {
    async fn write_stdin(&self, data: &[u8]) {
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            debug!("dropping input after stdin was closed");
            return;
        };
        if let Err(e) = writer.write_all(data).await {
            debug!(error = %e, "writing to child stdin failed");
        }
    }

    /// Closes the child's stdin. Returns false if it was already closed.
    async fn close_stdin(&self) -> bool {
        self.stdin.lock().await.take().is_some()
    }

    fn resize(&self, size: WindowSize) {
        let Some(terminal) = &self.terminal else {
            debug!("ignoring window size for a child without a terminal");
            return;
        };
        if let Err(e) = set_window_size(terminal, size) {
            warn!(error = %e, "failed to resize terminal");
            return;
        }
        if let Err(e) = kill(self.pid, NixSignal::SIGWINCH) {
            debug!(error = %e, "failed to notify child of resize");
        }
    }

    fn signal(&self, code: i32) {
        let signal = signal_from_code(code);
        debug!(pid = %self.pid, ?signal, "delivering signal");
        if let Err(e) = kill(self.pid, signal) {
            debug!(error = %e, "failed to deliver signal");
        }
    }
}

/// Runs the daemon until the child exits. Every setup failure is returned
/// before the child starts.
pub async fn run(options: SpawnOptions) -> anyhow::Result<i32> {
    let program = options.command.first().context("no program given")?;
    let program_path =
        which::which(program).with_context(|| format!("unknown executable {program}"))?;

    let (exit_status_read, exit_status_write) = pipe().context("failed to create status pipe")?;
    let (handout_out, handout_err, child_stdio, stdin, terminal) = match options.tty {
        Some(size) => {
            let pty = Pty::new(size).context("failed to open pty")?;
            let (stdin, stdout, stderr) = pty.slave_stdio()?;
            // stderr shares the terminal; links still expect a stream for it
            let (dummy_err, _) = pipe().context("failed to create stderr pipe")?;
            let writer = pty.master.try_clone()?;
            let terminal = pty.master.try_clone()?;
            (
                pty.master,
                dummy_err,
                ChildStdio {
                    stdin,
                    stdout,
                    stderr,
                },
                writer,
                Some(terminal),
            )
        }
        None => {
            let (in_r, in_w) = pipe().context("failed to create stdin pipe")?;
            let (out_r, out_w) = pipe().context("failed to create stdout pipe")?;
            let (err_r, err_w) = pipe().context("failed to create stderr pipe")?;
            (
                out_r,
                err_r,
                ChildStdio {
                    stdin: Stdio::from(in_r),
                    stdout: Stdio::from(out_w),
                    stderr: Stdio::from(err_w),
                },
                in_w,
                None,
            )
        }
    };

    let handout = Handout {
        stdout: handout_out,
        stderr: handout_err,
        exit_status: exit_status_read,
    };

    if let Some(parent) = options.socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let listener = UnixListener::bind(&options.socket)
        .with_context(|| format!("failed to listen on {}", options.socket.display()))?;

    let mut command = build_command(
        &program_path,
        &options.command[1..],
        child_stdio,
        options.tty.is_some(),
    );

    announce("ready")?;
    info!(
        socket = %options.socket.display(),
        program = %program_path.display(),
        "waiting for first link"
    );

    let first = match tokio::time::timeout(options.timeout, listener.accept()).await {
        Ok(accepted) => accepted.context("failed to accept first link")?.0,
        Err(_) => {
            let _ = std::fs::remove_file(&options.socket);
            bail!("timed out waiting for initial link after {:?}", options.timeout);
        }
    };
    handout
        .send(&first)
        .await
        .context("failed to hand descriptors to first link")?;

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program_path.display()))?;
    // the child's stream ends live in the command; drop them so EOF propagates
    drop(command);

    let pid = child.id().context("child exited before reporting its pid")?;
    announce(&format!("pid: {pid}"))?;
    detach_stdio().context("failed to detach from stdio")?;
    info!(pid, "child started");

    let session = Arc::new(Session {
        pid: Pid::from_raw(pid as i32),
        stdin: Mutex::new(Some(AsyncOwnedFd::new(stdin)?)),
        terminal,
    });
    tokio::spawn(serve(first, session.clone()));

    let code = supervise(&mut child, &listener, &handout, &session).await?;
    info!(code, "child exited");

    File::from(exit_status_write)
        .write_all(format!("{code}\n").as_bytes())
        .context("failed to report exit status")?;
    let _ = std::fs::remove_file(&options.socket);

    Ok(0)
}

fn build_command(program: &Path, args: &[String], stdio: ChildStdio, tty: bool) -> Command {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr);

    // SAFETY: the hook runs between fork and exec and only makes
    // async-signal-safe syscalls (prctl, setsid, ioctl).
    unsafe {
        command.pre_exec(move || {
            #[cfg(target_os = "linux")]
            nix::sys::prctl::set_pdeathsig(NixSignal::SIGKILL).map_err(std::io::Error::from)?;
            if tty {
                set_controlling_terminal()?;
            }
            Ok(())
        });
    }

    command
}

/// Accepts further links until the child exits, then returns its exit code.
async fn supervise(
    child: &mut Child,
    listener: &UnixListener,
    handout: &Handout,
    session: &Arc<Session>,
) -> anyhow::Result<i32> {
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for child")?;
                return Ok(exit_code(status));
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept link");
                        continue;
                    }
                };
                if let Err(e) = handout.send(&stream).await {
                    warn!(error = %e, "failed to hand descriptors to link");
                    continue;
                }
                debug!("link attached");
                tokio::spawn(serve(stream, session.clone()));
            }
        }
    }
}

/// Decodes one link's input until it hangs up.
async fn serve(stream: UnixStream, session: Arc<Session>) {
    let mut reader = InputReader::new(stream);
    loop {
        let input = match reader.next().await {
            Ok(Some(input)) => input,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "link sent an undecodable frame");
                break;
            }
        };

        match input {
            Input::Data(data) => session.write_stdin(&data).await,
            Input::Eof => {
                if !session.close_stdin().await {
                    debug!("repeated eof, closing link");
                    break;
                }
            }
            Input::WindowSize(size) => session.resize(size),
            Input::Signal(code) => session.signal(code),
        }
    }
    debug!("link detached");
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 255,
    }
}

fn announce(line: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Points stdin, stdout and stderr at /dev/null so whoever started us can
/// stop reading without affecting the child.
fn detach_stdio() -> anyhow::Result<()> {
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in 0..=2 {
        nix::unistd::dup2(null.as_raw_fd(), target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod exit_codes {
        use super::*;

        #[test]
        fn normal_exit_keeps_its_code() {
            assert_eq!(exit_code(std::process::ExitStatus::from_raw(42 << 8)), 42);
            assert_eq!(exit_code(std::process::ExitStatus::from_raw(0)), 0);
        }

        #[test]
        fn signaled_exit_reports_128_plus_signal() {
            assert_eq!(exit_code(std::process::ExitStatus::from_raw(9)), 137);
            assert_eq!(exit_code(std::process::ExitStatus::from_raw(15)), 143);
        }
    }

    mod session {
        use super::*;

        fn session_with_pipe() -> (Session, OwnedFd) {
            let (read, write) = pipe().unwrap();
            let session = Session {
                pid: Pid::from_raw(i32::MAX),
                stdin: Mutex::new(Some(AsyncOwnedFd::new(write).unwrap())),
                terminal: None,
            };
            (session, read)
        }

        #[tokio::test]
        async fn stdin_closes_once() {
            let (session, _read) = session_with_pipe();
            assert!(session.close_stdin().await);
            assert!(!session.close_stdin().await);
        }

        #[tokio::test]
        async fn data_after_close_is_dropped() {
            let (session, read) = session_with_pipe();
            session.write_stdin(b"kept").await;
            session.close_stdin().await;
            session.write_stdin(b"dropped").await;

            let mut received = String::new();
            std::io::Read::read_to_string(&mut File::from(read), &mut received).unwrap();
            assert_eq!(received, "kept");
        }
    }
}
