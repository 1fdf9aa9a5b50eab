//! End-to-end tests driving the real `tether-iodaemon` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tether_link::{Link, Signal, WindowSize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::process::{Child, ChildStdout, Command};

const IODAEMON: &str = env!("CARGO_BIN_EXE_tether-iodaemon");
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

struct Daemon {
    child: Child,
    announcements: Lines<BufReader<ChildStdout>>,
}

impl Daemon {
    fn spawn(socket: &Path, flags: &[&str], command: &[&str]) -> Self {
        let mut child = Command::new(IODAEMON)
            .args(flags)
            .arg("spawn")
            .arg(socket)
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to start tether-iodaemon");
        let stdout = child.stdout.take().unwrap();

        Self {
            child,
            announcements: BufReader::new(stdout).lines(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(STEP_TIMEOUT, self.announcements.next_line())
            .await
            .expect("timed out waiting for the daemon")
            .unwrap()
    }

    async fn expect_ready(&mut self) {
        assert_eq!(self.next_line().await.as_deref(), Some("ready"));
    }

    async fn expect_pid(&mut self) -> u32 {
        let line = self.next_line().await.expect("daemon exited before pid");
        line.strip_prefix("pid: ")
            .and_then(|pid| pid.parse().ok())
            .unwrap_or_else(|| panic!("unexpected announcement {line:?}"))
    }

    async fn exit_code(mut self) -> Option<i32> {
        tokio::time::timeout(STEP_TIMEOUT, self.child.wait())
            .await
            .expect("daemon did not exit")
            .unwrap()
            .code()
    }
}

struct Output {
    stdout: DuplexStream,
    stderr: DuplexStream,
}

async fn connect(socket: &Path) -> (Link, Output) {
    let (stdout, stdout_reader) = tokio::io::duplex(64 * 1024);
    let (stderr, stderr_reader) = tokio::io::duplex(64 * 1024);
    let link = Link::connect(socket, stdout, stderr).await.unwrap();
    (
        link,
        Output {
            stdout: stdout_reader,
            stderr: stderr_reader,
        },
    )
}

async fn read_all(mut reader: DuplexStream) -> String {
    let mut out = String::new();
    tokio::time::timeout(STEP_TIMEOUT, reader.read_to_string(&mut out))
        .await
        .expect("output never ended")
        .unwrap();
    out
}

async fn wait(link: Link) -> i32 {
    tokio::time::timeout(STEP_TIMEOUT, link.wait())
        .await
        .expect("link never finished")
        .unwrap()
}

fn socket_in(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

mod spawn {
    use super::*;

    #[tokio::test]
    async fn stdin_round_trips_and_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "cat.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["sh", "-c", "cat <&0; exit 42"]);
        daemon.expect_ready().await;

        let (link, output) = connect(&socket).await;
        daemon.expect_pid().await;

        link.write(b"hello\ngoodbye").await.unwrap();
        link.close().await.unwrap();

        assert_eq!(wait(link).await, 42);
        assert_eq!(read_all(output.stdout).await, "hello\ngoodbye");
        assert_eq!(read_all(output.stderr).await, "");
        assert_eq!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn sequential_runs_reuse_the_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "echo.sock");

        for _ in 0..100 {
            let mut daemon = Daemon::spawn(&socket, &[], &["echo", "hi"]);
            daemon.expect_ready().await;

            let (link, output) = connect(&socket).await;
            daemon.expect_pid().await;

            assert_eq!(wait(link).await, 0);
            assert!(read_all(output.stdout).await.contains("hi"));
            assert_eq!(daemon.exit_code().await, Some(0));
            assert!(!socket.exists());
        }
    }

    #[tokio::test]
    async fn stderr_is_handed_out_separately() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "err.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["sh", "-c", "echo out; echo err >&2"]);
        daemon.expect_ready().await;

        let (link, output) = connect(&socket).await;
        assert_eq!(wait(link).await, 0);

        assert_eq!(read_all(output.stdout).await, "out\n");
        assert_eq!(read_all(output.stderr).await, "err\n");
        assert_eq!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn every_link_sees_the_same_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "shared.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["sh", "-c", "read _; exit 3"]);
        daemon.expect_ready().await;

        let (first, _first_output) = connect(&socket).await;
        daemon.expect_pid().await;
        let (second, _second_output) = connect(&socket).await;

        second.write(b"go\n").await.unwrap();

        assert_eq!(wait(first).await, 3);
        assert_eq!(wait(second).await, 3);
        assert_eq!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn signals_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "sleep.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["sleep", "30"]);
        daemon.expect_ready().await;

        let (link, _output) = connect(&socket).await;
        daemon.expect_pid().await;

        link.signal(Signal::Kill).await.unwrap();
        assert_eq!(wait(link).await, 128 + 9);
        assert_eq!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn repeated_eof_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "eof.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["cat"]);
        daemon.expect_ready().await;

        let (link, output) = connect(&socket).await;
        link.write(b"once").await.unwrap();
        link.close().await.unwrap();
        // the daemon may already have hung up on this link
        let _ = link.close().await;

        assert_eq!(wait(link).await, 0);
        assert_eq!(read_all(output.stdout).await, "once");
        assert_eq!(daemon.exit_code().await, Some(0));
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn no_link_within_the_timeout_exits_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "lonely.sock");
        let marker = dir.path().join("started");
        let script = format!("touch {}", marker.display());
        let mut daemon = Daemon::spawn(&socket, &["--timeout", "200ms"], &["sh", "-c", &script]);
        daemon.expect_ready().await;

        assert_eq!(daemon.next_line().await, None);
        assert_ne!(daemon.exit_code().await, Some(0));
        assert!(!socket.exists());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn unknown_executables_fail_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "missing.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["definitely-not-a-real-program-7f3a"]);

        assert_eq!(daemon.next_line().await, None);
        assert_ne!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn linking_to_a_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Link::connect(
            socket_in(&dir, "nobody.sock"),
            tokio::io::sink(),
            tokio::io::sink(),
        )
        .await;
        assert!(result.is_err());
    }
}

mod tty {
    use super::*;

    #[tokio::test]
    async fn child_gets_a_terminal_of_the_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "tty.sock");
        let mut daemon = Daemon::spawn(
            &socket,
            &["--tty", "--window-columns", "100", "--window-rows", "30"],
            &["sh", "-c", "stty size"],
        );
        daemon.expect_ready().await;

        let (link, output) = connect(&socket).await;
        assert_eq!(wait(link).await, 0);

        assert!(read_all(output.stdout).await.contains("30 100"));
        assert_eq!(read_all(output.stderr).await, "");
        assert_eq!(daemon.exit_code().await, Some(0));
    }

    #[tokio::test]
    async fn window_size_messages_resize_the_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "resize.sock");
        let mut daemon = Daemon::spawn(&socket, &["--tty"], &["sh", "-c", "read _; stty size"]);
        daemon.expect_ready().await;

        let (link, output) = connect(&socket).await;
        daemon.expect_pid().await;

        link.set_window_size(WindowSize::new(132, 43)).await.unwrap();
        link.write(b"go\n").await.unwrap();

        assert_eq!(wait(link).await, 0);
        let out = read_all(output.stdout).await;
        assert!(out.contains("43 132"), "unexpected output: {out:?}");
        assert_eq!(daemon.exit_code().await, Some(0));
    }
}

mod link_command {
    use super::*;

    #[tokio::test]
    async fn forwards_stdio_and_exits_with_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let socket = socket_in(&dir, "linked.sock");
        let mut daemon = Daemon::spawn(&socket, &[], &["sh", "-c", "cat; exit 5"]);
        daemon.expect_ready().await;

        let mut linker = Command::new(IODAEMON)
            .arg("link")
            .arg(&socket)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let mut stdin = linker.stdin.take().unwrap();
        stdin.write_all(b"ping").await.unwrap();
        drop(stdin);

        let output = tokio::time::timeout(STEP_TIMEOUT, linker.wait_with_output())
            .await
            .expect("link never finished")
            .unwrap();

        assert_eq!(output.status.code(), Some(5));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "ping");
        assert_eq!(daemon.exit_code().await, Some(0));
    }
}
