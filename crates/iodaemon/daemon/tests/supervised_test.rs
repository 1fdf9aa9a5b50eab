//! Process tracking through real i/o daemons.

use nix::unistd::{Pid, getpgid};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tether::{
    Error, ProcessIo, ProcessSpec, ProcessState, ProcessTracker, Signal, TrackerConfig, TtySpec,
    WindowSize,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const IODAEMON: &str = env!("CARGO_BIN_EXE_tether-iodaemon");
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn tracker(socket_dir: &Path) -> ProcessTracker {
    ProcessTracker::new(TrackerConfig::new().supervised_by(IODAEMON, socket_dir))
}

async fn read_all(mut reader: tokio::io::DuplexStream) -> String {
    let mut out = String::new();
    tokio::time::timeout(STEP_TIMEOUT, reader.read_to_string(&mut out))
        .await
        .expect("output never ended")
        .unwrap();
    out
}

#[tokio::test]
async fn runs_through_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    let (stdout, stdout_reader) = tokio::io::duplex(4096);
    let (stderr, stderr_reader) = tokio::io::duplex(4096);
    let process = tracker
        .run(
            ProcessSpec::new("sh").args(["-c", "cat; echo done >&2; exit 4"]),
            ProcessIo::new()
                .stdin(&b"abc"[..])
                .stdout(stdout)
                .stderr(stderr),
        )
        .await
        .unwrap();
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.pid().is_some());

    assert_eq!(process.wait().await.unwrap(), 4);
    assert_eq!(read_all(stdout_reader).await, "abc");
    assert_eq!(read_all(stderr_reader).await, "done\n");
}

#[tokio::test]
async fn unknown_executables_fail_before_a_daemon_starts() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    let err = tracker
        .run(
            ProcessSpec::new("definitely-not-a-real-program-7f3a"),
            ProcessIo::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownExecutable(_)));
    assert!(tracker.active_processes().await.is_empty());
}

#[tokio::test]
async fn signals_and_resizes_travel_over_the_link() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    let (stdout, stdout_reader) = tokio::io::duplex(4096);
    let process = tracker
        .run(
            ProcessSpec::new("sh")
                .args(["-c", "read _; stty size; read _"])
                .tty(TtySpec::with_window_size(WindowSize::new(80, 24))),
            ProcessIo::new().stdout(stdout),
        )
        .await
        .unwrap();

    process.set_tty(WindowSize::new(120, 40)).await.unwrap();
    tracker
        .attach(process.id(), ProcessIo::new().stdin(&b"go\n"[..]))
        .await
        .unwrap();

    // give the child time to print before it is killed
    tokio::time::sleep(Duration::from_millis(500)).await;
    process.signal(Signal::Kill).await.unwrap();

    let code = tokio::time::timeout(STEP_TIMEOUT, process.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 128 + 9);
    assert!(read_all(stdout_reader).await.contains("40 120"));
}

#[tokio::test]
async fn restored_processes_link_to_their_surviving_daemon() {
    let dir = tempfile::tempdir().unwrap();

    // a daemon left behind by an earlier tracker
    let mut daemon = Command::new(IODAEMON)
        .arg("spawn")
        .arg(dir.path().join("7.sock"))
        .args(["sh", "-c", "read line; echo got $line"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let mut announcements = BufReader::new(daemon.stdout.take().unwrap()).lines();
    assert_eq!(
        announcements.next_line().await.unwrap().as_deref(),
        Some("ready")
    );

    let tracker = tracker(dir.path());
    let process = tracker.restore("7").await.unwrap();
    assert_eq!(process.state(), ProcessState::Running);

    let (stdout, stdout_reader) = tokio::io::duplex(4096);
    tracker
        .attach(
            "7",
            ProcessIo::new().stdin(&b"hello\n"[..]).stdout(stdout),
        )
        .await
        .unwrap();

    let code = tokio::time::timeout(STEP_TIMEOUT, process.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_all(stdout_reader).await, "got hello\n");

    // ids allocated afterwards never collide with the restored one
    let next = tracker
        .run(ProcessSpec::new("true"), ProcessIo::new())
        .await
        .unwrap();
    assert_eq!(next.id(), "8");
    next.wait().await.unwrap();
}

#[tokio::test]
async fn restoring_a_taken_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    tracker.restore("3").await.unwrap();
    assert!(matches!(
        tracker.restore("3").await,
        Err(Error::DuplicateProcess(_))
    ));
}

#[tokio::test]
async fn stop_kills_supervised_processes() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    let process = tracker
        .run(ProcessSpec::new("sleep").arg("30"), ProcessIo::new())
        .await
        .unwrap();

    tokio::time::timeout(STEP_TIMEOUT, tracker.stop(true))
        .await
        .expect("stop did not finish")
        .unwrap();
    assert_eq!(process.exit_status().unwrap().code, 128 + 9);
}

#[tokio::test]
async fn supervised_processes_leave_the_callers_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker(dir.path());

    let process = tracker
        .run(ProcessSpec::new("sleep").arg("30"), ProcessIo::new())
        .await
        .unwrap();
    let child = Pid::from_raw(process.pid().unwrap() as i32);

    // a signal to this test's process group must not reach the daemon
    assert_ne!(getpgid(Some(child)).unwrap(), getpgid(None).unwrap());

    tokio::time::timeout(STEP_TIMEOUT, tracker.stop(true))
        .await
        .expect("stop did not finish")
        .unwrap();
}
