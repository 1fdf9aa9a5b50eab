//! Supervised processes.
//!
//! A [`Process`] owns one child command for as long as it runs, independently
//! of who is watching it. Observers come and go through
//! [`Process::attach`]; the child's stdin is a [`FaninWriter`] over every
//! attached input, and its stdout and stderr are [`FanoutWriter`]s feeding
//! every attached output.
//!
//! # Lifecycle
//!
//! A process starts out `Spawning`, becomes `Running` once the child is
//! confirmed started, and ends `Exited`. The state never moves backwards.
//! Exactly one background task (the linker) waits on the child, records the
//! [`ExitStatus`] and broadcasts it to every [`Process::wait`] caller.

mod control;
mod direct;
mod linked;
mod pty;

pub use control::ProcessControl;
pub(crate) use linked::Supervision;

use crate::config::SpawnMode;
use crate::fanin::{FaninWriter, WriteSink};
use crate::fanout::FanoutWriter;
use linked::LinkedControl;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use tether_core::{BoxedReader, Error, ProcessIo, ProcessSpec, Result, Signal, WindowSize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const STATE_SPAWNING: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_EXITED: u8 = 2;

/// Where a process is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The child has not been confirmed started yet.
    Spawning,
    /// The child is running, or was restored and not yet linked.
    Running,
    /// The child has exited and its status is final.
    Exited,
}

impl ProcessState {
    fn from_atomic(val: u8) -> Self {
        match val {
            STATE_SPAWNING => ProcessState::Spawning,
            STATE_RUNNING => ProcessState::Running,
            _ => ProcessState::Exited,
        }
    }
}

/// Final outcome of a process. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    /// Set when the exit code could not be determined.
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.code == 0
    }

    fn from_wait(result: Result<i32>) -> Self {
        match result {
            Ok(code) => Self { code, error: None },
            Err(e) => Self {
                code: -1,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Default)]
struct ControlSlot {
    control: Option<Arc<dyn ProcessControl>>,
    pending_window_size: Option<WindowSize>,
}

struct ProcessInner {
    id: String,
    state: AtomicU8,
    pid: AtomicU32,
    link_started: AtomicBool,
    // true once a control channel is installed or the process completed
    settled: watch::Sender<bool>,
    completion: watch::Sender<Option<ExitStatus>>,
    slot: Mutex<ControlSlot>,
    relays: Mutex<Vec<JoinHandle<()>>>,
    stdin: FaninWriter,
    stdout: FanoutWriter,
    stderr: FanoutWriter,
    // set for processes re-admitted after a restart
    restore_socket: Option<PathBuf>,
}

/// Handle to a supervised process. Clones share the same process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Process {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self::build(id.into(), STATE_SPAWNING, None)
    }

    /// A process whose daemon survived a restart. It links lazily.
    pub(crate) fn restored(id: impl Into<String>, socket: PathBuf) -> Self {
        Self::build(id.into(), STATE_RUNNING, Some(socket))
    }

    fn build(id: String, state: u8, restore_socket: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                id,
                state: AtomicU8::new(state),
                pid: AtomicU32::new(0),
                link_started: AtomicBool::new(false),
                settled: watch::Sender::new(false),
                completion: watch::Sender::new(None),
                slot: Mutex::new(ControlSlot::default()),
                relays: Mutex::new(Vec::new()),
                stdin: FaninWriter::new(),
                stdout: FanoutWriter::new(),
                stderr: FanoutWriter::new(),
                restore_socket,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// True if both handles refer to the same process.
    pub fn ptr_eq(&self, other: &Process) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_atomic(self.inner.state.load(Ordering::SeqCst))
    }

    /// The child's pid, once known.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn advance(&self, state: u8) {
        self.inner.state.fetch_max(state, Ordering::SeqCst);
    }

    /// Adds `io`'s streams to the process. Works at any point in the
    /// lifecycle; outputs attached after exit are closed immediately.
    pub fn attach(&self, io: ProcessIo) {
        if let Some(stdin) = io.stdin {
            self.inner.stdin.add_source(stdin);
        }
        if let Some(stdout) = io.stdout {
            self.inner.stdout.add_sink(stdout);
        }
        if let Some(stderr) = io.stderr {
            self.inner.stderr.add_sink(stderr);
        }
    }

    /// Starts the child described by `spec`. On failure every attached
    /// stream is released and the process stays `Spawning`.
    pub(crate) async fn spawn(&self, spec: &ProcessSpec, target: SpawnTarget<'_>) -> Result<()> {
        let result = self.start(spec, target).await;
        if result.is_err() {
            self.abandon().await;
        }
        result
    }

    async fn start(&self, spec: &ProcessSpec, target: SpawnTarget<'_>) -> Result<()> {
        match target {
            SpawnTarget::Direct => {
                let started = match spec.tty {
                    Some(tty) => pty::spawn(spec, tty.window_size.unwrap_or_default())?,
                    None => direct::spawn(spec)?,
                };

                self.inner.stdin.add_sink(started.stdin)?;
                let mut relays = vec![relay(started.stdout, self.inner.stdout.clone())];
                match started.stderr {
                    Some(stderr) => relays.push(relay(stderr, self.inner.stderr.clone())),
                    None => {
                        let _ = self.inner.stderr.close();
                    }
                }
                self.inner.relays.lock().await.extend(relays);
                self.inner.pid.store(started.pid, Ordering::SeqCst);
                self.install(Arc::from(started.control)).await;
            }
            SpawnTarget::Supervised(supervision) => {
                let launched = linked::spawn(
                    spec,
                    &self.inner.id,
                    supervision,
                    self.inner.stdout.clone(),
                    self.inner.stderr.clone(),
                )
                .await?;

                self.inner.stdin.add_sink(launched.control.writer())?;
                self.inner.pid.store(launched.pid, Ordering::SeqCst);
                self.install(Arc::new(launched.control)).await;
            }
        }
        Ok(())
    }

    async fn abandon(&self) {
        let _ = self.inner.stdout.close();
        let _ = self.inner.stderr.close();
        self.discard_stdin().await;
    }

    /// Releases input parked for a child that never got a stdin.
    async fn discard_stdin(&self) {
        if self.inner.stdin.add_sink(WriteSink(tokio::io::sink())).is_ok() {
            let _ = self.inner.stdin.close().await;
        }
    }

    /// Makes `control` the process's control channel and applies any
    /// window size requested before it existed.
    async fn install(&self, control: Arc<dyn ProcessControl>) {
        let pending = {
            let mut slot = self.inner.slot.lock().await;
            slot.control = Some(control.clone());
            slot.pending_window_size.take()
        };
        self.advance(STATE_RUNNING);
        self.inner.settled.send_replace(true);

        if let Some(size) = pending {
            if let Err(e) = control.set_window_size(size).await {
                warn!(id = %self.inner.id, error = %e, "failed to apply queued window size");
            }
        }
    }

    async fn control(&self) -> Option<Arc<dyn ProcessControl>> {
        self.inner.slot.lock().await.control.clone()
    }

    /// Delivers `signal` to the child. Does nothing until the process is
    /// linked to its child.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        match self.control().await {
            Some(control) => control.signal(signal).await,
            None => {
                debug!(id = %self.inner.id, ?signal, "ignoring signal for unlinked process");
                Ok(())
            }
        }
    }

    /// Resizes the child's terminal. Sizes set before the process is linked
    /// are applied once it is.
    pub async fn set_tty(&self, size: WindowSize) -> Result<()> {
        let control = {
            let mut slot = self.inner.slot.lock().await;
            match &slot.control {
                Some(control) => control.clone(),
                None => {
                    slot.pending_window_size = Some(size);
                    return Ok(());
                }
            }
        };
        control.set_window_size(size).await
    }

    /// Starts the linker unless it already runs. Returns true for the call
    /// that started it.
    pub(crate) fn link(&self) -> bool {
        if self
            .inner
            .link_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let process = self.clone();
        tokio::spawn(async move {
            let status = ExitStatus::from_wait(process.run_link().await);
            process.complete(status).await;
        });
        true
    }

    async fn run_link(&self) -> Result<i32> {
        let control = match self.control().await {
            Some(control) => control,
            None => self.relink().await?,
        };

        let result = control.wait().await;

        for relay in self.inner.relays.lock().await.drain(..) {
            let _ = relay.await;
        }
        result
    }

    /// Links a restored process to its surviving daemon.
    async fn relink(&self) -> Result<Arc<dyn ProcessControl>> {
        let socket = self.inner.restore_socket.as_ref().ok_or_else(|| {
            Error::Protocol(format!("process {} has no control channel", self.inner.id))
        })?;

        let control = LinkedControl::connect(
            socket,
            self.inner.stdout.clone(),
            self.inner.stderr.clone(),
        )
        .await?;
        self.inner.stdin.add_sink(control.writer())?;

        let control: Arc<dyn ProcessControl> = Arc::new(control);
        self.install(control.clone()).await;
        Ok(control)
    }

    async fn complete(&self, status: ExitStatus) {
        debug!(id = %self.inner.id, ?status, "process exited");
        let _ = self.inner.stdout.close();
        let _ = self.inner.stderr.close();
        self.advance(STATE_EXITED);
        self.inner.completion.send_replace(Some(status));
        self.inner.settled.send_replace(true);
        // a failed relink leaves attached inputs without a sink
        self.discard_stdin().await;
    }

    /// Waits until signals reach the child, or until it is gone. Only
    /// returns once the linker runs.
    pub(crate) async fn settled(&self) {
        let mut settled = self.inner.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;
    }

    /// Waits for the process to complete without starting its linker.
    pub(crate) async fn completed(&self) -> ExitStatus {
        let mut completion = self.inner.completion.subscribe();
        let status = completion
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|status| (*status).clone());
        status.unwrap_or_else(|| {
            ExitStatus::from_wait(Err(Error::Protocol(
                "process dropped before exiting".into(),
            )))
        })
    }

    /// Returns the exit status if the process has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.completion.borrow().clone()
    }

    /// Waits for the process to exit and returns its exit code. Every caller
    /// gets the same result.
    pub async fn wait(&self) -> Result<i32> {
        self.link();

        let mut completion = self.inner.completion.subscribe();
        let status = completion
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Protocol("process dropped before exiting".into()))?
            .clone();

        match status {
            Some(ExitStatus { code, error: None }) => Ok(code),
            Some(ExitStatus {
                error: Some(error), ..
            }) => Err(Error::Exited(error)),
            None => Err(Error::Protocol("process completed without a status".into())),
        }
    }

    #[cfg(test)]
    pub(crate) async fn with_control(id: &str, control: Arc<dyn ProcessControl>) -> Self {
        let process = Self::new(id);
        process.install(control).await;
        process
    }
}

/// How [`Process::spawn`] starts its child.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SpawnTarget<'a> {
    Direct,
    Supervised(Supervision<'a>),
}

impl<'a> From<&'a SpawnMode> for SpawnTarget<'a> {
    fn from(mode: &'a SpawnMode) -> Self {
        match mode {
            SpawnMode::Direct => SpawnTarget::Direct,
            SpawnMode::Supervised {
                iodaemon,
                socket_dir,
                link_timeout,
            } => SpawnTarget::Supervised(Supervision {
                iodaemon,
                socket_dir,
                link_timeout: *link_timeout,
            }),
        }
    }
}

fn relay(mut source: BoxedReader, mut sink: FanoutWriter) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
            debug!(error = %e, "output relay ended");
        }
    })
}
