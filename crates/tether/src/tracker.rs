//! Registry of supervised processes.
//!
//! A [`ProcessTracker`] starts processes, finds them again by id for later
//! observers, and stops all of them at once. Each tracker owns its own
//! registry, so several can coexist in one program.

use crate::config::TrackerConfig;
use crate::process::{Process, SpawnTarget, Supervision};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{Error, ProcessIo, ProcessSpec, Result, Signal};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Default)]
struct Registry {
    processes: HashMap<String, Process>,
    // ids of processes that are still spawning
    reserved: HashSet<String>,
}

impl Registry {
    fn contains(&self, id: &str) -> bool {
        self.processes.contains_key(id) || self.reserved.contains(id)
    }
}

struct TrackerInner {
    config: TrackerConfig,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    // number of reserved ids, published for `stop`
    spawning: watch::Sender<usize>,
}

/// Starts, finds and stops processes by id. Clones share the registry.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl ProcessTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(0),
                spawning: watch::Sender::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Starts `spec` with `io` attached from the first byte.
    ///
    /// An empty `spec.id` gets a fresh numeric id. If the process cannot be
    /// started nothing is registered and the id is free again.
    pub async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let id = self.reserve(&spec.id).await?;
        let process = Process::new(id.clone());
        process.attach(io);

        let target = SpawnTarget::from(&self.inner.config.spawn_mode);
        if let Err(e) = process.spawn(&spec, target).await {
            let mut registry = self.inner.registry.write().await;
            registry.reserved.remove(&id);
            self.publish_spawning(&registry);
            return Err(e);
        }

        self.admit(&process).await;
        debug!(id, path = %spec.path, "process registered");

        process.link();
        Ok(process)
    }

    /// Adds `io` to the process registered under `id`. Works whether or not
    /// the process is still running.
    pub async fn attach(&self, id: &str, io: ProcessIo) -> Result<Process> {
        let process = self
            .inner
            .registry
            .read()
            .await
            .processes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownProcess(id.to_string()))?;

        process.attach(io);
        process.link();
        Ok(process)
    }

    /// Tracks a process whose i/o daemon outlived an earlier tracker. The
    /// process links on its first attach or wait.
    pub async fn restore(&self, id: &str) -> Result<Process> {
        let socket = match self.supervision() {
            Some(supervision) => supervision.socket_path(id)?,
            None => {
                return Err(Error::UnknownProcess(format!(
                    "{id}: only supervised processes can be restored"
                )));
            }
        };

        let mut registry = self.inner.registry.write().await;
        if registry.contains(id) {
            return Err(Error::DuplicateProcess(id.to_string()));
        }
        self.bump_watermark(id);

        let process = Process::restored(id, socket);
        registry.processes.insert(id.to_string(), process.clone());
        self.unregister_on_completion(&process);
        debug!(id, "process restored");
        Ok(process)
    }

    /// Snapshot of every registered process.
    pub async fn active_processes(&self) -> Vec<Process> {
        self.inner
            .registry
            .read()
            .await
            .processes
            .values()
            .cloned()
            .collect()
    }

    /// Stops every registered process with the configured grace period.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.stop_with_grace(kill, self.inner.config.grace_period)
            .await
    }

    /// Stops every registered process and returns once all have exited.
    ///
    /// With `kill` set every process gets SIGKILL right away. Otherwise each
    /// gets SIGTERM, and SIGKILL if it is still running after `grace`.
    /// Processes still being started when this is called are waited for and
    /// stopped too; processes started afterwards are not.
    ///
    /// Fails with the first error of a process that could not be killed.
    /// Every other process is still stopped.
    pub async fn stop_with_grace(&self, kill: bool, grace: Duration) -> Result<()> {
        let mut spawning = self.inner.spawning.subscribe();
        // the sender lives in `inner`, so this only returns once nothing is spawning
        let _ = spawning.wait_for(|count| *count == 0).await;

        let processes = self.active_processes().await;
        debug!(count = processes.len(), kill, ?grace, "stopping processes");

        let mut stopping = JoinSet::new();
        for process in processes {
            stopping.spawn(stop_one(process, kill, grace));
        }

        let mut first_error = None;
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!(error = %e, "stop task failed"),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn reserve(&self, requested: &str) -> Result<String> {
        let mut registry = self.inner.registry.write().await;

        let id = if requested.is_empty() {
            loop {
                let id = (self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                if !registry.contains(&id) {
                    break id;
                }
            }
        } else {
            if registry.contains(requested) {
                return Err(Error::DuplicateProcess(requested.to_string()));
            }
            self.bump_watermark(requested);
            requested.to_string()
        };

        registry.reserved.insert(id.clone());
        self.publish_spawning(&registry);
        Ok(id)
    }

    /// Moves a started process from the reserved ids into the registry.
    async fn admit(&self, process: &Process) {
        let mut registry = self.inner.registry.write().await;
        registry.reserved.remove(process.id());
        registry
            .processes
            .insert(process.id().to_string(), process.clone());
        self.publish_spawning(&registry);
        self.unregister_on_completion(process);
    }

    fn publish_spawning(&self, registry: &Registry) {
        self.inner.spawning.send_replace(registry.reserved.len());
    }

    /// Keeps the allocator above every numeric id seen so far.
    fn bump_watermark(&self, id: &str) {
        if let Ok(n) = id.parse::<u64>() {
            self.inner.next_id.fetch_max(n, Ordering::SeqCst);
        }
    }

    /// Removes `process` from the registry once it completes, whoever ends
    /// up running its linker.
    fn unregister_on_completion(&self, process: &Process) {
        let inner: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let process = process.clone();
        tokio::spawn(async move {
            let status = process.completed().await;
            match &status.error {
                None => debug!(id = process.id(), code = status.code, "process completed"),
                Some(error) => warn!(id = process.id(), %error, "process completed abnormally"),
            }

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut registry = inner.registry.write().await;
            // the id may have been reused since
            if registry
                .processes
                .get(process.id())
                .is_some_and(|registered| registered.ptr_eq(&process))
            {
                registry.processes.remove(process.id());
            }
        });
    }

    fn supervision(&self) -> Option<Supervision<'_>> {
        match SpawnTarget::from(&self.inner.config.spawn_mode) {
            SpawnTarget::Direct => None,
            SpawnTarget::Supervised(supervision) => Some(supervision),
        }
    }

    #[cfg(test)]
    async fn adopt(&self, process: Process) {
        self.admit(&process).await;
        process.link();
    }
}

async fn stop_one(process: Process, kill: bool, grace: Duration) -> Result<()> {
    process.link();
    process.settled().await;

    if !kill {
        if let Err(e) = process.signal(Signal::Terminate).await {
            warn!(id = process.id(), error = %e, "failed to terminate process");
        }
        if tokio::time::timeout(grace, process.wait()).await.is_ok() {
            return Ok(());
        }
        debug!(id = process.id(), ?grace, "grace period expired");
    }

    if let Err(e) = process.signal(Signal::Kill).await {
        if process.exit_status().is_none() {
            warn!(id = process.id(), error = %e, "failed to kill process");
            return Err(e);
        }
    }
    // an abnormal exit still means the process is gone
    let _ = process.wait().await;
    Ok(())
}
