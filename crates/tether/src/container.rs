use crate::config::TrackerConfig;
use crate::process::Process;
use crate::tracker::ProcessTracker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tether_core::{Error, ProcessIo, ProcessSpec, Result};
use tokio::sync::RwLock;

/// Settings for a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Empty means the backend picks a unique handle.
    #[serde(default)]
    pub handle: String,
    /// Environment added to every process run in the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Grace period for stopping the container's processes.
    pub grace_time: Option<Duration>,
}

impl ContainerSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = handle.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn grace_time(mut self, grace_time: Duration) -> Self {
        self.grace_time = Some(grace_time);
        self
    }
}

/// A work directory plus the processes running in it.
///
/// Resource limits and networking are accepted and ignored.
#[derive(Debug)]
pub struct Container {
    handle: String,
    work_dir: PathBuf,
    env: HashMap<String, String>,
    properties: RwLock<HashMap<String, String>>,
    grace_time: Mutex<Duration>,
    tracker: ProcessTracker,
}

impl Container {
    /// Supervised processes keep their control sockets in a per-container
    /// directory below the configured one.
    pub(crate) fn new(spec: ContainerSpec, work_dir: PathBuf, config: &TrackerConfig) -> Self {
        let config = match config.socket_dir() {
            Some(dir) => config.with_socket_dir(&dir.join(&spec.handle)),
            None => config.clone(),
        };
        let grace_time = spec.grace_time.unwrap_or(config.grace_period);

        Self {
            handle: spec.handle,
            work_dir,
            env: spec.env,
            properties: RwLock::new(spec.properties),
            grace_time: Mutex::new(grace_time),
            tracker: ProcessTracker::new(config),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Runs `spec` inside the work directory. `spec.dir` is taken relative
    /// to it, and the container's environment sits between the inherited one
    /// and `spec.env`.
    pub async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let spec = self.prepare(spec);
        self.tracker.run(spec, io).await
    }

    pub async fn attach(&self, id: &str, io: ProcessIo) -> Result<Process> {
        self.tracker.attach(id, io).await
    }

    /// Re-tracks a process whose i/o daemon is still alive.
    pub async fn restore(&self, id: &str) -> Result<Process> {
        self.tracker.restore(id).await
    }

    /// Stops every process in the container using its grace time.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.tracker.stop_with_grace(kill, self.grace_time()).await
    }

    pub fn grace_time(&self) -> Duration {
        *self.grace_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_grace_time(&self, grace_time: Duration) {
        *self.grace_time.lock().unwrap_or_else(PoisonError::into_inner) = grace_time;
    }

    pub async fn property(&self, name: &str) -> Result<String> {
        self.properties
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UndefinedProperty(name.to_string()))
    }

    pub async fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties
            .write()
            .await
            .insert(name.into(), value.into());
    }

    pub async fn remove_property(&self, name: &str) -> Result<()> {
        self.properties
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::UndefinedProperty(name.to_string()))
    }

    /// Snapshot of every property.
    pub async fn properties(&self) -> HashMap<String, String> {
        self.properties.read().await.clone()
    }

    /// True if every entry of `filter` is set to the same value here.
    pub(crate) async fn matches(&self, filter: &HashMap<String, String>) -> bool {
        let properties = self.properties.read().await;
        filter
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value))
    }

    pub fn limit_memory(&self, _limit_in_bytes: u64) -> Result<()> {
        Ok(())
    }

    pub fn limit_cpu(&self, _shares: u64) -> Result<()> {
        Ok(())
    }

    pub fn limit_disk(&self, _byte_hard: u64) -> Result<()> {
        Ok(())
    }

    pub fn limit_bandwidth(&self, _rate: u64, _burst: u64) -> Result<()> {
        Ok(())
    }

    /// Echoes the requested mapping; nothing is forwarded.
    pub fn net_in(&self, host_port: u32, container_port: u32) -> Result<(u32, u32)> {
        Ok((host_port, container_port))
    }

    pub fn net_out(&self, _network: &str, _port: u32) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, mut spec: ProcessSpec) -> ProcessSpec {
        let dir = match &spec.dir {
            Some(dir) => self.work_dir.join(relative(dir)),
            None => self.work_dir.clone(),
        };
        spec.dir = Some(dir);

        let mut env = self.env.clone();
        env.extend(spec.env.drain());
        spec.env = env;
        spec
    }
}

/// `dir` with any root stripped, for joining onto the work dir.
fn relative(dir: &Path) -> PathBuf {
    dir.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}
