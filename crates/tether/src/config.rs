use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tether_core::{Error, Result};

/// Time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Time an i/o daemon waits for its first link.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

const IODAEMON_BINARY: &str = "tether-iodaemon";

/// How a tracker starts children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnMode {
    /// Children are children of this process and die with its tracker.
    Direct,
    /// Every child is owned by its own `tether-iodaemon`, so it survives
    /// this process. Control sockets live in `socket_dir`.
    Supervised {
        iodaemon: PathBuf,
        socket_dir: PathBuf,
        link_timeout: Duration,
    },
}

/// Configuration for a [`ProcessTracker`](crate::ProcessTracker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub spawn_mode: SpawnMode,
    pub grace_period: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            spawn_mode: SpawnMode::Direct,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervises children with the installed `tether-iodaemon`.
    pub fn supervised(socket_dir: impl Into<PathBuf>) -> Result<Self> {
        let iodaemon = find_iodaemon_binary()
            .ok_or_else(|| Error::UnknownExecutable(IODAEMON_BINARY.into()))?;
        Ok(Self::new().supervised_by(iodaemon, socket_dir))
    }

    /// Supervises children with the daemon binary at `iodaemon`.
    pub fn supervised_by(mut self, iodaemon: impl Into<PathBuf>, socket_dir: impl Into<PathBuf>) -> Self {
        self.spawn_mode = SpawnMode::Supervised {
            iodaemon: iodaemon.into(),
            socket_dir: socket_dir.into(),
            link_timeout: DEFAULT_LINK_TIMEOUT,
        };
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets how long a new daemon waits for its first link. Ignored for
    /// direct spawning.
    pub fn link_timeout(mut self, timeout: Duration) -> Self {
        if let SpawnMode::Supervised { link_timeout, .. } = &mut self.spawn_mode {
            *link_timeout = timeout;
        }
        self
    }

    /// The same configuration with control sockets under `socket_dir`.
    pub(crate) fn with_socket_dir(&self, socket_dir: &Path) -> Self {
        let mut config = self.clone();
        if let SpawnMode::Supervised { socket_dir: dir, .. } = &mut config.spawn_mode {
            *dir = socket_dir.to_path_buf();
        }
        config
    }

    pub(crate) fn socket_dir(&self) -> Option<&Path> {
        match &self.spawn_mode {
            SpawnMode::Direct => None,
            SpawnMode::Supervised { socket_dir, .. } => Some(socket_dir),
        }
    }
}

/// Locates `tether-iodaemon`: `TETHER_IODAEMON_PATH`, then next to the
/// current executable, then on `PATH`.
pub fn find_iodaemon_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TETHER_IODAEMON_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        let dir = exe.parent()?;
        let sibling = dir.join(IODAEMON_BINARY);
        if sibling.exists() {
            return Some(sibling);
        }
    }

    which::which(IODAEMON_BINARY).ok()
}

/// Accepts `name` only if joining it onto a directory stays directly inside
/// that directory.
pub(crate) fn check_path_segment(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(()),
        _ => Err(Error::InvalidHandle(name.to_string())),
    }
}
