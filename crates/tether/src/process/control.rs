use async_trait::async_trait;
use tether_core::{Result, Signal, WindowSize};

/// Platform handle to a running child.
///
/// [`Process`](crate::Process) calls [`wait`](Self::wait) exactly once; the
/// other methods may be called any number of times, before or after the
/// child exits.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn signal(&self, signal: Signal) -> Result<()>;

    async fn set_window_size(&self, size: WindowSize) -> Result<()>;

    /// Blocks until the child exits and returns its exit code. A child
    /// killed by signal N reports `128 + N`.
    async fn wait(&self) -> Result<i32>;
}
