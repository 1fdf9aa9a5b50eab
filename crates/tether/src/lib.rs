//! Detachable process supervision.
//!
//! Tether runs commands that outlive whoever started them. Any number of
//! observers can attach to a running process, feed its stdin and read its
//! output, then go away again without disturbing it. Every observer that
//! waits for the process gets the same exit status.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tether::{ProcessIo, ProcessSpec, ProcessTracker, TrackerConfig};
//!
//! # async fn example() -> tether::Result<()> {
//! let tracker = ProcessTracker::new(TrackerConfig::new());
//!
//! let process = tracker
//!     .run(
//!         ProcessSpec::new("sh").args(["-c", "echo hello"]),
//!         ProcessIo::new().stdout(tokio::io::stdout()),
//!     )
//!     .await?;
//!
//! // a second observer, by id
//! tracker
//!     .attach(process.id(), ProcessIo::new().stderr(tokio::io::stderr()))
//!     .await?;
//!
//! assert_eq!(process.wait().await?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! # Spawn modes
//!
//! With [`SpawnMode::Direct`] children belong to the current program. With
//! [`SpawnMode::Supervised`] each child is owned by its own
//! `tether-iodaemon`, so it keeps running if the tracker goes away, and a
//! new tracker can pick it up again with [`ProcessTracker::restore`].
//!
//! Output fans out to observers without back-pressure: an observer that
//! falls more than [`SINK_QUEUE_CHUNKS`] chunks behind misses data.

mod backend;
mod config;
mod container;
mod fanin;
mod fanout;
mod process;
mod tracker;

pub use backend::Backend;
pub use config::{
    DEFAULT_GRACE_PERIOD, DEFAULT_LINK_TIMEOUT, SpawnMode, TrackerConfig, find_iodaemon_binary,
};
pub use container::{Container, ContainerSpec};
pub use fanin::{FaninWriter, InputSink, WriteSink};
pub use fanout::{FanoutWriter, SINK_QUEUE_CHUNKS};
pub use process::{ExitStatus, Process, ProcessControl, ProcessState};
pub use tracker::ProcessTracker;

pub use tether_core::{
    Error, ProcessIo, ProcessSpec, Result, Signal, TtySpec, WindowSize,
};
