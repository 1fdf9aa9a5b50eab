//! Wire protocol spoken between a link client and the tether i/o daemon.
//!
//! A daemon owns one supervised child and listens on a Unix socket. Every
//! client that connects first receives three open descriptors (the child's
//! stdout, stderr and exit-status pipes), then streams [`Input`] messages
//! back to the daemon for as long as it stays connected.

mod codec;
mod link;
mod rights;

pub use codec::{InputReader, InputWriter, MAX_FRAME_SIZE};
pub use link::{Link, LinkWriter, parse_exit_status};
pub use rights::{DESCRIPTOR_COUNT, recv_descriptors, send_descriptors};

pub use tether_core::{Signal, WindowSize};

use serde::{Deserialize, Serialize};

/// One client-to-daemon message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Input {
    /// Bytes for the child's stdin.
    Data(Vec<u8>),
    /// Close the child's stdin.
    Eof,
    /// Resize the child's terminal.
    WindowSize(WindowSize),
    /// Deliver a platform signal number to the child.
    Signal(i32),
}

/// Platform signal number carried on the wire for `signal`.
pub fn signal_code(signal: Signal) -> i32 {
    signal.as_nix() as i32
}

/// Resolves a wire signal number. Codes this platform does not know fall
/// back to SIGTERM.
pub fn signal_from_code(code: i32) -> nix::sys::signal::Signal {
    nix::sys::signal::Signal::try_from(code).unwrap_or(nix::sys::signal::Signal::SIGTERM)
}
