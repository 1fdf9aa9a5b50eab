//! Core types shared by the tether supervisor crates.

pub mod async_fd;
pub mod error;
pub mod pty;
pub mod types;

pub use async_fd::{AsyncOwnedFd, pipe, set_cloexec, set_nonblocking};
pub use error::{Error, Result};
pub use pty::{Pty, set_controlling_terminal, set_window_size, window_size};
pub use types::{
    BoxedReader, BoxedWriter, ProcessIo, ProcessSpec, Signal, TtySpec, WindowSize,
};
