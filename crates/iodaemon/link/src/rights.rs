//! Descriptor passing over a Unix stream socket.

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tether_core::{Error, Result};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Number of descriptors in a bundle: stdout, stderr, exit status.
pub const DESCRIPTOR_COUNT: usize = 3;

// Ancillary data needs at least one byte of payload on a stream socket.
const PAYLOAD: [u8; 1] = [0];

// Received descriptors are close-on-exec from the moment they exist.
#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Sends `fds` to the peer as open descriptors. The peer gets its own handle
/// to each underlying file; ours stay open.
pub async fn send_descriptors(
    stream: &UnixStream,
    fds: [&OwnedFd; DESCRIPTOR_COUNT],
) -> Result<()> {
    let raw: [RawFd; DESCRIPTOR_COUNT] = fds.map(|fd| fd.as_raw_fd());

    stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&PAYLOAD)];
            let cmsgs = [ControlMessage::ScmRights(&raw)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(std::io::Error::from)
        })
        .await?;

    Ok(())
}

/// Receives one descriptor bundle sent with [`send_descriptors`].
pub async fn recv_descriptors(stream: &UnixStream) -> Result<[OwnedFd; DESCRIPTOR_COUNT]> {
    let fds = stream
        .async_io(Interest::READABLE, || {
            let mut payload = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut payload)];
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; DESCRIPTOR_COUNT]);

            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                RECV_FLAGS,
            )
            .map_err(std::io::Error::from)?;

            let mut fds = Vec::with_capacity(DESCRIPTOR_COUNT);
            for cmsg in msg.cmsgs().map_err(std::io::Error::from)? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    // SAFETY: the kernel just installed these descriptors in
                    // our table and nothing else refers to them yet.
                    fds.extend(
                        received
                            .into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                }
            }

            if msg.bytes == 0 && fds.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before descriptors arrived",
                ));
            }

            Ok(fds)
        })
        .await?;

    // no MSG_CMSG_CLOEXEC here, so a concurrent fork may still inherit them
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds {
        tether_core::set_cloexec(fd)?;
    }

    let count = fds.len();
    <[OwnedFd; DESCRIPTOR_COUNT]>::try_from(fds).map_err(|_| {
        Error::Protocol(format!(
            "invalid number of fds; need {}, got {}",
            DESCRIPTOR_COUNT, count
        ))
    })
}
