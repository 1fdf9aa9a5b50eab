use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Puts `fd` into non-blocking mode. The flag lives on the open file
/// description, so every process holding a copy of it observes the change.
pub fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

/// Marks `fd` close-on-exec so spawned children never inherit it.
pub fn set_cloexec(fd: &OwnedFd) -> std::io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(std::io::Error::from)?;
    Ok(())
}

/// Creates a pipe whose ends are both close-on-exec, returned as
/// `(read, write)`.
pub fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

fn poll_read_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<std::io::Result<()>> {
    loop {
        let mut guard = match fd.poll_read_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        let raw_fd = fd.get_ref().as_raw_fd();
        let unfilled = buf.initialize_unfilled();

        match nix::unistd::read(raw_fd, unfilled) {
            Ok(n) => {
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            Err(Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            // pty masters report EIO once every slave descriptor is closed
            Err(Errno::EIO) => return Poll::Ready(Ok(())),
            Err(e) => {
                return Poll::Ready(Err(std::io::Error::from(e)));
            }
        }
    }
}

fn poll_write_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<std::io::Result<usize>> {
    loop {
        let mut guard = match fd.poll_write_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        match nix::unistd::write(fd.get_ref(), buf) {
            Ok(n) => return Poll::Ready(Ok(n)),
            Err(Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            Err(e) => {
                return Poll::Ready(Err(std::io::Error::from(e)));
            }
        }
    }
}

/// An owned pipe, pty or socket descriptor driven by the tokio reactor.
pub struct AsyncOwnedFd(AsyncFd<OwnedFd>);

impl AsyncOwnedFd {
    /// Wraps `fd`, switching it to non-blocking mode first.
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self(AsyncFd::new(fd)?))
    }

    pub fn get_ref(&self) -> &OwnedFd {
        self.0.get_ref()
    }
}

impl AsyncRead for AsyncOwnedFd {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        poll_read_fd(&self.0, cx, buf)
    }
}

impl AsyncWrite for AsyncOwnedFd {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        poll_write_fd(&self.0, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
