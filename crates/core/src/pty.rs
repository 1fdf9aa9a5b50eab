use crate::async_fd::set_cloexec;
use crate::types::WindowSize;
use nix::pty::{OpenptyResult, Winsize, openpty};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);

/// A pseudo-terminal pair. The master side stays with the supervisor; the
/// slave side becomes the child's stdin, stdout and stderr.
pub struct Pty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

impl Pty {
    pub fn new(size: WindowSize) -> std::io::Result<Self> {
        let winsize = to_winsize(size);
        let OpenptyResult { master, slave } =
            openpty(&winsize, None).map_err(std::io::Error::from)?;
        set_cloexec(&master)?;
        set_cloexec(&slave)?;

        Ok(Self { master, slave })
    }

    /// Returns three independent handles to the slave side, suitable for a
    /// child's stdio.
    pub fn slave_stdio(&self) -> std::io::Result<(Stdio, Stdio, Stdio)> {
        Ok((
            Stdio::from(self.slave.try_clone()?),
            Stdio::from(self.slave.try_clone()?),
            Stdio::from(self.slave.try_clone()?),
        ))
    }
}

fn to_winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Resizes the terminal behind `fd`.
pub fn set_window_size(fd: &impl AsRawFd, size: WindowSize) -> std::io::Result<()> {
    let winsize = to_winsize(size);
    // SAFETY: winsize is a valid, initialized struct for the duration of the call.
    unsafe { tiocswinsz(fd.as_raw_fd(), &winsize) }.map_err(std::io::Error::from)?;
    Ok(())
}

/// Reads the current size of the terminal behind `fd`.
pub fn window_size(fd: &impl AsRawFd) -> std::io::Result<WindowSize> {
    let mut winsize = to_winsize(WindowSize::default());
    // SAFETY: the kernel writes into our owned winsize struct.
    unsafe { tiocgwinsz(fd.as_raw_fd(), &mut winsize) }.map_err(std::io::Error::from)?;
    Ok(WindowSize {
        columns: winsize.ws_col,
        rows: winsize.ws_row,
    })
}

/// Starts a new session and makes stdin its controlling terminal.
///
/// Only meant to run between fork and exec (inside `pre_exec`); it uses
/// nothing but async-signal-safe syscalls.
pub fn set_controlling_terminal() -> std::io::Result<()> {
    nix::unistd::setsid().map_err(std::io::Error::from)?;
    // SAFETY: fd 0 is the pty slave installed by the spawner.
    let rc = unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pty_has_requested_size() {
        let pty = Pty::new(WindowSize::new(132, 43)).unwrap();
        let size = window_size(&pty.master).unwrap();
        assert_eq!(size, WindowSize::new(132, 43));
    }

    #[test]
    fn resize_is_visible_on_the_slave() {
        let pty = Pty::new(WindowSize::default()).unwrap();
        set_window_size(&pty.master, WindowSize::new(100, 30)).unwrap();
        assert_eq!(window_size(&pty.slave).unwrap(), WindowSize::new(100, 30));
    }

    #[test]
    fn resize_fails_on_a_pipe() {
        let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
        assert!(set_window_size(&read_fd, WindowSize::default()).is_err());
    }

    #[test]
    fn slave_stdio_duplicates_three_handles() {
        let pty = Pty::new(WindowSize::default()).unwrap();
        assert!(pty.slave_stdio().is_ok());
    }
}
