//! Pseudo-terminal allocation for interactive processes.
//!
//! The child gets the slave side as stdin, stdout and stderr and makes it its
//! controlling terminal. The master side stays with the runtime, which reads
//! output from it and resizes it on request.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use garden_common::error::{GardenError, Result};
use garden_common::types::WindowSize;
use nix::pty::{OpenptyResult, Winsize, openpty};

/// Both ends of a freshly opened pseudo-terminal.
#[derive(Debug)]
pub struct Pty {
    /// Runtime side.
    pub master: OwnedFd,
    /// Process side.
    pub slave: OwnedFd,
}

fn winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Opens a pseudo-terminal, optionally with an initial window size.
///
/// # Errors
///
/// Returns an error if `openpty(3)` fails.
pub fn open(size: Option<WindowSize>) -> Result<Pty> {
    let ws = size.map(winsize);
    let OpenptyResult { master, slave } =
        openpty(ws.as_ref(), None).map_err(|e| GardenError::io("/dev/ptmx", e.into()))?;
    tracing::debug!(master = master.as_raw_fd(), "pty opened");
    Ok(Pty { master, slave })
}

/// Changes the window size of the terminal behind `master`.
///
/// # Errors
///
/// Returns an error if the `TIOCSWINSZ` ioctl fails.
pub fn resize(master: RawFd, size: WindowSize) -> Result<()> {
    let ws = winsize(size);
    // SAFETY: TIOCSWINSZ reads a `winsize` struct from a valid pointer; the
    // fd is owned by the caller for the duration of the call.
    let ret = unsafe { libc::ioctl(master, libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(GardenError::io("/dev/pts", std::io::Error::last_os_error()));
    }
    tracing::debug!(rows = size.rows, columns = size.columns, "pty resized");
    Ok(())
}

/// Starts a new session and adopts stdin as the controlling terminal.
///
/// Meant to run in a freshly forked child whose stdio is already the slave.
///
/// # Errors
///
/// Returns the OS error of `setsid(2)` or the `TIOCSCTTY` ioctl.
pub fn make_controlling_terminal() -> std::io::Result<()> {
    // SAFETY: setsid has no memory-safety preconditions.
    if unsafe { libc::setsid() } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: TIOCSCTTY takes an integer argument; fd 0 is the pty slave.
    let ret = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_size(fd: RawFd) -> (u16, u16) {
        let mut ws = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes into a valid `winsize`.
        let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        assert_eq!(ret, 0);
        (ws.ws_row, ws.ws_col)
    }

    #[test]
    fn opens_with_requested_size() {
        let pty = open(Some(WindowSize {
            columns: 80,
            rows: 40,
        }))
        .unwrap();
        assert_eq!(current_size(pty.slave.as_raw_fd()), (40, 80));
    }

    #[test]
    fn resize_is_visible_on_slave() {
        let pty = open(None).unwrap();
        resize(
            pty.master.as_raw_fd(),
            WindowSize {
                columns: 70,
                rows: 30,
            },
        )
        .unwrap();
        assert_eq!(current_size(pty.slave.as_raw_fd()), (30, 70));
    }
}
