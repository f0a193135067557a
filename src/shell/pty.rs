//! PTY allocation, shell spawning and resize for agent terminal streams.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd stays with the
//! terminal for its lifetime; [`PtyIo::split`] dups it into independent async
//! read and write handles so the pump can read and write concurrently.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// What to run on the slave side.
pub struct ShellCommand<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub working_dir: &'a str,
    pub env: &'a HashMap<String, String>,
}

/// Spawn a shell as session leader with the PTY slave as its controlling terminal.
pub fn spawn_shell_pty(pty: &PtyPair, shell: &ShellCommand<'_>) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell.program);
    cmd.args(shell.args)
        .current_dir(shell.working_dir)
        .envs(shell.env)
        .kill_on_drop(true);

    // stdio is wired to the slave in pre_exec
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Async handles onto one PTY master.
pub struct PtyIo {
    pub reader: tokio::fs::File,
    pub writer: tokio::fs::File,
    /// Kept for resize.
    pub master: OwnedFd,
}

impl PtyIo {
    pub fn split(master: OwnedFd) -> std::io::Result<Self> {
        let reader = dup_file(master.as_raw_fd())?;
        let writer = dup_file(master.as_raw_fd())?;
        Ok(Self {
            reader,
            writer,
            master,
        })
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), nix::Error> {
        resize_pty(&self.master, rows, cols)
    }
}

fn dup_file(fd: RawFd) -> std::io::Result<tokio::fs::File> {
    // SAFETY: dup returns a fresh descriptor we exclusively own.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `dup` is a valid, owned descriptor.
    Ok(tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(dup) }))
}

/// Send `signal` to the whole process group led by `pid`.
pub fn signal_group(pid: u32, signal: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = -(pid as i32);
    // SAFETY: kill has no memory-safety preconditions.
    unsafe {
        libc::kill(pgid, signal);
    }
}
