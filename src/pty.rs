//! Pseudo-terminal allocation and child spawning.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use rustix::fs::{Mode, OFlags};
use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use rustix::termios::Winsize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY master: {0}")]
    OpenMaster(#[source] rustix::io::Errno),
    #[error("failed to grant PTY: {0}")]
    Grant(#[source] rustix::io::Errno),
    #[error("failed to unlock PTY: {0}")]
    Unlock(#[source] rustix::io::Errno),
    #[error("failed to get PTS name: {0}")]
    PtsName(#[source] rustix::io::Errno),
    #[error("failed to open PTS: {0}")]
    OpenSlave(#[source] rustix::io::Errno),
    #[error("failed to set PTY size: {0}")]
    SetSize(#[source] rustix::io::Errno),
    #[error("empty command")]
    EmptyCommand,
    #[error("command contains a NUL byte")]
    NulInCommand,
    #[error("failed to fork: {0}")]
    Fork(#[source] io::Error),
}

/// One master/slave pair. The slave end must be dropped in the parent once
/// the child holds it, or the master will never see EOF.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a pty pair sized like the real terminal.
pub fn open_pair(cols: u16, rows: u16) -> Result<PtyPair, PtyError> {
    let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC)
        .map_err(PtyError::OpenMaster)?;
    grantpt(&master).map_err(PtyError::Grant)?;
    unlockpt(&master).map_err(PtyError::Unlock)?;

    let slave_name = ptsname(&master, Vec::new()).map_err(PtyError::PtsName)?;
    let slave = rustix::fs::open(
        slave_name.as_c_str(),
        OFlags::RDWR | OFlags::NOCTTY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(PtyError::OpenSlave)?;

    let size = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    rustix::termios::tcsetwinsize(&slave, size).map_err(PtyError::SetSize)?;

    Ok(PtyPair { master, slave })
}

/// Fork and exec `command` with the pty slaves as its stdio. `stdio` backs
/// stdin and stdout; stderr shares it unless a second pair is supplied.
///
/// Returns the child's pid; exec failure inside the child surfaces as exit
/// code 127.
pub fn spawn(
    command: &[String],
    stdio: &PtyPair,
    stderr: Option<&PtyPair>,
) -> Result<libc::pid_t, PtyError> {
    if command.is_empty() {
        return Err(PtyError::EmptyCommand);
    }

    // Everything the child needs must be materialized before the fork;
    // only async-signal-safe calls are allowed on the other side.
    let c_args: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| PtyError::NulInCommand)?;
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    let stdio_fd = stdio.slave.as_raw_fd();
    let stderr_fd = stderr.map_or(stdio_fd, |pair| pair.slave.as_raw_fd());

    match unsafe { libc::fork() } {
        -1 => Err(PtyError::Fork(io::Error::last_os_error())),
        0 => {
            // Child: new session, the pty as controlling terminal, slaves
            // as stdio, then exec.
            unsafe {
                libc::setsid();
                libc::ioctl(stdio_fd, libc::TIOCSCTTY, 0);
                libc::dup2(stdio_fd, 0);
                libc::dup2(stdio_fd, 1);
                libc::dup2(stderr_fd, 2);
                libc::execvp(c_args[0].as_ptr(), argv.as_ptr());
                libc::_exit(127);
            }
        }
        pid => Ok(pid),
    }
}

/// Decode a `waitpid` status into the exit code this run reports.
fn decode_wait_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Reap the child, retrying across signal interruptions.
pub fn wait_for_exit(pid: libc::pid_t) -> i32 {
    let mut status: libc::c_int = 0;
    loop {
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        if reaped == pid {
            return decode_wait_status(status);
        }
        if reaped == -1 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            log::warn!("waitpid({pid}) failed: {}", io::Error::last_os_error());
            return -1;
        }
    }
}

/// Non-blocking reap; `Some(code)` once the child has exited.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
        0 => None,
        reaped if reaped == pid => Some(decode_wait_status(status)),
        _ => Some(-1),
    }
}

/// Ask the child to terminate.
pub fn terminate(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}
