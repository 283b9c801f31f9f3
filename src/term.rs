//! Real-terminal helpers: dimensions, tty state, fd identity, rlimits.

use rustix::termios;

pub fn stdout_is_tty() -> bool {
    termios::isatty(rustix::stdio::stdout())
}

/// `(cols, rows)` of the controlling terminal, defaulting to 80x24 when
/// stdout is not a terminal.
pub fn terminal_size() -> (u16, u16) {
    match termios::tcgetwinsize(rustix::stdio::stdout()) {
        Ok(size) => (size.ws_col.max(1), size.ws_row.max(1)),
        Err(_) => (80, 24),
    }
}

/// Whether stdout and stderr point at the same file/pipe/terminal. Used to
/// share one pty pair per child instead of two; pty pairs are a scarce
/// resource (a few hundred to a few thousand per system).
pub fn stdout_and_stderr_are_the_same() -> bool {
    let stdout = match rustix::fs::fstat(rustix::stdio::stdout()) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    let stderr = match rustix::fs::fstat(rustix::stdio::stderr()) {
        Ok(stat) => stat,
        Err(_) => return false,
    };

    stdout.st_dev == stderr.st_dev
        && stdout.st_ino == stderr.st_ino
        && stdout.st_mode == stderr.st_mode
        && stdout.st_nlink == stderr.st_nlink
        && stdout.st_rdev == stderr.st_rdev
}

/// Raise `RLIMIT_NOFILE` to the hard limit; every child consumes pty fds.
pub fn raise_file_descriptor_limit() {
    use rustix::process::{getrlimit, setrlimit, Resource};

    let mut limit = getrlimit(Resource::Nofile);
    if limit.current == limit.maximum {
        return;
    }
    limit.current = limit.maximum;
    if let Err(err) = setrlimit(Resource::Nofile, limit) {
        log::debug!("could not raise RLIMIT_NOFILE: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_size_is_nonzero() {
        let (cols, rows) = terminal_size();
        assert!(cols >= 1 && rows >= 1);
    }

    #[test]
    fn test_fd_identity_is_reflexive() {
        // Can't assume how the test harness wires stdout/stderr, but the
        // check must at least be stable.
        assert_eq!(
            stdout_and_stderr_are_the_same(),
            stdout_and_stderr_are_the_same()
        );
    }

    #[test]
    fn test_raise_file_descriptor_limit_does_not_panic() {
        raise_file_descriptor_limit();
    }
}
