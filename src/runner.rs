//! Child runner: one spawned command, its capture pipeline, and its result.
//!
//! Each child runs under a pseudo-terminal. A reader thread per pty feeds
//! the raw bytes through a [`Screen`], whose distilled scrollback is staged
//! in the child's [`OutputBuffer`] until the scheduler promotes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::memory::MemoryBudget;
use crate::output::OutputBuffer;
use crate::pty::{self, PtyError, PtyPair};
use crate::screen::Screen;
use crate::vt_parser::Parser;

/// Shared context every runner needs, built once by the scheduler.
pub struct RunContext {
    pub budget: Arc<MemoryBudget>,
    /// Latched on first failure (or shutdown); stops spawns and waiters.
    pub stop: Arc<AtomicBool>,
    /// Real terminal dimensions, `(cols, rows)`.
    pub terminal_size: (u16, u16),
    /// Whether stderr needs its own pty pair (stdout and stderr of this
    /// process resolve to different files).
    pub separate_stderr: bool,
}

/// One spawned child and everything needed to replay and reap it.
pub struct ProcessResult {
    pub command: Vec<String>,
    pub started_at: Instant,
    pub output: Arc<OutputBuffer>,
    pid: Option<libc::pid_t>,
    readers: Vec<JoinHandle<()>>,
    exit_status: Option<i32>,
}

impl ProcessResult {
    /// Wait for the capture to finish and the child to exit. Idempotent on
    /// the status: the child is reaped exactly once.
    pub fn wait(&mut self) -> i32 {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        if let Some(code) = self.exit_status {
            return code;
        }
        let code = self.pid.map_or(-1, pty::wait_for_exit);
        self.exit_status = Some(code);
        code
    }

    /// Whether the child is still running, without blocking.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        let Some(pid) = self.pid else {
            return false;
        };
        match pty::try_wait(pid) {
            Some(code) => {
                self.exit_status = Some(code);
                false
            }
            None => true,
        }
    }

    /// Ask the child to terminate; the output is left to be discarded.
    pub fn terminate(&self) {
        if self.exit_status.is_none() {
            if let Some(pid) = self.pid {
                pty::terminate(pid);
            }
        }
    }
}

/// Spawn one command under a pty and start capturing it. Blocks first on
/// the memory budget. Spawn failures still produce a result so submission
/// order is preserved; they carry exit code 127 and an explanation on the
/// stderr stream.
pub fn run(command: Vec<String>, ctx: &RunContext) -> ProcessResult {
    ctx.budget
        .wait_for_capacity(|| ctx.stop.load(Ordering::Relaxed));

    let output = Arc::new(OutputBuffer::new());
    let started_at = Instant::now();

    match spawn_captured(&command, ctx, &output) {
        Ok((pid, readers)) => ProcessResult {
            command,
            started_at,
            output,
            pid: Some(pid),
            readers,
            exit_status: None,
        },
        Err(err) => {
            log::warn!("cannot run {:?}: {err}", command.join(" "));
            let message = format!("ptypar: cannot run {}: {err}\r\n", command.join(" "));
            ctx.budget.add(output.append(2, message.as_bytes()));
            ProcessResult {
                command,
                started_at,
                output,
                pid: None,
                readers: Vec::new(),
                exit_status: Some(127),
            }
        }
    }
}

fn spawn_captured(
    command: &[String],
    ctx: &RunContext,
    output: &Arc<OutputBuffer>,
) -> Result<(libc::pid_t, Vec<JoinHandle<()>>), PtyError> {
    let (cols, rows) = ctx.terminal_size;
    let stdio = pty::open_pair(cols, rows)?;
    let stderr = if ctx.separate_stderr {
        Some(pty::open_pair(cols, rows)?)
    } else {
        None
    };

    let pid = pty::spawn(command, &stdio, stderr.as_ref())?;

    let mut readers = vec![spawn_reader(1, stdio, ctx, output)];
    if let Some(pair) = stderr {
        readers.push(spawn_reader(2, pair, ctx, output));
    }
    Ok((pid, readers))
}

/// Read one pty master until EOF, advancing the screen and flushing its
/// scrollback into the output buffer (or the real terminal once promoted).
fn spawn_reader(
    fd_tag: u8,
    pair: PtyPair,
    ctx: &RunContext,
    output: &Arc<OutputBuffer>,
) -> JoinHandle<()> {
    let master = pair.master;
    // The parent must not keep the slave open or EOF never arrives.
    drop(pair.slave);

    let output = Arc::clone(output);
    let budget = Arc::clone(&ctx.budget);
    let stop = Arc::clone(&ctx.stop);
    let (cols, rows) = ctx.terminal_size;

    std::thread::spawn(move || {
        let mut parser = Parser::new();
        let mut screen = Screen::new(cols as usize, rows as usize);
        let mut buf = [0u8; 8192];

        loop {
            match rustix::io::read(&master, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    screen.process(&buf[..n], &mut parser);
                    flush_scrollback(&mut screen, fd_tag, &output, &budget, &stop);
                }
                Err(rustix::io::Errno::INTR) => continue,
                // The slave side closed; on Linux this is how EOF looks.
                Err(rustix::io::Errno::IO) => break,
                Err(err) => {
                    log::debug!("pty read failed: {err}");
                    break;
                }
            }
        }

        screen.end();
        flush_scrollback(&mut screen, fd_tag, &output, &budget, &stop);
    })
}

fn flush_scrollback(
    screen: &mut Screen,
    fd_tag: u8,
    output: &OutputBuffer,
    budget: &MemoryBudget,
    stop: &AtomicBool,
) {
    let bytes = screen.take_queued_scrollback();
    if bytes.is_empty() {
        return;
    }
    // Backpressure on large captures, except for the foreground child:
    // blocking it would deadlock the very drain that frees memory.
    budget.wait_for_capacity(|| {
        stop.load(Ordering::Relaxed) || budget.is_foreground(output.id())
    });
    budget.add(output.append(fd_tag, &bytes));
}
