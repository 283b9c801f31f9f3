//! Foreground scheduler.
//!
//! A spawner thread turns the argument stream into running children and
//! hands their results through a bounded channel; the foreground loop
//! promotes each result in submission order, replaying its captured output
//! and then following the still-running child live. The first failure
//! (unless `--keep-going`) stops spawning and tears the rest down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::cli::Invocation;
use crate::memory::MemoryBudget;
use crate::runner::{self, ProcessResult, RunContext};
use crate::term;

/// Run the whole invocation; returns the exit code for the process
/// (the maximum over all children).
pub fn start(invocation: Invocation, budget: Arc<MemoryBudget>) -> i32 {
    let stop = Arc::new(AtomicBool::new(false));
    let ctx = Arc::new(RunContext {
        budget,
        stop: Arc::clone(&stop),
        terminal_size: term::terminal_size(),
        separate_stderr: !term::stdout_and_stderr_are_the_same(),
    });

    // Children in flight = channel capacity + one in the spawner's hand +
    // one in the foreground.
    let capacity = invocation.jobs.max(2) - 2;
    let (sender, receiver) = std::sync::mpsc::sync_channel::<ProcessResult>(capacity);

    let spawner = {
        let ctx = Arc::clone(&ctx);
        let stop = Arc::clone(&stop);
        let invocation = invocation.clone();
        std::thread::spawn(move || spawn_children(invocation, ctx, stop, sender))
    };

    let stdout_is_tty = term::stdout_is_tty();
    let mut exit_code = 0;
    let mut first_process = true;

    for mut process in receiver.iter() {
        if invocation.verbose {
            announce(&mut process, first_process, stdout_is_tty);
        }

        exit_code = exit_code.max(to_foreground(&mut process, &ctx.budget));

        if exit_code != 0 && !invocation.keep_going {
            stop.store(true, Ordering::Relaxed);
            wait_for_children_after_a_failed_one(&receiver);
            break;
        }
        first_process = false;
    }

    drop(receiver);
    let _ = spawner.join();
    exit_code
}

fn spawn_children(
    invocation: Invocation,
    ctx: Arc<RunContext>,
    stop: Arc<AtomicBool>,
    sender: SyncSender<ProcessResult>,
) {
    for argument in invocation.arguments() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let command = invocation.command_for(&argument);
        if sender.send(runner::run(command, &ctx)).is_err() {
            break;
        }
    }
}

/// Replay a child's captured output, switch it live, and wait for it.
fn to_foreground(process: &mut ProcessResult, budget: &MemoryBudget) -> i32 {
    process.output.promote(budget);
    process.wait()
}

/// After a failure: ask every remaining child to terminate, then reap them
/// all, discarding their output.
fn wait_for_children_after_a_failed_one(receiver: &Receiver<ProcessResult>) {
    let remaining: Vec<ProcessResult> = receiver.iter().collect();
    for process in &remaining {
        process.terminate();
    }
    for mut process in remaining {
        process.wait();
    }
}

/// The `-v` echo: `+ command`, with a note when the output is not live.
fn announce(process: &mut ProcessResult, first_process: bool, stdout_is_tty: bool) {
    let quoted = shlex::try_join(process.command.iter().map(String::as_str))
        .unwrap_or_else(|_| process.command.join(" "));
    let line = format!("+ {quoted}");
    let header = line.as_str().bold();

    if first_process || !stdout_is_tty {
        eprintln!("{header}");
    } else if !process.is_alive() {
        eprintln!(
            "{header}{}",
            " (already finished, reporting saved output)".yellow()
        );
    } else if process.started_at.elapsed() > Duration::from_secs(1) {
        eprintln!(
            "{header}{}",
            format!(
                " (resumed output, already running for {}s)",
                process.started_at.elapsed().as_secs()
            )
            .yellow()
        );
    } else {
        eprintln!("{header}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Invocation;

    fn invocation(jobs: usize, keep_going: bool, commands: (&str, Vec<&str>)) -> Invocation {
        Invocation {
            command: vec!["sh".to_string(), "-c".to_string(), commands.0.to_string()],
            cli_arguments: commands.1.into_iter().map(String::from).collect(),
            args_from_stdin: false,
            template: "{}".to_string(),
            jobs,
            verbose: false,
            keep_going,
        }
    }

    #[test]
    fn test_exit_code_is_maximum() {
        let invocation = invocation(4, true, ("exit {}", vec!["0", "3", "1"]));
        let budget = Arc::new(MemoryBudget::new(1 << 24));
        assert_eq!(start(invocation, budget), 3);
    }

    #[test]
    fn test_all_successes_exit_zero() {
        let invocation = invocation(4, false, ("exit 0", vec!["a", "b", "c"]));
        let budget = Arc::new(MemoryBudget::new(1 << 24));
        assert_eq!(start(invocation, budget), 0);
    }

    #[test]
    fn test_failure_stops_spawning() {
        // 20 children, the very first fails; with jobs=2 the spawner stays
        // one step ahead, so a working stop flag leaves most unspawned.
        // The marker files the survivors would create must stay absent.
        let dir = std::env::temp_dir().join(format!("ptypar-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = format!("touch {}/mark-{{}} && exit 1", dir.display());
        let args: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let invocation = invocation(
            2,
            false,
            (script.as_str(), args.iter().map(String::as_str).collect()),
        );

        let budget = Arc::new(MemoryBudget::new(1 << 24));
        assert_eq!(start(invocation, budget), 1);

        let spawned = std::fs::read_dir(&dir).unwrap().count();
        assert!(spawned < 20, "spawning did not stop: {spawned} children ran");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_submission_order_is_preserved() {
        // Three children finishing in reverse order; the replay must still
        // come out in submission order. The real stdout is swapped for a
        // pipe around the run so the drained bytes can be inspected.
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let saved_stdout = unsafe { libc::dup(1) };
        assert!(saved_stdout >= 0);
        unsafe { libc::dup2(write_fd, 1) };

        let invocation = invocation(
            4,
            false,
            ("sleep 0.{} && echo done-{}", vec!["3", "1", "2"]),
        );
        let budget = Arc::new(MemoryBudget::new(1 << 24));
        let code = start(invocation, budget);

        unsafe {
            libc::dup2(saved_stdout, 1);
            libc::close(saved_stdout);
            libc::close(write_fd);
        }

        let mut captured = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            captured.extend_from_slice(&buf[..n as usize]);
        }
        unsafe { libc::close(read_fd) };

        assert_eq!(code, 0);
        let text = String::from_utf8_lossy(&captured);
        let positions: Vec<usize> = ["done-3", "done-1", "done-2"]
            .iter()
            .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {needle} in {text:?}")))
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2], "{text:?}");
    }
}
