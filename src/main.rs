use std::sync::{Arc, OnceLock};

use clap::Parser;

use ptypar::cli::{Cli, Invocation};
use ptypar::memory::MemoryBudget;
use ptypar::{scheduler, term};

/// Terminal state snapshotted at startup, restored on exit and from the
/// signal handler (which may only touch what is already in place).
static ORIGINAL_TERMIOS: OnceLock<libc::termios> = OnceLock::new();

extern "C" fn handle_exit_signal(_: libc::c_int) {
    // Async-signal-safe: an ioctl and an immediate exit.
    if let Some(state) = ORIGINAL_TERMIOS.get() {
        unsafe {
            libc::tcsetattr(libc::STDOUT_FILENO, libc::TCSANOW, state);
        }
    }
    unsafe { libc::_exit(1) }
}

fn install_terminal_guard() {
    let mut state: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDOUT_FILENO, &mut state) } != 0 {
        log::warn!(
            "could not read terminal state: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    let _ = ORIGINAL_TERMIOS.set(state);

    unsafe {
        libc::signal(libc::SIGINT, handle_exit_signal as usize);
        libc::signal(libc::SIGTERM, handle_exit_signal as usize);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let memory_limit = cli.memory_limit.unwrap_or_else(MemoryBudget::default_limit);
    let invocation = Invocation::from_cli(cli);

    if invocation.cli_arguments.is_empty() && !invocation.args_from_stdin {
        log::warn!("no ::: arguments and no --stdin; nothing to run");
    }

    term::raise_file_descriptor_limit();
    if term::stdout_is_tty() {
        install_terminal_guard();
    }

    let budget = Arc::new(MemoryBudget::new(memory_limit));
    let exit_code = scheduler::start(invocation, budget);

    if let Some(state) = ORIGINAL_TERMIOS.get() {
        unsafe {
            libc::tcsetattr(libc::STDOUT_FILENO, libc::TCSANOW, state);
        }
    }
    std::process::exit(exit_code);
}
