//! Command-line surface: flag parsing, `:::` splitting, and the `{}`
//! template rule that turns one argument into one concrete command.

use std::io::BufRead;

use clap::Parser;

/// Separator between the command template and its inline arguments.
const ARGUMENT_SEPARATOR: &str = ":::";

#[derive(Parser, Debug)]
#[command(
    name = "ptypar",
    version,
    about = "Run commands in parallel, replaying their terminal output in order",
    long_about = "Runs one instance of COMMAND per argument, up to --jobs at a time, \
                  each under its own pseudo-terminal. Output is captured and written \
                  to the real terminal strictly in submission order, as if the \
                  commands had run one after another in the foreground."
)]
pub struct Cli {
    /// Maximum number of children running at once.
    #[arg(short, long, default_value_t = default_jobs())]
    pub jobs: usize,

    /// Placeholder replaced by the argument inside the command; if no word
    /// of the command contains it, the argument is appended instead.
    #[arg(short, long, default_value = "{}")]
    pub template: String,

    /// Echo each command before replaying its output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Keep spawning children after one fails.
    #[arg(short, long)]
    pub keep_going: bool,

    /// Read arguments from stdin, one per line (after any ::: arguments).
    #[arg(long = "stdin")]
    pub args_from_stdin: bool,

    /// Cap on captured output held in memory, in bytes
    /// (default: a quarter of system RAM).
    #[arg(long, value_name = "BYTES")]
    pub memory_limit: Option<u64>,

    /// The command to run, optionally followed by ::: and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// A parsed run: the command template plus its argument sources.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub command: Vec<String>,
    pub cli_arguments: Vec<String>,
    pub args_from_stdin: bool,
    pub template: String,
    pub jobs: usize,
    pub verbose: bool,
    pub keep_going: bool,
}

impl Invocation {
    pub fn from_cli(cli: Cli) -> Self {
        let (command, cli_arguments) = split_command(cli.command);
        Self {
            command,
            cli_arguments,
            args_from_stdin: cli.args_from_stdin,
            template: cli.template,
            jobs: cli.jobs.max(1),
            verbose: cli.verbose,
            keep_going: cli.keep_going,
        }
    }

    /// The argument stream: inline `:::` arguments first, then stdin lines
    /// when enabled.
    pub fn arguments(&self) -> impl Iterator<Item = String> + '_ {
        let stdin: Box<dyn Iterator<Item = String>> = if self.args_from_stdin {
            Box::new(
                std::io::stdin()
                    .lock()
                    .lines()
                    .map_while(Result::ok)
                    .filter(|line| !line.is_empty()),
            )
        } else {
            Box::new(std::iter::empty())
        };
        self.cli_arguments.iter().cloned().chain(stdin)
    }

    /// Instantiate the command for one argument.
    pub fn command_for(&self, argument: &str) -> Vec<String> {
        instantiate_command(&self.command, &self.template, argument)
    }
}

/// Split the trailing words at the first `:::` into command and arguments.
fn split_command(raw: Vec<String>) -> (Vec<String>, Vec<String>) {
    match raw.iter().position(|word| word == ARGUMENT_SEPARATOR) {
        Some(index) => {
            let mut command = raw;
            let arguments = command.split_off(index + 1);
            command.pop();
            (command, arguments)
        }
        None => (raw, Vec::new()),
    }
}

/// Replace every occurrence of `template` in the words that contain it; if
/// none does, append the argument as an extra word.
pub fn instantiate_command(command: &[String], template: &str, argument: &str) -> Vec<String> {
    let mut instantiated = command.to_vec();

    let mut replaced_in = 0;
    if !template.is_empty() {
        for word in &mut instantiated {
            if word.contains(template) {
                *word = word.replace(template, argument);
                replaced_in += 1;
            }
        }
    }

    if replaced_in == 0 {
        instantiated.push(argument.to_string());
    }
    instantiated
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_split_at_separator() {
        let (command, arguments) = split_command(words(&["echo", ":::", "a", "b"]));
        assert_eq!(command, words(&["echo"]));
        assert_eq!(arguments, words(&["a", "b"]));
    }

    #[test]
    fn test_split_without_separator() {
        let (command, arguments) = split_command(words(&["echo", "hi"]));
        assert_eq!(command, words(&["echo", "hi"]));
        assert!(arguments.is_empty());
    }

    #[test]
    fn test_template_replaced_in_place() {
        let command = instantiate_command(&words(&["cp", "{}", "{}.bak"]), "{}", "file");
        assert_eq!(command, words(&["cp", "file", "file.bak"]));
    }

    #[test]
    fn test_argument_appended_without_template() {
        let command = instantiate_command(&words(&["echo", "hello"]), "{}", "world");
        assert_eq!(command, words(&["echo", "hello", "world"]));
    }

    #[test]
    fn test_empty_template_always_appends() {
        let command = instantiate_command(&words(&["echo"]), "", "x");
        assert_eq!(command, words(&["echo", "x"]));
    }

    #[test]
    fn test_cli_parses_flags_and_separator() {
        let cli = Cli::parse_from([
            "ptypar", "-j", "3", "-v", "--", "grep", "-n", "todo", ":::", "a.rs", "b.rs",
        ]);
        assert_eq!(cli.jobs, 3);
        assert!(cli.verbose);
        let invocation = Invocation::from_cli(cli);
        assert_eq!(invocation.command, words(&["grep", "-n", "todo"]));
        assert_eq!(invocation.cli_arguments, words(&["a.rs", "b.rs"]));
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["ptypar"]).is_err());
    }
}
