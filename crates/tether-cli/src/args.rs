//! CLI argument parsing with clap derive macros.

use clap::Parser;

/// Detachable terminal sessions over a local socket.
///
/// Runs a command (an interactive shell by default) under a background
/// session daemon and attaches the current terminal to it. Detaching
/// leaves the command running; attaching again picks it back up.
#[derive(Debug, Parser)]
#[command(name = "tether", version, after_help = "\
Examples:
  tether                      # a shell session named after this process id
  tether -n build make -j8    # run make in a named session
  tether -a build             # reattach to it from another terminal

Closing local stdin (^D at an empty prompt of the *local* terminal, or the
end of piped input) detaches without ending the session; the session ends
when its command exits.")]
pub struct Cli {
    /// Attach to an existing session instead of starting one
    #[arg(short = 'a', long = "attach", value_name = "NAME", conflicts_with = "name")]
    pub attach: Option<String>,

    /// Name the new session (defaults to the process id)
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    pub name: Option<String>,

    /// Run the session daemon in the foreground (spawned internally)
    #[arg(long, hide = true, conflicts_with = "attach")]
    pub daemon: bool,

    /// Initial terminal rows for the daemon's pseudo-terminal
    #[arg(long, hide = true, requires = "daemon")]
    pub rows: Option<u16>,

    /// Initial terminal columns for the daemon's pseudo-terminal
    #[arg(long, hide = true, requires = "daemon")]
    pub cols: Option<u16>,

    /// Command to run in the session (defaults to an interactive shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_hyphenated_command() {
        let cli = Cli::parse_from(["tether", "-n", "work", "bash", "-c", "echo hello"]);

        assert_eq!(cli.name.as_deref(), Some("work"));
        assert_eq!(cli.command, vec!["bash", "-c", "echo hello"]);
    }

    #[test]
    fn parses_attach_mode() {
        let cli = Cli::parse_from(["tether", "-a", "work"]);

        assert_eq!(cli.attach.as_deref(), Some("work"));
        assert!(!cli.daemon);
        assert!(cli.command.is_empty());
    }

    #[test]
    fn attach_and_name_conflict() {
        let result = Cli::try_parse_from(["tether", "-a", "work", "-n", "work"]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_daemon_flags() {
        let cli = Cli::parse_from([
            "tether", "--daemon", "--name", "work", "--rows", "50", "--cols", "132", "cat",
        ]);

        assert!(cli.daemon);
        assert_eq!(cli.rows, Some(50));
        assert_eq!(cli.cols, Some(132));
        assert_eq!(cli.command, vec!["cat"]);
    }

    #[test]
    fn rows_require_daemon_mode() {
        let result = Cli::try_parse_from(["tether", "--rows", "50"]);
        assert!(result.is_err());
    }
}
