//! Startup configuration, resolved once from the CLI and the environment
//! and passed by reference into the daemon and client entry points.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::args::Cli;
use crate::daemon::paths;

/// What this invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Start a session (daemon and all) and attach to it.
    Launch,
    /// Attach to an already-running session; fail if there is none.
    AttachOnly,
    /// Run the session daemon itself (internal re-exec target).
    Daemon,
}

/// Everything the entry points need, settled before any socket is touched.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Validated session name.
    pub session: String,
    /// Rendezvous socket path derived from the session name.
    pub socket_path: PathBuf,
    /// PID file path beside the socket.
    pub pid_path: PathBuf,
    /// Command to run in the session; empty means the default shell.
    pub command: Vec<String>,
}

impl Config {
    /// Resolve the CLI into a configuration, refusing invalid session
    /// names and recursive attachment to an ancestor session.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mode = if cli.daemon {
            Mode::Daemon
        } else if cli.attach.is_some() {
            Mode::AttachOnly
        } else {
            Mode::Launch
        };

        let session = match (&cli.attach, &cli.name) {
            (Some(name), _) | (None, Some(name)) => name.clone(),
            (None, None) => std::process::id().to_string(),
        };
        paths::validate_name(&session)?;

        if paths::ancestry_contains(&session) {
            bail!("cannot attach to session '{session}' from inside itself");
        }

        Ok(Self {
            mode,
            socket_path: paths::socket_path(&session),
            pid_path: paths::pid_path(&session),
            command: cli.command.clone(),
            session,
        })
    }
}
