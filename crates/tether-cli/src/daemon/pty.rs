//! The pseudo-terminal child: the command a session keeps alive.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use tether_core::{WindowSize, PAYLOAD_MAX};

use crate::daemon::paths;

/// Fallback when neither a command nor `$SHELL` is given.
const DEFAULT_SHELL: &str = "/bin/sh";

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.xpixel,
        pixel_height: size.ypixel,
    }
}

/// A command running on its own pseudo-terminal.
///
/// The blocking master reader and writer run on their own threads, bridged
/// to the event loop over channels; the closed output channel is how the
/// loop learns the terminal session ended.
pub struct PtyChild {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
}

impl PtyChild {
    /// Spawn `command` (or the default interactive shell) on a fresh
    /// pseudo-terminal of the given size, exporting `chain` as the session
    /// ancestry marker in the child's environment.
    pub fn spawn(command: &[String], size: WindowSize, chain: &str) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .context("failed to open a pseudo-terminal")?;

        let mut cmd = if command.is_empty() {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string());
            CommandBuilder::new(shell)
        } else {
            let mut cmd = CommandBuilder::new(&command[0]);
            cmd.args(&command[1..]);
            cmd
        };
        cmd.env(paths::SESSION_CHAIN_VAR, chain);

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn the session command")?;

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone the pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take the pty writer")?;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);

        std::thread::spawn(move || reader_loop(reader, output_tx));
        std::thread::spawn(move || writer_loop(writer, input_rx));

        Ok(Self {
            master: pair.master,
            child,
            input_tx,
            output_rx,
        })
    }

    /// Next chunk of terminal output, at most one frame's payload.
    ///
    /// `None` means the child's terminal session ended.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    /// Queue keyboard bytes for the terminal.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.input_tx
            .send(bytes.to_vec())
            .await
            .context("the pty writer is gone")
    }

    /// Apply the attached client's dimensions to the terminal. The child
    /// sees SIGWINCH.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .context("failed to resize the pty")
    }

    /// Collect the child's exit status without blocking.
    pub fn reap(&mut self) {
        if let Err(e) = self.child.try_wait() {
            debug!("could not collect child exit status: {e}");
        }
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        // The session is over either way; don't leave the command orphaned
        // on a dead pty, and don't leave a zombie behind.
        if let Err(e) = self.child.kill() {
            debug!("child already gone: {e}");
        }
        if let Err(e) = self.child.try_wait() {
            debug!("could not collect child exit status: {e}");
        }
    }
}

/// Reads the terminal one frame's payload at a time. The codec never
/// chunks, so the read size is already what one Output frame can carry.
fn reader_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; PAYLOAD_MAX];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("pty reader eof");
                break;
            }
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("pty output channel closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => {
                warn!("pty read error: {e}");
                break;
            }
        }
    }
}

fn writer_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes) {
            error!("pty write error: {e}");
            break;
        }
        if let Err(e) = writer.flush() {
            error!("pty flush error: {e}");
            break;
        }
    }
    debug!("pty writer exiting");
}
