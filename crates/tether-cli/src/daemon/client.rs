//! The attach side: the foreground process that wires the local terminal
//! to a session daemon.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::termios::{self, SetArg, Termios};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

use tether_core::{Packet, PacketKind, WindowSize, FRAME_LEN, PAYLOAD_MAX};

use crate::config::Config;

/// How long to wait for a freshly spawned daemon's socket to appear.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between connection attempts while the daemon starts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Puts stdin into raw, unechoed mode and restores the configuration it
/// found, however the process leaves the loop.
struct RawGuard {
    saved: Termios,
}

impl RawGuard {
    fn enter() -> Result<Self> {
        let stdin = std::io::stdin();
        let saved = termios::tcgetattr(&stdin).context("stdin is not a terminal")?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSADRAIN, &raw)
            .context("failed to put the terminal into raw mode")?;

        Ok(Self { saved })
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSADRAIN, &self.saved);
    }
}

/// Query the local terminal's dimensions.
pub fn window_size() -> Result<WindowSize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ only writes into the winsize struct we hand it.
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 {
        bail!(
            "failed to query the terminal size: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
        xpixel: ws.ws_xpixel,
        ypixel: ws.ws_ypixel,
    })
}

/// Connect to an existing session. Hard failure if nothing listens there.
pub async fn connect(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("no session listening at {socket_path:?}"))
}

/// Connect to the session, starting its daemon first if there is none.
pub async fn connect_or_launch(config: &Config, size: WindowSize) -> Result<UnixStream> {
    if let Ok(stream) = UnixStream::connect(&config.socket_path).await {
        debug!(session = %config.session, "joining existing session");
        return Ok(stream);
    }

    let child = launch_daemon(config, size)?;
    wait_for_daemon(&config.socket_path, child).await
}

/// Start the session daemon: this executable re-run with the hidden daemon
/// flags, in its own process group with null stdio, so it outlives this
/// terminal.
fn launch_daemon(config: &Config, size: WindowSize) -> Result<std::process::Child> {
    let exe = std::env::current_exe().context("failed to locate the tether executable")?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .arg("--name")
        .arg(&config.session)
        .arg("--rows")
        .arg(size.rows.to_string())
        .arg("--cols")
        .arg(size.cols.to_string())
        .args(&config.command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);

    cmd.spawn().context("failed to spawn the session daemon")
}

/// Retry-connect until the daemon's socket comes up, watching for the
/// daemon dying on the way there so a bad command fails fast instead of
/// burning the whole startup window.
async fn wait_for_daemon(
    socket_path: &Path,
    mut child: std::process::Child,
) -> Result<UnixStream> {
    let start = std::time::Instant::now();

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            bail!("session daemon exited during startup with {status}");
        }

        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                debug!("session daemon up after {:?}", start.elapsed());
                return Ok(stream);
            }
            Err(_) if start.elapsed() < DAEMON_STARTUP_TIMEOUT => {
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(e).context("session daemon did not come up");
            }
        }
    }
}

/// Feed raw keyboard bytes into the loop, one frame's payload at a time.
/// Dropping the sender is the local-eof signal.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);

    std::thread::spawn(move || {
        use std::io::Read;

        let mut stdin = std::io::stdin();
        let mut buf = [0u8; PAYLOAD_MAX];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    rx
}

/// Relay between the local terminal and the session until either side
/// closes. The terminal is raw for the duration and restored on the way
/// out, error paths included.
pub async fn run(stream: UnixStream) -> Result<()> {
    let _raw = RawGuard::enter()?;

    let mut winch =
        signal(SignalKind::window_change()).context("failed to install the resize handler")?;
    let mut keys_rx = spawn_stdin_reader();
    let (mut from_daemon, mut to_daemon) = stream.into_split();
    let mut stdout = tokio::io::stdout();
    let mut frame = [0u8; FRAME_LEN];

    loop {
        tokio::select! {
            keys = keys_rx.recv() => match keys {
                // Local stdin closed: detach and leave the session running.
                None => break,
                Some(bytes) => {
                    let wire = Packet::input(&bytes).encode();
                    to_daemon
                        .write_all(&wire)
                        .await
                        .context("the session connection broke")?;
                }
            },
            _ = winch.recv() => {
                let wire = Packet::resize(window_size()?).encode();
                to_daemon
                    .write_all(&wire)
                    .await
                    .context("the session connection broke")?;
            }
            read = from_daemon.read(&mut frame) => match read {
                // The session ended, or another client snatched the
                // attachment. Either way there is nothing left here.
                Ok(0) | Err(_) => break,
                Ok(n) if n == FRAME_LEN => match Packet::decode(&frame) {
                    Ok(packet) if packet.kind() == PacketKind::Output => {
                        stdout
                            .write_all(packet.payload())
                            .await
                            .context("failed to write terminal output")?;
                        stdout
                            .flush()
                            .await
                            .context("failed to flush terminal output")?;
                    }
                    Ok(_) => {}
                    // Garbled frame: no resync point, same as a lost
                    // connection.
                    Err(_) => break,
                },
                // Torn frame, same treatment.
                Ok(_) => break,
            }
        }
    }

    Ok(())
}
