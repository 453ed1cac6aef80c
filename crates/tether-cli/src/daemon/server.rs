//! The session daemon: owns the rendezvous socket, the pseudo-terminal
//! child, and at most one attached client.
//!
//! A single loop multiplexes three readiness sources: the listener, the
//! terminal, and the attached client's socket. There is no timeout
//! anywhere in the loop; descriptor closure is the only thing that moves
//! it along.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, trace, warn};

use tether_core::{Packet, PacketKind, WindowSize, FRAME_LEN};

use crate::config::Config;
use crate::daemon::paths;
use crate::daemon::pty::PtyChild;

/// Removes the rendezvous files when the daemon goes away. Held by the
/// daemon so every exit path that runs destructors cleans up, the error
/// paths included.
struct RendezvousGuard {
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("failed to remove socket {:?}", self.socket_path);
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("failed to remove pid file {:?}", self.pid_path);
        }
    }
}

/// The single client conduit. An explicit state, not a nullable handle, so
/// a stale stream can never outlive the state that owned it.
enum Attachment {
    Vacant,
    Attached(UnixStream),
}

impl Attachment {
    fn is_attached(&self) -> bool {
        matches!(self, Attachment::Attached(_))
    }

    /// One read into `buf`. Pends forever while vacant; the select guard
    /// keeps the future unpolled in that state.
    async fn read_frame(&mut self, buf: &mut [u8; FRAME_LEN]) -> std::io::Result<usize> {
        match self {
            Attachment::Attached(stream) => stream.read(buf).await,
            Attachment::Vacant => std::future::pending().await,
        }
    }
}

/// What one loop turn woke up for.
enum Wake {
    Terminal(Option<Vec<u8>>),
    Incoming(std::io::Result<UnixStream>),
    Client(std::io::Result<usize>),
}

/// One session: a bound rendezvous socket and a command on a pty.
pub struct SessionDaemon {
    listener: UnixListener,
    pty: PtyChild,
    attachment: Attachment,
    _guard: RendezvousGuard,
}

impl SessionDaemon {
    /// Bind the rendezvous socket and spawn the session command.
    ///
    /// Binds first to avoid a check-then-bind race: on `AddrInUse` the PID
    /// file decides whether a live daemon owns the socket or a dead one
    /// left it behind.
    pub async fn launch(config: &Config, size: WindowSize) -> Result<Self> {
        if let Some(parent) = config.socket_path.parent() {
            paths::ensure_dir(parent).context("failed to create the socket directory")?;
        }

        let listener = bind_rendezvous(&config.socket_path, &config.pid_path)?;
        let guard = RendezvousGuard {
            socket_path: config.socket_path.clone(),
            pid_path: config.pid_path.clone(),
        };

        info!(session = %config.session, "listening on {:?}", config.socket_path);

        let chain = paths::inherited_chain(&config.session);
        let pty = PtyChild::spawn(&config.command, size, &chain)?;

        Ok(Self {
            listener,
            pty,
            attachment: Attachment::Vacant,
            _guard: guard,
        })
    }

    /// Run the multiplexing loop until the child's terminal session ends.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let mut frame = [0u8; FRAME_LEN];
            let attached = self.attachment.is_attached();
            let Self {
                listener,
                pty,
                attachment,
                ..
            } = self;

            let wake = tokio::select! {
                chunk = pty.read() => Wake::Terminal(chunk),
                accepted = listener.accept() => {
                    Wake::Incoming(accepted.map(|(stream, _addr)| stream))
                }
                read = attachment.read_frame(&mut frame), if attached => Wake::Client(read),
            };

            match wake {
                Wake::Terminal(None) => {
                    info!("terminal session ended");
                    self.pty.reap();
                    return Ok(());
                }
                Wake::Terminal(Some(chunk)) => self.forward_output(&chunk).await,
                Wake::Incoming(Ok(stream)) => self.attach(stream),
                Wake::Incoming(Err(e)) => error!("accept failed: {e}"),
                Wake::Client(Ok(FRAME_LEN)) => self.handle_frame(&frame).await,
                Wake::Client(Ok(0)) => {
                    debug!("client disconnected");
                    self.attachment = Attachment::Vacant;
                }
                Wake::Client(Ok(n)) => {
                    // A torn frame has no resynchronization point.
                    debug!("torn frame of {n} bytes, dropping client");
                    self.attachment = Attachment::Vacant;
                }
                Wake::Client(Err(e)) => {
                    debug!("client read failed: {e}");
                    self.attachment = Attachment::Vacant;
                }
            }
        }
    }

    /// Ship a chunk of terminal output to the attached client, if any.
    async fn forward_output(&mut self, chunk: &[u8]) {
        let Attachment::Attached(stream) = &mut self.attachment else {
            // Nobody listening: the bytes are dropped, not buffered.
            trace!("discarding {} bytes of terminal output", chunk.len());
            return;
        };

        let wire = Packet::output(chunk).encode();
        if let Err(e) = stream.write_all(&wire).await {
            debug!("client write failed, detaching: {e}");
            self.attachment = Attachment::Vacant;
        }
    }

    /// A new connection always wins. Dropping the old stream closes it, so
    /// the displaced client observes eof and exits.
    fn attach(&mut self, stream: UnixStream) {
        if self.attachment.is_attached() {
            debug!("new client snatches the attachment");
        } else {
            debug!("client attached");
        }
        self.attachment = Attachment::Attached(stream);
    }

    async fn handle_frame(&mut self, frame: &[u8; FRAME_LEN]) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("garbled frame, dropping client: {e}");
                self.attachment = Attachment::Vacant;
                return;
            }
        };

        match packet.kind() {
            PacketKind::Input => {
                if let Err(e) = self.pty.write(packet.payload()).await {
                    error!("terminal input failed: {e}");
                }
            }
            PacketKind::WindowResize => {
                if let Err(e) = self.pty.resize(packet.window_size()) {
                    warn!("resize failed: {e}");
                }
            }
            // Reserved, and meaningless coming from a client.
            PacketKind::Snatch | PacketKind::Output => {
                trace!("ignoring {:?} frame from client", packet.kind());
            }
        }
    }
}

/// Bind the listening socket, recovering from a socket file left behind by
/// a dead daemon. The PID file is written immediately after a successful
/// bind so another starting daemon never sees the socket without it.
fn bind_rendezvous(socket_path: &Path, pid_path: &Path) -> Result<UnixListener> {
    let write_pid = || -> Result<()> {
        std::fs::write(pid_path, std::process::id().to_string())
            .with_context(|| format!("failed to write pid file {pid_path:?}"))
    };

    match UnixListener::bind(socket_path) {
        Ok(listener) => {
            write_pid()?;
            Ok(listener)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if daemon_alive(pid_path) {
                anyhow::bail!("session already exists ({socket_path:?} is in use)");
            }

            // The owner is dead. Make sure the leftover really is its
            // socket before unlinking anything.
            let metadata = std::fs::symlink_metadata(socket_path)
                .with_context(|| format!("failed to stat {socket_path:?}"))?;
            if metadata.file_type().is_symlink() {
                anyhow::bail!("{socket_path:?} is a symlink, refusing to delete it");
            }
            {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    anyhow::bail!("{socket_path:?} exists but is not a socket");
                }
            }

            info!("removing stale socket from a dead daemon");
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to remove stale socket {socket_path:?}"))?;

            let listener = UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind {socket_path:?}"))?;
            write_pid()?;
            Ok(listener)
        }
        Err(e) => Err(e).with_context(|| format!("failed to bind {socket_path:?}")),
    }
}

/// True if the PID file names a process that still exists.
fn daemon_alive(pid_path: &Path) -> bool {
    let pid_str = match std::fs::read_to_string(pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // SAFETY: kill with signal 0 is the POSIX existence probe; it delivers
    // nothing and only reports whether the process can be signalled.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    use crate::config::Mode;

    use super::*;

    const TEST_SIZE: WindowSize = WindowSize {
        rows: 24,
        cols: 80,
        xpixel: 0,
        ypixel: 0,
    };

    fn test_config(dir: &TempDir, name: &str, command: &[&str]) -> Config {
        Config {
            mode: Mode::Daemon,
            session: name.to_string(),
            socket_path: dir.path().join(format!("{name}.sock")),
            pid_path: dir.path().join(format!("{name}.pid")),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Read whole frames off the stream until `needle` shows up in the
    /// accumulated Output payloads or the stream ends.
    async fn read_output_until(stream: &mut UnixStream, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut frame = [0u8; FRAME_LEN];
        let _ = timeout(Duration::from_secs(5), async {
            while stream.read_exact(&mut frame).await.is_ok() {
                let packet = Packet::decode(&frame).expect("well-formed frame");
                if packet.kind() == PacketKind::Output {
                    seen.extend_from_slice(packet.payload());
                }
                if seen.windows(needle.len()).any(|w| w == needle) {
                    break;
                }
            }
        })
        .await;
        seen
    }

    #[tokio::test]
    async fn echo_session_reaches_client_then_cleans_up() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let dir = TempDir::new().expect("tempdir");
                let config = test_config(&dir, "echo1", &["sh", "-c", "sleep 1; echo hi"]);
                let socket_path = config.socket_path.clone();
                let pid_path = config.pid_path.clone();

                let mut daemon = SessionDaemon::launch(&config, TEST_SIZE)
                    .await
                    .expect("launch");
                assert!(socket_path.exists());

                let handle = tokio::task::spawn_local(async move { daemon.run().await });

                let mut client = UnixStream::connect(&socket_path).await.expect("connect");
                let seen = read_output_until(&mut client, b"hi").await;
                let text = String::from_utf8_lossy(&seen);
                assert!(text.contains("hi"), "expected 'hi' in {text:?}");

                // The echo exits, the pty reports eof, the daemon returns and the
                // rendezvous files go away.
                let result = timeout(Duration::from_secs(5), handle)
                    .await
                    .expect("daemon did not exit")
                    .expect("daemon task panicked");
                assert!(result.is_ok());
                assert!(!socket_path.exists(), "socket file should be removed");
                assert!(!pid_path.exists(), "pid file should be removed");
            })
            .await;
    }

    #[tokio::test]
    async fn second_client_snatches_the_attachment() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let dir = TempDir::new().expect("tempdir");
                let config = test_config(&dir, "snatch1", &["cat"]);
                let socket_path = config.socket_path.clone();

                let mut daemon = SessionDaemon::launch(&config, TEST_SIZE)
                    .await
                    .expect("launch");
                let handle = tokio::task::spawn_local(async move { daemon.run().await });

                let mut first = UnixStream::connect(&socket_path).await.expect("connect A");
                // Give the loop a turn to accept before the rival shows up.
                tokio::time::sleep(Duration::from_millis(50)).await;

                let mut second = UnixStream::connect(&socket_path).await.expect("connect B");
                tokio::time::sleep(Duration::from_millis(50)).await;

                // The displaced client observes its socket closed.
                let mut buf = [0u8; FRAME_LEN];
                let n = timeout(Duration::from_secs(5), first.read(&mut buf))
                    .await
                    .expect("first client never saw eof")
                    .expect("read");
                assert_eq!(n, 0, "snatched client should see eof");

                // The new client is the live conduit: its input reaches the
                // terminal and cat's echo comes back.
                let wire = Packet::input(b"ping\n").encode();
                second.write_all(&wire).await.expect("write input");
                let seen = read_output_until(&mut second, b"ping").await;
                assert!(
                    String::from_utf8_lossy(&seen).contains("ping"),
                    "second client should be attached"
                );

                handle.abort();
            })
            .await;
    }

    #[tokio::test]
    async fn torn_frame_detaches_but_session_survives() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let dir = TempDir::new().expect("tempdir");
                let config = test_config(&dir, "torn1", &["cat"]);
                let socket_path = config.socket_path.clone();

                let mut daemon = SessionDaemon::launch(&config, TEST_SIZE)
                    .await
                    .expect("launch");
                let handle = tokio::task::spawn_local(async move { daemon.run().await });

                let mut client = UnixStream::connect(&socket_path).await.expect("connect");
                tokio::time::sleep(Duration::from_millis(50)).await;

                // Half a frame: the daemon treats it as a lost connection.
                client.write_all(&[1, 2, 3]).await.expect("write");
                let mut buf = [0u8; FRAME_LEN];
                let n = timeout(Duration::from_secs(5), client.read(&mut buf))
                    .await
                    .expect("client never saw eof")
                    .expect("read");
                assert_eq!(n, 0, "daemon should drop the client");

                // The session itself is untouched; a fresh attachment works.
                let mut again = UnixStream::connect(&socket_path).await.expect("reconnect");
                let wire = Packet::input(b"ok\n").encode();
                again.write_all(&wire).await.expect("write input");
                let seen = read_output_until(&mut again, b"ok").await;
                assert!(
                    String::from_utf8_lossy(&seen).contains("ok"),
                    "session should survive a garbled client"
                );

                handle.abort();
            })
            .await;
    }

    #[tokio::test]
    async fn dropping_the_daemon_removes_rendezvous_files() {
        let dir = TempDir::new().expect("tempdir");
        let config = test_config(&dir, "drop1", &["cat"]);

        let daemon = SessionDaemon::launch(&config, TEST_SIZE)
            .await
            .expect("launch");
        assert!(config.socket_path.exists());
        assert!(config.pid_path.exists());

        // The loop never ran; teardown alone must still clean up, the same
        // way it does when the daemon dies to a signal.
        drop(daemon);
        assert!(!config.socket_path.exists());
        assert!(!config.pid_path.exists());
    }

    #[tokio::test]
    async fn launch_refuses_a_running_session() {
        let dir = TempDir::new().expect("tempdir");
        let config = test_config(&dir, "dup1", &["cat"]);

        let _first = SessionDaemon::launch(&config, TEST_SIZE)
            .await
            .expect("launch");
        let second = SessionDaemon::launch(&config, TEST_SIZE).await;
        assert!(second.is_err(), "second bind should fail");
        // The loser must not have deleted the winner's files.
        assert!(config.socket_path.exists());
    }

    #[tokio::test]
    async fn stale_socket_from_dead_daemon_is_recovered() {
        let dir = TempDir::new().expect("tempdir");
        let config = test_config(&dir, "stale1", &["cat"]);

        // A dead daemon's leavings: a bound-then-abandoned socket file and
        // a pid file naming a process that cannot exist.
        let leftover =
            std::os::unix::net::UnixListener::bind(&config.socket_path).expect("pre-bind");
        drop(leftover);
        assert!(config.socket_path.exists());
        std::fs::write(&config.pid_path, "999999999").expect("write pid");

        let daemon = SessionDaemon::launch(&config, TEST_SIZE).await;
        assert!(daemon.is_ok(), "stale socket should be recovered");
    }
}
