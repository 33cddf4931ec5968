//! Stream relay between the local terminal and an exec session
//!
//! Each direction runs in its own task so a stall in one never blocks the
//! others:
//!
//! - local stdin -> remote stdin (a reader task feeding a writer task over an
//!   mpsc channel, which also carries forwarded interrupts)
//! - remote stdout -> local stdout
//! - remote stderr -> local stderr, when the session exposes it
//!
//! The relay moves through [`RelayState`]s. Once the remote process reports a
//! status or any output stream closes it drains for a bounded grace period,
//! then returns the exit status.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::status::ExitStatus;
use crate::transport::{channel, Completion, ExecSession, RemoteReader, RemoteWriter};
use crate::{Error, Result};

/// How long to wait for output and the exit status once the session ends
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Byte sent for Ctrl-C (ETX)
pub const INTERRUPT: u8 = 0x03;

/// Read size for every pump
const BUFFER_SIZE: usize = 4096;

/// Queued stdin chunks between the reader and writer tasks
const INPUT_QUEUE: usize = 64;

/// Local reader type
pub type LocalReader = Box<dyn AsyncRead + Unpin + Send>;

/// Local writer type
pub type LocalWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Session not yet wired up
    Connecting,
    /// Bytes flowing in every direction
    Active,
    /// Session ending; flushing remaining output
    Draining,
    /// All pumps stopped
    Closed,
}

/// The local end of the relay
pub struct LocalIo {
    /// Source for remote stdin
    pub stdin: LocalReader,
    /// Sink for remote stdout
    pub stdout: LocalWriter,
    /// Sink for remote stderr
    pub stderr: LocalWriter,
}

impl LocalIo {
    /// Wrap arbitrary local streams
    pub fn new(
        stdin: impl AsyncRead + Unpin + Send + 'static,
        stdout: impl AsyncWrite + Unpin + Send + 'static,
        stderr: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// The process's own stdin, stdout and stderr
    pub fn process() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }
}

/// Message from the stdin reader (or an interrupt) to the stdin writer
#[derive(Debug)]
enum Input {
    Data(Vec<u8>),
    Eof,
    Failed(std::io::Error),
}

/// How the stdin writer finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdinEnd {
    /// Local input reached EOF; remote stdin was closed
    SourceClosed,
    /// The remote end stopped accepting input
    SinkClosed,
}

/// Handle for injecting interrupts into the remote stdin stream
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: mpsc::Sender<Input>,
}

impl Interrupter {
    /// Queue a Ctrl-C byte behind any pending input.
    ///
    /// Returns false when the stdin stream has already ended.
    pub async fn interrupt(&self) -> bool {
        self.tx.send(Input::Data(vec![INTERRUPT])).await.is_ok()
    }
}

/// A running relay over one exec session
pub struct Relay {
    state: RelayState,
    grace: Duration,
    cancel: CancellationToken,
    completion: Option<Completion>,
    input_tx: Option<mpsc::Sender<Input>>,
    stdin_reader: Option<JoinHandle<()>>,
    stdin_writer: Option<JoinHandle<Result<StdinEnd>>>,
    outputs: JoinSet<Result<()>>,
}

impl Relay {
    /// Take the session's channels and start the pumps.
    ///
    /// Remote stderr is only relayed when the session exposes it; under a TTY
    /// the server merges it into stdout.
    pub fn start(mut session: ExecSession, local: LocalIo, grace: Duration) -> Result<Self> {
        let completion = session
            .take_completion()
            .ok_or_else(|| Error::protocol("session has no completion"))?;

        let mut relay = Self {
            state: RelayState::Connecting,
            grace,
            cancel: CancellationToken::new(),
            completion: Some(completion),
            input_tx: None,
            stdin_reader: None,
            stdin_writer: None,
            outputs: JoinSet::new(),
        };

        let LocalIo {
            stdin,
            stdout,
            stderr,
        } = local;

        if let Some(remote_stdin) = session.take_stdin() {
            let (tx, rx) = mpsc::channel(INPUT_QUEUE);
            relay.stdin_reader = Some(tokio::spawn(read_local_input(
                stdin,
                tx.clone(),
                relay.cancel.clone(),
            )));
            relay.stdin_writer = Some(tokio::spawn(write_remote_input(
                rx,
                remote_stdin,
                relay.cancel.clone(),
            )));
            relay.input_tx = Some(tx);
        }

        if let Some(remote_stdout) = session.take_stdout() {
            relay.outputs.spawn(pump_output(
                remote_stdout,
                stdout,
                channel::STDOUT,
                relay.cancel.clone(),
            ));
        }

        if let Some(remote_stderr) = session.take_stderr() {
            relay.outputs.spawn(pump_output(
                remote_stderr,
                stderr,
                channel::STDERR,
                relay.cancel.clone(),
            ));
        }

        relay.transition(RelayState::Active);
        Ok(relay)
    }

    /// Current state
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Handle for forwarding interrupts, if the session has stdin
    pub fn interrupter(&self) -> Option<Interrupter> {
        self.input_tx
            .as_ref()
            .map(|tx| Interrupter { tx: tx.clone() })
    }

    /// Relay until the session ends and return the remote exit status.
    ///
    /// Fails with [`Error::Io`] when a direction fails for a reason other than
    /// clean closure, or [`Error::Protocol`] when the session ends without a
    /// status within the grace period.
    pub async fn run(&mut self) -> Result<ExitStatus> {
        let mut completion = self
            .completion
            .take()
            .ok_or_else(|| Error::protocol("relay already ran"))?;

        let mut status = loop {
            tokio::select! {
                status = &mut completion => break Some(status?),
                Some(joined) = self.outputs.join_next() => {
                    flatten(joined)?;
                    debug!("Remote output closed");
                    break None;
                }
                ended = join_stdin(&mut self.stdin_writer) => match ended? {
                    StdinEnd::SourceClosed => debug!("Local stdin closed"),
                    StdinEnd::SinkClosed => {
                        debug!("Remote stdin closed");
                        break None;
                    }
                },
            }
        };

        self.transition(RelayState::Draining);
        self.stop_input();

        let settled = tokio::time::timeout(
            self.grace,
            settle(&mut self.outputs, &mut completion, &mut status),
        )
        .await;

        match (settled, status) {
            (Ok(Err(e)), _) => Err(e),
            (Ok(Ok(())), Some(status)) => Ok(status),
            (Err(_), Some(status)) => {
                warn!("Output did not drain within grace period");
                Ok(status)
            }
            (_, None) => Err(Error::protocol("session closed without an exit status")),
        }
    }

    /// Stop every pump and wait for them to exit.
    ///
    /// After this returns nothing writes to the local streams.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.stop_input();
        self.outputs.abort_all();

        if let Some(reader) = self.stdin_reader.take() {
            let _ = reader.await;
        }
        if let Some(writer) = self.stdin_writer.take() {
            let _ = writer.await;
        }
        while self.outputs.join_next().await.is_some() {}

        self.transition(RelayState::Closed);
    }

    fn stop_input(&mut self) {
        self.input_tx = None;
        if let Some(reader) = &self.stdin_reader {
            reader.abort();
        }
        if let Some(writer) = &self.stdin_writer {
            writer.abort();
        }
    }

    fn transition(&mut self, next: RelayState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Relay state");
            self.state = next;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.stop_input();
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::protocol(format!("relay task failed: {}", e))),
    }
}

/// Wait for the remaining output pumps and, if still missing, the exit status
async fn settle(
    outputs: &mut JoinSet<Result<()>>,
    completion: &mut Completion,
    status: &mut Option<ExitStatus>,
) -> Result<()> {
    loop {
        tokio::select! {
            received = &mut *completion, if status.is_none() => *status = Some(received?),
            Some(joined) = outputs.join_next() => flatten(joined)?,
            else => return Ok(()),
        }
    }
}

/// Wait for the stdin writer, or forever once it has finished
async fn join_stdin(writer: &mut Option<JoinHandle<Result<StdinEnd>>>) -> Result<StdinEnd> {
    let Some(handle) = writer else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *writer = None;
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(StdinEnd::SinkClosed),
        Err(e) => Err(Error::protocol(format!("stdin task failed: {}", e))),
    }
}

async fn read_local_input(mut stdin: LocalReader, tx: mpsc::Sender<Input>, cancel: CancellationToken) {
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = stdin.read(&mut buf) => {
                let input = match result {
                    Ok(0) => Input::Eof,
                    Ok(n) => Input::Data(buf[..n].to_vec()),
                    Err(e) => Input::Failed(e),
                };
                let last = !matches!(input, Input::Data(_));
                if tx.send(input).await.is_err() || last {
                    break;
                }
            }
        }
    }
}

async fn write_remote_input(
    mut rx: mpsc::Receiver<Input>,
    mut remote: RemoteWriter,
    cancel: CancellationToken,
) -> Result<StdinEnd> {
    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => return Ok(StdinEnd::SinkClosed),
            input = rx.recv() => input,
        };

        match input {
            Some(Input::Data(data)) => match write_chunk(&mut remote, &data).await {
                Ok(()) => {}
                Err(e) if is_closed(&e) => return Ok(StdinEnd::SinkClosed),
                Err(e) => return Err(Error::io(channel::name(channel::STDIN), e)),
            },
            Some(Input::Failed(e)) => return Err(Error::io("local stdin", e)),
            Some(Input::Eof) | None => {
                if let Err(e) = remote.shutdown().await {
                    debug!(error = %e, "Failed to close remote stdin");
                }
                return Ok(StdinEnd::SourceClosed);
            }
        }
    }
}

async fn pump_output(
    mut remote: RemoteReader,
    mut local: LocalWriter,
    id: u8,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = channel::name(id);
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = remote.read(&mut buf) => read.map_err(|e| Error::io(stream, e))?,
        };
        if n == 0 {
            debug!(stream, "Remote stream ended");
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = write_chunk(&mut local, &buf[..n]) => written.map_err(|e| Error::io(stream, e))?,
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

fn is_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::fixtures;
    use crate::transport::memory::session_pair;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    const GRACE: Duration = Duration::from_millis(200);

    /// Local writer that never accepts a byte
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn relays_each_direction_and_returns_status() {
        let (session, mut remote) = session_pair();
        let (mut keyboard, local_stdin) = tokio::io::duplex(64);
        let (local_stdout, mut screen) = tokio::io::duplex(64);
        let (local_stderr, mut errors) = tokio::io::duplex(64);

        let mut relay = Relay::start(
            session,
            LocalIo::new(local_stdin, local_stdout, local_stderr),
            GRACE,
        )
        .unwrap();
        assert_eq!(relay.state(), RelayState::Active);

        keyboard.write_all(b"ls\r").await.unwrap();
        let mut typed = [0u8; 3];
        remote.stdin.read_exact(&mut typed).await.unwrap();
        assert_eq!(&typed, b"ls\r");

        remote.stdout.write_all(b"file\n").await.unwrap();
        remote.stderr.write_all(b"warn\n").await.unwrap();
        let mut out = [0u8; 5];
        screen.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"file\n");
        errors.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"warn\n");

        remote.status.send(Some(fixtures::exit_code(3))).unwrap();
        drop(remote.stdout);
        drop(remote.stderr);

        let status = relay.run().await.unwrap();
        assert_eq!(status, ExitStatus::Code(3));
        assert_eq!(relay.state(), RelayState::Draining);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn silent_stdout_does_not_block_stdin_or_stderr() {
        let (session, mut remote) = session_pair();
        let (mut keyboard, local_stdin) = tokio::io::duplex(64);
        let (local_stdout, _screen) = tokio::io::duplex(64);
        let (local_stderr, mut errors) = tokio::io::duplex(64);

        let relay = Relay::start(
            session,
            LocalIo::new(local_stdin, local_stdout, local_stderr),
            GRACE,
        )
        .unwrap();

        // Remote stdout never produces a byte
        keyboard.write_all(b"ping").await.unwrap();
        let mut typed = [0u8; 4];
        remote.stdin.read_exact(&mut typed).await.unwrap();
        assert_eq!(&typed, b"ping");

        remote.stderr.write_all(b"pong").await.unwrap();
        let mut err = [0u8; 4];
        errors.read_exact(&mut err).await.unwrap();
        assert_eq!(&err, b"pong");

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_local_stdout_does_not_block_stderr() {
        let (session, mut remote) = session_pair();
        let (_keyboard, local_stdin) = tokio::io::duplex(64);
        let (local_stderr, mut errors) = tokio::io::duplex(64);

        let relay = Relay::start(
            session,
            LocalIo::new(local_stdin, StalledWriter, local_stderr),
            GRACE,
        )
        .unwrap();

        remote.stdout.write_all(b"stuck").await.unwrap();
        remote.stderr.write_all(b"moving").await.unwrap();

        let mut err = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(5), errors.read_exact(&mut err))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&err, b"moving");

        // Shutdown completes even though the stdout pump is stuck writing
        tokio::time::timeout(Duration::from_secs(5), relay.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn local_eof_closes_remote_stdin_but_keeps_session() {
        let (session, mut remote) = session_pair();
        let (local_stdout, mut screen) = tokio::io::duplex(64);

        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), local_stdout, tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        let mut rest = Vec::new();
        remote.stdin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        remote.stdout.write_all(b"bye\n").await.unwrap();
        drop(remote.stdout);
        drop(remote.stderr);
        remote.status.send(Some(fixtures::success())).unwrap();

        assert_eq!(relay.run().await.unwrap(), ExitStatus::Success);
        let mut out = [0u8; 4];
        screen.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"bye\n");

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_is_queued_on_stdin() {
        let (session, mut remote) = session_pair();
        let (_keyboard, local_stdin) = tokio::io::duplex(64);

        let relay = Relay::start(
            session,
            LocalIo::new(local_stdin, tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        assert!(relay.interrupter().unwrap().interrupt().await);
        let mut byte = [0u8; 1];
        remote.stdin.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], INTERRUPT);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn remote_output_error_is_io_error() {
        let reader = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (_status_tx, status_rx) = tokio::sync::oneshot::channel::<()>();
        let completion: Completion = Box::pin(async move {
            let _ = status_rx.await;
            Ok(ExitStatus::Success)
        });
        let session = ExecSession::new(completion).with_stdout(reader);

        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        let err = relay.run().await.unwrap_err();
        assert!(
            matches!(err, Error::Io { stream: "stdout", .. }),
            "got {:?}",
            err
        );
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn output_closed_without_status_is_protocol_error() {
        let (session, remote) = session_pair();
        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        drop(remote.stdout);
        drop(remote.stderr);
        // Status sender kept alive but never used
        let _status = remote.status;

        let err = relay.run().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn one_closed_output_starts_draining_without_status() {
        let (session, remote) = session_pair();
        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        // Stdout closes; stderr and the status channel stay open
        drop(remote.stdout);
        let _stderr = remote.stderr;
        let _status = remote.status;

        let err = tokio::time::timeout(Duration::from_secs(3), relay.run())
            .await
            .expect("drain grace not applied")
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
        assert_eq!(relay.state(), RelayState::Draining);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn status_after_one_output_closes_is_returned() {
        let (session, remote) = session_pair();
        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            Duration::from_secs(2),
        )
        .unwrap();

        drop(remote.stdout);
        let _stderr = remote.stderr;
        let status_tx = remote.status;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = status_tx.send(Some(fixtures::exit_code(2)));
        });

        let status = relay.run().await.unwrap();
        assert_eq!(status, ExitStatus::Code(2));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn status_with_open_output_returns_after_grace() {
        let (session, remote) = session_pair();
        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        // Neither output ever closes
        let _stdout = remote.stdout;
        let _stderr = remote.stderr;
        remote.status.send(Some(fixtures::exit_code(4))).unwrap();

        let started = tokio::time::Instant::now();
        let status = tokio::time::timeout(Duration::from_secs(3), relay.run())
            .await
            .expect("drain grace not applied")
            .unwrap();
        assert_eq!(status, ExitStatus::Code(4));
        assert!(started.elapsed() >= GRACE);
        assert_eq!(relay.state(), RelayState::Draining);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn status_with_stalled_local_stdout_returns_after_grace() {
        let (session, mut remote) = session_pair();
        let mut relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), StalledWriter, tokio::io::sink()),
            GRACE,
        )
        .unwrap();

        remote.stdout.write_all(b"never shown").await.unwrap();
        drop(remote.stdout);
        drop(remote.stderr);
        remote.status.send(Some(fixtures::success())).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(3), relay.run())
            .await
            .expect("drain grace not applied")
            .unwrap();
        assert_eq!(status, ExitStatus::Success);

        tokio::time::timeout(Duration::from_secs(3), relay.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_reaches_closed() {
        let (session, _remote) = session_pair();
        let relay = Relay::start(
            session,
            LocalIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
            GRACE,
        )
        .unwrap();
        relay.shutdown().await;
    }
}
