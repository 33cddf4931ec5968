//! In-memory exec transport for tests
//!
//! Each channel is a `tokio::io::duplex` pipe, so the channels are as
//! independent as the kube-rs ones: a full or idle pipe only blocks its own
//! direction. The test drives the remote process through [`RemoteEnd`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::TerminalSize;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

use super::{ExecSession, ExecTransport};
use crate::config::ConnectionCredentials;
use crate::request::ExecRequest;
use crate::status::ExitStatus;
use crate::{Error, Result};

/// Pipe capacity for each channel
const PIPE_CAPACITY: usize = 4096;

/// The remote process's side of an in-memory session
pub struct RemoteEnd {
    /// Bytes the client wrote to remote stdin
    pub stdin: DuplexStream,
    /// Write here to produce remote stdout
    pub stdout: DuplexStream,
    /// Write here to produce remote stderr
    pub stderr: DuplexStream,
    /// Resize events sent by the client
    pub resize: futures::channel::mpsc::Receiver<TerminalSize>,
    /// Send the exit status; `None` closes without a status, dropping the
    /// sender simulates a broken connection
    pub status: oneshot::Sender<Option<Status>>,
}

/// Create a connected session and the remote end that drives it
pub fn session_pair() -> (ExecSession, RemoteEnd) {
    let (client_stdin, remote_stdin) = tokio::io::duplex(PIPE_CAPACITY);
    let (client_stdout, remote_stdout) = tokio::io::duplex(PIPE_CAPACITY);
    let (client_stderr, remote_stderr) = tokio::io::duplex(PIPE_CAPACITY);
    let (resize_tx, resize_rx) = futures::channel::mpsc::channel(8);
    let (status_tx, status_rx) = oneshot::channel::<Option<Status>>();

    let completion = status_rx
        .map(|received| match received {
            Ok(status) => Ok(ExitStatus::from_status(status.as_ref())),
            Err(_) => Err(Error::protocol("connection closed before exit status")),
        })
        .boxed();

    let session = ExecSession::new(completion)
        .with_stdin(client_stdin)
        .with_stdout(client_stdout)
        .with_stderr(client_stderr)
        .with_resize(resize_tx);

    let remote = RemoteEnd {
        stdin: remote_stdin,
        stdout: remote_stdout,
        stderr: remote_stderr,
        resize: resize_rx,
        status: status_tx,
    };

    (session, remote)
}

/// Transport that hands out a pre-built session once
pub struct MemoryTransport {
    session: Mutex<Option<ExecSession>>,
    connects: AtomicUsize,
    last_request: Mutex<Option<ExecRequest>>,
}

impl MemoryTransport {
    /// Create a transport and the remote end of its only session
    pub fn new() -> (Self, RemoteEnd) {
        let (session, remote) = session_pair();
        (Self::with_session(session), remote)
    }

    /// Wrap an already-built session
    pub fn with_session(session: ExecSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            connects: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// How many times `connect` was called
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The request passed to the last `connect`
    pub fn last_request(&self) -> Option<ExecRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecTransport for MemoryTransport {
    async fn connect(
        &self,
        request: &ExecRequest,
        _credentials: &ConnectionCredentials,
    ) -> Result<ExecSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        self.session
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::upgrade("session already used"))
    }
}
