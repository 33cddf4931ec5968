//! Multiplexed exec transport
//!
//! An [`ExecTransport`] performs the upgrade handshake for an [`ExecRequest`]
//! and hands back an [`ExecSession`]: independent stdin/stdout/stderr byte
//! channels over one connection plus a future that resolves with the remote
//! exit status. The kube-rs implementation lives in [`kubernetes`]; tests use
//! the in-memory one in `memory`.

pub mod kubernetes;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;
use kube::api::TerminalSize;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ConnectionCredentials;
use crate::request::ExecRequest;
use crate::status::ExitStatus;
use crate::Result;

pub use kubernetes::KubeTransport;

/// K8s channel IDs used by the exec subprotocol
pub mod channel {
    /// Channel 0: stdin
    pub const STDIN: u8 = 0;
    /// Channel 1: stdout
    pub const STDOUT: u8 = 1;
    /// Channel 2: stderr
    pub const STDERR: u8 = 2;
    /// Channel 3: error/status
    pub const ERROR: u8 = 3;
    /// Channel 4: terminal resize
    pub const RESIZE: u8 = 4;

    /// Label used in logs and errors for a channel
    pub fn name(id: u8) -> &'static str {
        match id {
            STDIN => "stdin",
            STDOUT => "stdout",
            STDERR => "stderr",
            ERROR => "error",
            RESIZE => "resize",
            _ => "unknown",
        }
    }
}

/// Writer half of the remote stdin channel
pub type RemoteWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Reader half of a remote output channel
pub type RemoteReader = Box<dyn AsyncRead + Unpin + Send>;

/// Future resolving once the remote process has finished
pub type Completion = BoxFuture<'static, Result<ExitStatus>>;

/// Sender for terminal size updates
pub type ResizeSender = futures::channel::mpsc::Sender<TerminalSize>;

/// A connected exec session.
///
/// Each channel can be taken exactly once; the relay owns them for the rest of
/// the session. Dropping the session closes the connection.
pub struct ExecSession {
    stdin: Option<RemoteWriter>,
    stdout: Option<RemoteReader>,
    stderr: Option<RemoteReader>,
    resize: Option<ResizeSender>,
    completion: Option<Completion>,
}

impl ExecSession {
    /// Create a session that finishes when `completion` resolves
    pub fn new(completion: Completion) -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
            resize: None,
            completion: Some(completion),
        }
    }

    /// Attach the remote stdin writer
    pub fn with_stdin(mut self, writer: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        self.stdin = Some(Box::new(writer));
        self
    }

    /// Attach the remote stdout reader
    pub fn with_stdout(mut self, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.stdout = Some(Box::new(reader));
        self
    }

    /// Attach the remote stderr reader
    pub fn with_stderr(mut self, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.stderr = Some(Box::new(reader));
        self
    }

    /// Attach the terminal resize sender
    pub fn with_resize(mut self, resize: ResizeSender) -> Self {
        self.resize = Some(resize);
        self
    }

    /// Take the remote stdin writer
    pub fn take_stdin(&mut self) -> Option<RemoteWriter> {
        self.stdin.take()
    }

    /// Take the remote stdout reader
    pub fn take_stdout(&mut self) -> Option<RemoteReader> {
        self.stdout.take()
    }

    /// Take the remote stderr reader
    pub fn take_stderr(&mut self) -> Option<RemoteReader> {
        self.stderr.take()
    }

    /// Take the terminal resize sender
    pub fn take_resize(&mut self) -> Option<ResizeSender> {
        self.resize.take()
    }

    /// Take the completion future
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("resize", &self.resize.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

/// Opens exec sessions.
///
/// Implementations perform exactly one upgrade handshake per call and never
/// retry: a TTY session may already have shown output to the user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecTransport: Send + Sync {
    /// Upgrade the connection for `request` and return the live session
    async fn connect(
        &self,
        request: &ExecRequest,
        credentials: &ConnectionCredentials,
    ) -> Result<ExecSession>;
}
