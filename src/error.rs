//! Error types for podexec

use thiserror::Error;

use crate::status::ExitStatus;

/// Main error type for exec sessions
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad target, command, or CLI input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cluster connection details could not be resolved
    #[error("config error: {0}")]
    Config(String),

    /// Network, TLS, or client construction failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials were rejected by the API server
    #[error("auth error: {0}")]
    Auth(String),

    /// The API server refused to upgrade the connection
    #[error("upgrade error: {0}")]
    Upgrade(String),

    /// No controlling terminal, or the mode change failed
    #[error("terminal error: {0}")]
    Terminal(String),

    /// A relay direction failed mid-session
    #[error("{stream} i/o error: {source}")]
    Io {
        /// Which relay direction failed
        stream: &'static str,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The multiplexed transport misbehaved after the upgrade
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote command finished unsuccessfully
    #[error("remote command {0}")]
    RemoteProcess(ExitStatus),

    /// The local process was asked to terminate
    #[error("interrupted by signal {0}")]
    Interrupted(i32),

    /// An error tagged with the session phase it happened in
    #[error("{phase}: {source}")]
    Phase {
        /// Human-readable phase label
        phase: &'static str,
        /// The error raised during that phase
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an invalid-argument error with the given message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error with the given message
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an auth error with the given message
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an upgrade error with the given message
    pub fn upgrade(msg: impl Into<String>) -> Self {
        Self::Upgrade(msg.into())
    }

    /// Create a terminal error with the given message
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Create an I/O error for the named relay direction
    pub fn io(stream: &'static str, source: std::io::Error) -> Self {
        Self::Io { stream, source }
    }

    /// Create a protocol error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Strip phase labels and return the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code to report for this error.
    ///
    /// Remote failures mirror the remote status; local signals use the shell
    /// convention of `128 + signal`; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Error::RemoteProcess(status) => status.code(),
            Error::Interrupted(signal) => 128 + signal,
            _ => 1,
        }
    }
}

/// Extension trait to label errors with the session phase they came from.
pub trait PhaseExt<T> {
    /// Wrap the error in [`Error::Phase`] with the given label.
    fn phase(self, phase: &'static str) -> crate::Result<T>;
}

impl<T> PhaseExt<T> for crate::Result<T> {
    fn phase(self, phase: &'static str) -> crate::Result<T> {
        self.map_err(|source| Error::Phase {
            phase,
            source: Box::new(source),
        })
    }
}
