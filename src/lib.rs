//! podexec - interactive exec into a Kubernetes pod
//!
//! Opens a shell (or any command) inside a running container through the API
//! server's `exec` subresource and wires it to the local terminal, the way
//! `kubectl exec -it` does.
//!
//! # Architecture
//!
//! A session runs in a fixed order:
//! 1. Build the exec request for the target pod and command
//! 2. Upgrade the connection into independent stdin/stdout/stderr channels
//! 3. Switch the local terminal to raw mode
//! 4. Relay bytes until the remote process exits
//! 5. Restore the terminal and report the remote exit status
//!
//! # Modules
//!
//! - [`request`] - Exec request construction and parsing
//! - [`transport`] - Connection upgrade and channel demultiplexing (kube-rs)
//! - [`terminal`] - Raw mode guard and terminal size forwarding
//! - [`relay`] - Per-direction stream pumps and drain handling
//! - [`session`] - End-to-end orchestration with phase-labelled errors
//! - [`config`] - Kubeconfig resolution
//! - [`cli`] - Command-line parsing
//! - [`status`] - Remote exit status decoding
//! - [`error`] - Error types and exit code mapping

#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod relay;
pub mod request;
pub mod session;
pub mod status;
pub mod terminal;
pub mod transport;

pub use error::{Error, PhaseExt};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
