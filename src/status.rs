//! Remote process exit status
//!
//! The API server reports how the remote command ended as a `Status` object on
//! the error channel (channel 3). A clean exit is `{"status": "Success"}`; a
//! non-zero exit carries reason `NonZeroExitCode` with an `ExitCode` cause whose
//! message is the decimal exit code.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;

/// Status reason used by the kubelet for non-zero exits
const NON_ZERO_EXIT_REASON: &str = "NonZeroExitCode";

/// Cause reason carrying the numeric exit code
const EXIT_CODE_CAUSE: &str = "ExitCode";

/// Exit codes above this are `128 + signal` for processes killed by a signal
const SIGNAL_EXIT_BASE: i32 = 128;

/// Highest signal number we map back from an exit code
const MAX_SIGNAL: i32 = 64;

/// How the remote command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited with code 0
    Success,
    /// Exited with a non-zero code
    Code(i32),
    /// Killed by the given signal
    Signaled(i32),
    /// The server reported a failure without an exit code
    Failure {
        /// Machine-readable reason, if any
        reason: Option<String>,
        /// Human-readable message
        message: String,
    },
}

impl ExitStatus {
    /// Whether the remote command succeeded
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    /// Process exit code that mirrors this status
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Code(code) => *code,
            ExitStatus::Signaled(signal) => SIGNAL_EXIT_BASE + signal,
            ExitStatus::Failure { .. } => 1,
        }
    }

    /// Interpret the status object sent on the error channel.
    ///
    /// `None` means the stream closed without a status, which the API server
    /// does for a clean exit on older protocol versions.
    pub fn from_status(status: Option<&Status>) -> Self {
        let Some(status) = status else {
            return ExitStatus::Success;
        };

        if status.status.as_deref() == Some("Success") {
            return ExitStatus::Success;
        }

        if status.reason.as_deref() == Some(NON_ZERO_EXIT_REASON) {
            if let Some(code) = exit_code_cause(status) {
                return Self::from_code(code);
            }
        }

        ExitStatus::Failure {
            reason: status.reason.clone(),
            message: status
                .message
                .clone()
                .unwrap_or_else(|| "remote command failed".to_string()),
        }
    }

    /// Map a raw exit code, recognising `128 + signal`
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Success,
            c if c > SIGNAL_EXIT_BASE && c <= SIGNAL_EXIT_BASE + MAX_SIGNAL => {
                ExitStatus::Signaled(c - SIGNAL_EXIT_BASE)
            }
            c => ExitStatus::Code(c),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exited successfully"),
            ExitStatus::Code(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "terminated by signal {}", signal),
            ExitStatus::Failure { message, .. } => write!(f, "failed: {}", message),
        }
    }
}

fn exit_code_cause(status: &Status) -> Option<i32> {
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some(EXIT_CODE_CAUSE))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse().ok())
}
