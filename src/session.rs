//! Session orchestration
//!
//! Runs one exec session end to end: resolve the namespace, build the request,
//! upgrade the connection, put the terminal in raw mode, relay until the remote
//! process exits, then restore the terminal. Every failure carries the label of
//! the phase it happened in.

use std::convert::Infallible;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ClusterConnection, ExecConfig};
use crate::relay::{Interrupter, LocalIo, Relay};
use crate::request::{build, ExecTarget, SessionOptions};
use crate::status::ExitStatus;
use crate::terminal::{forward_resizes, RawModeGuard, TerminalControl};
use crate::transport::{ExecSession, ExecTransport, ResizeSender};
use crate::{Error, PhaseExt, Result};

/// Phase labels prefixed to errors
pub mod phase {
    /// Loading kubeconfig or in-cluster config
    pub const CLIENT_CONFIG: &str = "while getting client cfg";
    /// Picking the namespace
    pub const NAMESPACE: &str = "while getting default namespace";
    /// Validating the target and command
    pub const BUILD_REQUEST: &str = "while building exec request";
    /// Upgrade handshake
    pub const UPGRADE: &str = "while upgrading connection";
    /// Entering raw mode
    pub const RAW_MODE: &str = "while putting terminal into raw mode";
    /// Leaving raw mode
    pub const RESTORE: &str = "while restoring terminal";
    /// Relaying the live session
    pub const RELAY: &str = "connect to process";
}

/// Run one exec session to completion.
///
/// Returns `Ok(())` when the remote command exits successfully and
/// [`Error::RemoteProcess`] when it does not. The terminal is restored before
/// this returns, on every path.
pub async fn run_exec<T, K>(
    config: &ExecConfig,
    connection: &ClusterConnection,
    transport: &T,
    terminal: &K,
    local: LocalIo,
) -> Result<()>
where
    T: ExecTransport + ?Sized,
    K: TerminalControl + ?Sized,
{
    let namespace = config.namespace_for(connection).phase(phase::NAMESPACE)?;
    let target = ExecTarget::new(namespace, config.pod.as_str(), config.container.as_str());
    let request =
        build(&target, &config.command, SessionOptions::interactive()).phase(phase::BUILD_REQUEST)?;

    info!(
        namespace = %target.namespace(),
        pod = %target.pod_name(),
        command = ?config.command.args(),
        "Exec to pod"
    );

    let mut session = transport
        .connect(&request, &connection.credentials)
        .await
        .phase(phase::UPGRADE)?;

    let signals = TerminationSignals::install();
    let guard = RawModeGuard::acquire(terminal).phase(phase::RAW_MODE)?;
    let resize = session.take_resize();

    let result = relay_session(
        session,
        local,
        config.drain_grace,
        terminal,
        resize,
        signals,
    )
    .await;

    let released = guard.release();
    let status = result.phase(phase::RELAY)?;
    released.phase(phase::RESTORE)?;

    debug!(%status, "Remote command finished");
    if status.success() {
        Ok(())
    } else {
        Err(Error::RemoteProcess(status))
    }
}

/// Relay the session while watching for signals and window size changes.
///
/// All pumps are stopped before this returns.
async fn relay_session<K: TerminalControl + ?Sized>(
    session: ExecSession,
    local: LocalIo,
    grace: Duration,
    terminal: &K,
    resize: Option<ResizeSender>,
    mut signals: TerminationSignals,
) -> Result<ExitStatus> {
    let mut relay = Relay::start(session, local, grace)?;
    let interrupter = relay.interrupter();

    let resizes = async {
        if let Some(tx) = resize {
            forward_resizes(terminal, tx).await;
        }
        std::future::pending::<Infallible>().await
    };

    let outcome = tokio::select! {
        status = relay.run() => status,
        signal = signals.recv() => {
            info!(signal, "Terminating session");
            Err(Error::Interrupted(signal))
        }
        never = forward_interrupts(interrupter) => match never {},
        never = resizes => match never {},
    };

    relay.shutdown().await;
    outcome
}

/// Forward SIGINT to the remote process as a Ctrl-C byte.
///
/// In raw mode the Ctrl-C key already arrives as a byte on stdin; this covers
/// SIGINT delivered from outside the terminal.
async fn forward_interrupts(interrupter: Option<Interrupter>) -> Infallible {
    if let Some(interrupter) = interrupter {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for SIGINT");
                break;
            }
            debug!("Forwarding interrupt");
            if !interrupter.interrupt().await {
                break;
            }
        }
    }
    std::future::pending().await
}

/// Listeners for the signals that end a session (SIGTERM and SIGHUP).
///
/// Must be installed before the terminal enters raw mode; until then these
/// signals keep their default action.
pub struct TerminationSignals {
    #[cfg(unix)]
    streams: Option<(
        tokio::signal::unix::Signal,
        tokio::signal::unix::Signal,
    )>,
}

impl TerminationSignals {
    /// Register the listeners. On failure the session runs without them.
    #[cfg(unix)]
    pub fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let streams = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => Some((terminate, hangup)),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers");
                None
            }
        };
        Self { streams }
    }

    /// Register the listeners. On failure the session runs without them.
    #[cfg(not(unix))]
    pub fn install() -> Self {
        Self {}
    }

    /// Wait for the next terminating signal and return its number
    #[cfg(unix)]
    pub async fn recv(&mut self) -> i32 {
        let Some((terminate, hangup)) = self.streams.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            _ = terminate.recv() => SIGTERM,
            _ = hangup.recv() => SIGHUP,
        }
    }

    /// Wait for the next terminating signal and return its number
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> i32 {
        std::future::pending().await
    }
}

#[cfg(unix)]
const SIGHUP: i32 = 1;
#[cfg(unix)]
const SIGTERM: i32 = 15;
