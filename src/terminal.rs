//! Local terminal mode control
//!
//! In cooked (canonical) mode the terminal driver edits lines and echoes
//! keystrokes before the program sees them. During a session the remote shell
//! does both, so the local terminal is switched to raw mode and every byte is
//! passed through untouched. [`RawModeGuard`] restores the previous mode when it
//! goes out of scope, on success, error, panic unwind, or signal teardown.

use std::io::{self, IsTerminal};

use futures::SinkExt;
use kube::api::TerminalSize;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::transport::ResizeSender;
use crate::{Error, Result};

/// Operations on the controlling terminal
#[cfg_attr(test, automock)]
pub trait TerminalControl: Send + Sync {
    /// Whether stdin is attached to a terminal
    fn is_terminal(&self) -> bool;

    /// Whether raw mode is currently enabled
    fn is_raw(&self) -> io::Result<bool>;

    /// Switch the terminal to raw mode
    fn enable_raw(&self) -> io::Result<()>;

    /// Restore the mode saved by `enable_raw`
    fn disable_raw(&self) -> io::Result<()>;

    /// Current size as (columns, rows)
    fn size(&self) -> io::Result<(u16, u16)>;
}

/// The process's controlling terminal, via crossterm
#[derive(Debug, Default, Clone, Copy)]
pub struct CrosstermTerminal;

impl TerminalControl for CrosstermTerminal {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn is_raw(&self) -> io::Result<bool> {
        crossterm::terminal::is_raw_mode_enabled()
    }

    fn enable_raw(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable_raw(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        crossterm::terminal::size()
    }
}

/// Mode the terminal was in before raw mode was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSnapshot {
    was_raw: bool,
}

/// Holds the terminal in raw mode until dropped.
///
/// The snapshot is restored exactly once, either by [`RawModeGuard::release`]
/// or by `Drop`.
pub struct RawModeGuard<'a, T: TerminalControl + ?Sized> {
    terminal: &'a T,
    snapshot: Option<TerminalSnapshot>,
}

impl<'a, T: TerminalControl + ?Sized> RawModeGuard<'a, T> {
    /// Capture the current mode and switch to raw mode.
    ///
    /// Fails with [`Error::Terminal`] when stdin is not a terminal or the mode
    /// cannot be changed. A terminal that is already raw is left as is.
    pub fn acquire(terminal: &'a T) -> Result<Self> {
        if !terminal.is_terminal() {
            return Err(Error::terminal("stdin is not a terminal"));
        }

        let was_raw = terminal
            .is_raw()
            .map_err(|e| Error::terminal(format!("failed to read terminal mode: {}", e)))?;
        if !was_raw {
            terminal
                .enable_raw()
                .map_err(|e| Error::terminal(format!("failed to enable raw mode: {}", e)))?;
        }

        debug!(was_raw, "Terminal in raw mode");
        Ok(Self {
            terminal,
            snapshot: Some(TerminalSnapshot { was_raw }),
        })
    }

    /// The captured mode, until it has been restored
    pub fn snapshot(&self) -> Option<TerminalSnapshot> {
        self.snapshot
    }

    /// Restore the captured mode now, reporting failure
    pub fn release(mut self) -> Result<()> {
        self.restore()
            .map_err(|e| Error::terminal(format!("failed to restore terminal mode: {}", e)))
    }

    fn restore(&mut self) -> io::Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };
        if snapshot.was_raw {
            return Ok(());
        }
        debug!("Restoring terminal mode");
        self.terminal.disable_raw()
    }
}

impl<T: TerminalControl + ?Sized> Drop for RawModeGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Send the current terminal size, then again on every window change.
///
/// Returns when the session stops accepting resizes.
pub async fn forward_resizes<T: TerminalControl + ?Sized>(terminal: &T, mut tx: ResizeSender) {
    if !send_size(terminal, &mut tx).await {
        return;
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut winch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to watch window size changes");
                return;
            }
        };
        while winch.recv().await.is_some() {
            if !send_size(terminal, &mut tx).await {
                return;
            }
        }
    }
}

async fn send_size<T: TerminalControl + ?Sized>(terminal: &T, tx: &mut ResizeSender) -> bool {
    match terminal.size() {
        Ok((width, height)) => {
            debug!(width, height, "Sending terminal size");
            tx.send(TerminalSize { width, height }).await.is_ok()
        }
        Err(e) => {
            debug!(error = %e, "Terminal size unavailable");
            true
        }
    }
}
