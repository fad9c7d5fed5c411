//! Signal handling for the importer (SIGINT/SIGTERM)
//!
//! On the first signal the shared [`CancellationToken`] is cancelled. Every
//! stage watches it: the event stream is dropped, a running fetch or load is
//! killed, and a partially downloaded artifact is removed.
//!
//! On a second signal the process exits immediately with
//! [`EXIT_CODE_CANCELLED`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Exit code for interrupted imports
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Signal handler state
#[derive(Debug)]
pub struct SignalState {
    signal_count: AtomicU8,
    token: CancellationToken,
}

impl SignalState {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            signal_count: AtomicU8::new(0),
            token,
        }
    }

    /// Check if cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get the number of signals received
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle a signal and return the action to take
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            self.token.cancel();
            SignalAction::InitiateCancellation
        } else if count == 1 {
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the running import
    InitiateCancellation,
    /// Second signal: exit immediately
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Bridges process signals to a cancellation token
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(SignalState::new(token)),
        }
    }

    /// Get a reference to the signal state
    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the process-wide handler. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                eprintln!("\nReceived interrupt signal, cancelling import...");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately...");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}
