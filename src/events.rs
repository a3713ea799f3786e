//! Event definitions for the application event loop.
//!
//! This module defines the `Event` enum which encapsulates all possible events
//! that drive the application's state transitions, including service lifecycle
//! updates, user input, and system signals.

use crossterm::event::{KeyEvent, MouseEvent};

use crate::service::ServiceId;

/// Signals delivered to a service's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSignal {
    /// Polite request to terminate (SIGTERM, CTRL_BREAK on Windows).
    Term,
    /// Unconditional kill.
    Kill,
}

impl ServiceSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceSignal::Term if cfg!(windows) => "CTRL_BREAK",
            ServiceSignal::Term => "SIGTERM",
            ServiceSignal::Kill => "SIGKILL",
        }
    }
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A service was spawned.
    ServiceStarted { id: ServiceId, pid: u32 },
    /// A service exited. Signal deaths carry the negated signal number.
    ServiceExited { id: ServiceId, code: Option<i32> },
    /// Waiting on a service failed.
    ServiceFailed { id: ServiceId, error: String },
    /// A signal was sent to a service.
    ServiceSignaled { id: ServiceId, signal: ServiceSignal },
    /// Time to launch the autostart groups.
    Autostart,
    /// Ctrl-C or SIGTERM reached svcrack itself.
    Shutdown,
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// A mouse event received from the user.
    Mouse(MouseEvent),
    /// The terminal window was resized.
    Resize,
}
