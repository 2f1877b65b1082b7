//! Provisioning progress notifications
//!
//! Status codes are written to the BLE status characteristic as a single
//! byte. Nothing is queued: while no client is subscribed, reports are
//! dropped, and a new subscriber first sees `Idle`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Idle = 0x00,
    Connecting = 0x01,
    JoinSucceeded = 0x02,
    ClaimSucceeded = 0x03,
    JoinFailed = 0x04,
    ClaimFailed = 0x05,
}

impl StatusCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Idle => "idle",
            StatusCode::Connecting => "connecting WiFi",
            StatusCode::JoinSucceeded => "WiFi connected",
            StatusCode::ClaimSucceeded => "claim succeeded",
            StatusCode::JoinFailed => "WiFi failed",
            StatusCode::ClaimFailed => "claim failed",
        };
        write!(f, "{} (0x{:02X})", text, self.as_byte())
    }
}

/// Gated sender for status codes
pub struct StatusReporter {
    subscribed: AtomicBool,
    tx: mpsc::UnboundedSender<StatusCode>,
}

impl StatusReporter {
    /// Create a reporter and the receiving end the notify path drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusCode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            subscribed: AtomicBool::new(false),
            tx,
        };
        (reporter, rx)
    }

    /// Record a subscribe/unsubscribe event from the notification subsystem.
    /// Subscribing always emits the `Idle` baseline, queued before any
    /// `report` can pass the gate.
    pub fn set_subscribed(&self, subscribed: bool) {
        if subscribed {
            info!("Status notifications enabled");
            self.emit(StatusCode::Idle);
        } else {
            info!("Status notifications disabled");
        }
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Emit `code` if a subscriber is attached. Returns whether it was sent.
    pub fn report(&self, code: StatusCode) -> bool {
        if !self.is_subscribed() {
            debug!("No subscriber, dropping status {}", code);
            return false;
        }
        self.emit(code)
    }

    fn emit(&self, code: StatusCode) -> bool {
        info!("Status: {}", code);
        self.tx.send(code).is_ok()
    }
}
