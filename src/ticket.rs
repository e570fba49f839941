//! Suite ticket holder.
//!
//! The platform pushes a fresh `suite_ticket` to the callback URL roughly every
//! ten minutes. The most recent one is kept here and read by the suite token
//! source on every issuance.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// Thread-safe holder for the latest suite ticket.
///
/// Guarded by its own lock, independent from any credential store.
#[derive(Debug, Default)]
pub struct TicketHolder {
    value: RwLock<String>,
    activated: AtomicBool,
}

impl TicketHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ticket, or an empty string if none was ever pushed.
    pub fn get(&self) -> String {
        self.value.read().clone()
    }

    /// Whether a non-empty ticket was ever stored.
    pub fn is_set(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    /// Store `value` unless it is empty.
    ///
    /// Returns `true` exactly once: for the first non-empty value ever stored.
    /// Callers use that signal to start the refresher.
    pub fn set_if_non_empty(&self, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        *self.value.write() = value.to_string();
        !self.activated.swap(true, Ordering::AcqRel)
    }
}
