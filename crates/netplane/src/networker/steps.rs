//! Step conventions
//!
//! Steps that must succeed use `?` with [`Context`](crate::error::Context)
//! and abort the call. The helpers below run steps whose failure is only
//! logged: cleanup of state that is about to be replaced, and the unwind
//! after a failed call, where the original error is what the caller sees.

use super::Combined;
use std::fmt::Display;
use std::future::Future;
use tracing::{error, warn};

/// Run a cleanup step, logging a failure
pub(super) async fn best_effort<F, E>(step: &str, fut: F)
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    if let Err(e) = fut.await {
        warn!(step, "{}", e);
    }
}

/// Run a rollback step, logging a failure
pub(super) async fn unwind<F, E>(step: &str, fut: F)
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    if let Err(e) = fut.await {
        error!(step, "rollback failed: {}", e);
    }
}

impl Combined {
    /// Publish a progress message. Nobody listening is fine.
    pub(super) fn publish(&self, message: &str) {
        let _ = self.events.send(message.to_string());
    }
}
