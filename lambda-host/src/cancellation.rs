//! Deadline-bounded cancellation handles for invocations and shutdown.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CancellationError;

/// Produces [`CancellationHandle`]s bound to an invocation's remaining time,
/// or to an explicit duration for the init and shutdown phases.
#[derive(Debug, Clone)]
pub struct CancellationFactory {
    /// Linked to the process-wide stop signal; firing it cancels every
    /// handle derived from this factory regardless of their own deadline.
    process_stop: CancellationToken,
}

impl CancellationFactory {
    pub(crate) fn new(process_stop: CancellationToken) -> Self {
        Self { process_stop }
    }

    /// Builds a handle that fires at `now + remaining_time - buffer`.
    ///
    /// Fails with [`CancellationError::InvalidContext`] if `remaining_time`
    /// is not strictly positive, and with
    /// [`CancellationError::InsufficientBudget`] if it does not leave room
    /// for `buffer`.
    pub fn new_for_remaining_time(
        &self,
        remaining_time: Duration,
        buffer: Duration,
    ) -> Result<CancellationHandle, CancellationError> {
        if remaining_time.is_zero() {
            return Err(CancellationError::InvalidContext);
        }
        if remaining_time <= buffer {
            return Err(CancellationError::InsufficientBudget);
        }
        Ok(self.spawn(remaining_time - buffer))
    }

    /// Builds a handle bound to a flat duration, used for the init and
    /// shutdown phases where there is no per-invocation deadline header.
    pub fn new_for_duration(&self, duration: Duration) -> CancellationHandle {
        self.spawn(duration)
    }

    fn spawn(&self, fires_in: Duration) -> CancellationHandle {
        let token = self.process_stop.child_token();
        let deadline_token = token.clone();
        let deadline = Instant::now() + fires_in;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            deadline_token.cancel();
        });
        CancellationHandle { token, timer }
    }
}

/// A handle that fires no later than a configured deadline, or as soon as
/// the process stop signal is raised, whichever comes first.
#[derive(Debug)]
pub struct CancellationHandle {
    token: CancellationToken,
    timer: tokio::task::JoinHandle<()>,
}

impl CancellationHandle {
    /// Returns `true` if the handle has already fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A cloneable token usable for `select!`-style racing against other
    /// futures, without taking ownership of the handle.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for CancellationHandle {
    fn drop(&mut self) {
        // Release the timer task early once the invocation no longer needs
        // the handle; the handle itself firing is independent of this.
        self.timer.abort();
    }
}
