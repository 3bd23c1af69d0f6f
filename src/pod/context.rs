//! Cancellable, deadline-bounded execution context.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on any single operation budget.
const MAX_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

/// Why an operation stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The owning session cancelled the operation.
    Cancelled,
    /// The deadline elapsed.
    DeadlineExceeded,
}

/// Cancellation handle plus absolute deadline shared by one lifecycle step.
#[derive(Debug, Clone)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl OperationContext {
    /// Context expiring `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self::with_token(CancellationToken::new(), budget)
    }

    /// Context expiring `budget` from now, cancelled through `cancel`.
    pub fn with_token(cancel: CancellationToken, budget: Duration) -> Self {
        let now = Instant::now();
        let deadline = now.checked_add(budget.min(MAX_BUDGET)).unwrap_or(now);
        Self { cancel, deadline }
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancellation handle for this context.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every operation running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves when the context is cancelled or its deadline passes.
    ///
    /// Cancellation wins when both have already happened.
    pub async fn done(&self) -> Interrupt {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Interrupt::Cancelled,
            () = tokio::time::sleep_until(self.deadline) => Interrupt::DeadlineExceeded,
        }
    }
}
