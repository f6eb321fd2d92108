//! Cancellable periodic task with at most one tick in flight.
//!
//! The next tick is scheduled only after the current one settles, so results
//! from one task can never arrive out of order. Cancelling drops an in-flight
//! tick at its next suspension point; callers that fold results into shared
//! state must still guard the fold (see the epoch checks in `scan` and `logs`)
//! because the fold itself may race with a cancellation issued from another
//! thread.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// When the first tick runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediate,
    AfterInterval,
}

/// Handle to a spawned periodic task. Dropping it cancels the task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `interval`, measured from the end of the previous
    /// tick. The task ends when `tick` returns `ControlFlow::Break`, or on
    /// cancellation.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        first: FirstTick,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            if first == FirstTick::AfterInterval && !rest(&cancel, interval).await {
                return;
            }
            loop {
                let flow = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    flow = tick() => flow,
                };
                if flow.is_break() {
                    tracing::debug!(task = name, "periodic task finished");
                    break;
                }
                if !rest(&cancel, interval).await {
                    break;
                }
            }
        });
        tracing::debug!(task = name, ?interval, "periodic task started");
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(task = self.name, "periodic task cancelled");
            self.token.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sleep for `interval`; `false` if cancelled first.
async fn rest(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(interval) => true,
    }
}
