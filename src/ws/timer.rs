#![expect(
    clippy::module_name_repetitions,
    reason = "Timer handles are named after what they cancel"
)]

//! Cancellable one-shot timers.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Deferred work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
///
/// Implementations must never run the task inline from [`Scheduler::schedule`]; callers may
/// be holding locks that the task itself needs.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Handle to a pending timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// [`Scheduler`] backed by tokio tasks on a captured runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        Ok(Self {
            handle: Handle::try_current()?,
        })
    }

    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                biased;

                () = cancelled.cancelled() => {}
                () = sleep(delay) => {
                    if !cancelled.is_cancelled() {
                        task();
                    }
                }
            }
        });

        TimerHandle::new(token)
    }
}
