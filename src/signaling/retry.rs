//! Reconnect policy and timer scheduling
//!
//! The transport does not sleep on its own. It asks a [`Scheduler`] to run the
//! next attempt after [`RetryPolicy::delay_for`], so tests can drive the
//! backoff sequence without waiting on real timers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Exponential backoff: `base_delay * 2^attempt`, at most `max_attempts` retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before the retry that follows `attempt` failed retries
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another retry may be scheduled after `attempt` retries
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs a task after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Scheduler backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

/// Scheduler that parks tasks until the caller fires them
///
/// Records every requested delay, which lets tests assert the backoff curve.
#[derive(Default, Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualSchedulerState>>,
}

#[derive(Default)]
struct ManualSchedulerState {
    delays: Vec<Duration>,
    pending: Vec<BoxFuture<'static, ()>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order
    pub fn delays(&self) -> Vec<Duration> {
        self.inner.lock().delays.clone()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Run the oldest parked task to completion. Returns `false` if none was parked.
    pub async fn fire_next(&self) -> bool {
        let task = {
            let mut state = self.inner.lock();
            if state.pending.is_empty() {
                None
            } else {
                Some(state.pending.remove(0))
            }
        };

        match task {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        let mut state = self.inner.lock();
        state.delays.push(delay);
        state.pending.push(task);
    }
}
