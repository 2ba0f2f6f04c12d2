//! Cancellable background tasks owned by one job.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tasks that share one cancellation token.
///
/// Cancelling stops new ticks from starting. A tick body that is already
/// running is left to finish.
pub struct TaskSet {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks spawned so far.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Spawn a task that should watch [`token`](Self::token) itself.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_cancelled() {
            return;
        }
        self.track(tokio::spawn(task));
    }

    /// Run `tick` every `period`, first one `period` from now.
    ///
    /// Late ticks are delayed rather than bunched. Ticks of one task never
    /// overlap since each body is awaited before the next tick is taken.
    pub fn spawn_repeating<F, Fut>(&self, name: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_cancelled() {
            return;
        }
        let name = name.into();
        let token = self.token.clone();
        let period = period.max(Duration::from_millis(1));

        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(task = %name, "repeating task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        tick().await;
                    }
                }
            }
        }));
    }

    /// Stop every task from taking another tick.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    /// Wait for every spawned task to return.
    pub async fn join(&self) {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }
}
