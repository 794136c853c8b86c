//! Cancellable scheduled tasks.
//!
//! A [`ScheduledTask`] runs a future after a delay on the tokio runtime. The
//! handle belongs to whoever armed it; dropping the handle cancels the task
//! unless it was [`detach`](ScheduledTask::detach)ed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Run `fut` once after `delay`.
    pub fn after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
            fut.await;
        });
        Self {
            handle: Some(handle),
            fired,
        }
    }

    /// Run `fut` right away. Unlike [`after`](Self::after) the task stays
    /// cancellable for its whole run.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(fut)),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `tick` every `period`, first after one full period.
    pub fn every<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        Self {
            handle: Some(handle),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True until the delay elapses or the task is cancelled.
    pub fn is_pending(&self) -> bool {
        match &self.handle {
            Some(h) => !h.is_finished() && !self.fired.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Abort the task. Has no effect once the callback started running.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !self.fired.load(Ordering::SeqCst) {
                handle.abort();
            }
        }
    }

    /// Let the task run to completion without this handle.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // a callback that already started finishes on its own
            if !self.fired.load(Ordering::SeqCst) {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("pending", &self.is_pending())
            .finish()
    }
}
