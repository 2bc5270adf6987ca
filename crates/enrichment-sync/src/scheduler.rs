use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Owned, cancellable one-shot timer.
///
/// Scheduling again replaces (and aborts) the pending timer, which gives
/// debounce semantics. The callback runs synchronously after the delay; work
/// that needs to await should spawn its own task from inside the callback so
/// a later reschedule only ever cancels the sleep.
pub struct ScheduledTask {
    label: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handle: Mutex::new(None),
        }
    }

    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.handle.lock();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        let label = self.label;
        trace!(
            target = "enrichment::scheduler",
            task = label,
            delay_ms = delay.as_millis() as u64,
            "scheduling"
        );
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(target = "enrichment::scheduler", task = label, "firing");
            callback();
        }));
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if !handle.is_finished() {
                trace!(target = "enrichment::scheduler", task = self.label, "cancelled");
            }
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test_timeout::tokio_timeout_test(paused)]
    async fn reschedule_debounces() {
        let fired = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::new("test");
        for _ in 0..3 {
            let fired = fired.clone();
            task.schedule(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!task.is_pending());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let task = ScheduledTask::new("test");
        {
            let fired = fired.clone();
            task.schedule(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(task.is_pending());
        task.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
