//! Debounced single-shot flush timer.
//!
//! A request arms a timer for `update_delay`. Another request while the timer
//! is pending re-arms it, pushing the flush back, unless the channel has gone
//! without a flush for longer than `max_update_delay - update_delay`; then the
//! pending timer is left alone so a busy channel still flushes regularly.
//!
//! The scheduler does not serialise flushes. A request that arrives while a
//! flush is running arms a follow-up timer; the flush callback is expected to
//! take its own guard so the follow-up waits for the running one.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct FlushState {
    pending: Option<JoinHandle<()>>,
    /// Bumped for every armed timer
    generation: u64,
    last_flush: Option<Instant>,
}

impl FlushState {
    fn arm(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Called by a timer that has fired. Returns false when the timer was
    /// superseded, in which case it must not flush or touch `pending`.
    fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.pending = None;
        self.last_flush = Some(Instant::now());
        true
    }
}

#[derive(Debug, Clone)]
pub struct FlushScheduler {
    runtime: Handle,
    update_delay: Duration,
    max_update_delay: Duration,
    state: Arc<Mutex<FlushState>>,
}

impl FlushScheduler {
    pub fn new(runtime: Handle, update_delay: Duration, max_update_delay: Duration) -> Self {
        Self {
            runtime,
            update_delay,
            max_update_delay,
            state: Arc::new(Mutex::new(FlushState::default())),
        }
    }

    /// Schedule `flush` to run after `update_delay`, subject to the debounce rule
    pub fn request<F>(&self, flush: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if let Some(pending) = state.pending.take() {
            if !pending.is_finished() {
                let starved = state.last_flush.map_or(true, |last| {
                    last.elapsed() > self.max_update_delay.saturating_sub(self.update_delay)
                });
                if starved {
                    trace!("Flush already pending, not postponing");
                    state.pending = Some(pending);
                    return;
                }
                trace!("Postponing pending flush");
                pending.abort();
            }
        }

        let delay = self.update_delay;
        let shared = Arc::clone(&self.state);
        let generation = state.arm();
        state.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = shared
                .lock()
                .map(|mut state| state.fire(generation))
                .unwrap_or(false);
            if current {
                flush();
            } else {
                // An abort that lost the race with the wake-up
                trace!(generation, "Superseded flush timer skipped");
            }
        }));
    }

    /// Whether a flush timer is armed
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.as_ref().is_some_and(|p| !p.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            }
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = FlushScheduler::new(
            Handle::current(),
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        let (count, make) = counter();

        scheduler.request(make());
        assert!(scheduler.is_pending());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_after_recent_flush_are_debounced() {
        let scheduler = FlushScheduler::new(
            Handle::current(),
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        let (count, make) = counter();

        // Establish a recent flush so postponing is allowed
        scheduler.request(make());
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.request(make());
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.request(make());
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Re-armed at t+60, so nothing yet at t+120
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn superseded_timer_leaves_new_handle_alone() {
        let mut state = FlushState::default();
        let first = state.arm();
        let second = state.arm();

        assert!(!state.fire(first));
        assert_eq!(state.generation, second);
        assert!(state.last_flush.is_none());

        assert!(state.fire(second));
        assert!(state.last_flush.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn request_from_inside_flush_arms_follow_up() {
        let scheduler = FlushScheduler::new(
            Handle::current(),
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        let (count, make) = counter();

        let inner = scheduler.clone();
        let follow_up = make();
        let first = make();
        scheduler.request(move || {
            first();
            inner.request(follow_up);
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_pending());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn never_flushed_channel_is_not_postponed() {
        let scheduler = FlushScheduler::new(
            Handle::current(),
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        let (count, make) = counter();

        scheduler.request(make());
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.request(make());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
