//! Pull-based completion queue bridging event callbacks to awaiting callers.
//!
//! Producers (connection, session and link callbacks) call
//! [`AsyncOperationQueue::complete_operation`] from synchronous code. A single
//! consumer awaits the result with [`AsyncOperationQueue::wait_for_result`] or
//! [`AsyncOperationQueue::wait_for_polled_result`]; the latter pumps the
//! supplied [`Pollable`] participants between checks so I/O keeps moving for
//! callers that are the only thing driving a connection or listener.

use super::context::Context;
use crate::AmqpResult;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Default delay between pump iterations while a wait has pollables to drive.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A participant that needs to be driven while somebody waits.
pub trait Pollable: Send + Sync {
    /// Performs whatever work is pending without blocking.
    fn poll(&self) -> AmqpResult<()>;

    /// Reports whether this participant holds a result for its own consumer.
    ///
    /// A wait returns early (with no value) when any of its pollables becomes
    /// ready, so one wait can watch several queues at once.
    fn is_ready(&self) -> bool {
        false
    }
}

/// How a second completion is stored when the first has not been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Keep one result; a newer completion replaces it and logs a warning.
    SingleSlot,
    /// Keep every result in completion order.
    Fifo,
}

/// Thread-safe result box with one consumer and any number of producers.
pub struct AsyncOperationQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    mode: QueueMode,
    poll_interval: Duration,
}

impl<T> Default for AsyncOperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AsyncOperationQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperationQueue")
            .field("mode", &self.mode)
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> AsyncOperationQueue<T> {
    /// Creates a single-slot queue.
    pub fn new() -> Self {
        Self::with_mode(QueueMode::SingleSlot)
    }

    /// Creates a queue that retains every completion in order.
    pub fn fifo() -> Self {
        Self::with_mode(QueueMode::Fifo)
    }

    pub fn with_mode(mode: QueueMode) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            mode,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value` and wakes the waiting consumer, if any.
    pub fn complete_operation(&self, value: T) {
        {
            let mut items = self.items();
            if self.mode == QueueMode::SingleSlot && !items.is_empty() {
                log::warn!(
                    "AsyncOperationQueue: overwriting an unconsumed result ({} pending)",
                    items.len()
                );
                items.clear();
            }
            items.push_back(value);
        }
        self.notify.notify_one();
    }

    /// Removes and returns the oldest completed value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Drops every retained value.
    pub fn clear(&self) {
        self.items().clear();
    }

    /// Waits for a completion or for `ctx` to be cancelled.
    pub async fn wait_for_result(&self, ctx: &Context) -> Option<T> {
        self.wait_for_polled_result(ctx, &[]).await
    }

    /// Waits for a completion while pumping `pollables`.
    ///
    /// Each iteration checks for a result, polls every participant, checks
    /// again and then checks `ctx`. Returns `None` when the context is
    /// cancelled, when a participant fails to poll, or when another
    /// participant reports a ready result of its own.
    pub async fn wait_for_polled_result(
        &self,
        ctx: &Context,
        pollables: &[&dyn Pollable],
    ) -> Option<T> {
        loop {
            if let Some(value) = self.try_take() {
                return Some(value);
            }

            for pollable in pollables {
                if let Err(e) = pollable.poll() {
                    log::warn!("AsyncOperationQueue: pollable failed, abandoning wait: {e}");
                    return self.try_take();
                }
            }

            if let Some(value) = self.try_take() {
                return Some(value);
            }
            if ctx.is_cancelled() {
                return None;
            }
            if pollables.iter().any(|pollable| pollable.is_ready()) {
                return None;
            }

            if pollables.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = ctx.cancelled() => {}
                }
            } else {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = ctx.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }
}

impl<T: Send> Pollable for AsyncOperationQueue<T> {
    fn poll(&self) -> AmqpResult<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AmqpError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct CountingPollable {
        polls: AtomicUsize,
    }

    impl Pollable for CountingPollable {
        fn poll(&self) -> AmqpResult<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingPollable;

    impl Pollable for FailingPollable {
        fn poll(&self) -> AmqpResult<()> {
            Err(AmqpError::ConnectionClosed("gone".into()))
        }
    }

    #[tokio::test]
    async fn test_completed_value_is_returned() {
        let queue = AsyncOperationQueue::new();
        queue.complete_operation((7u32, "seven".to_string()));

        let result = queue.wait_for_result(&Context::new()).await;
        assert_eq!(result, Some((7, "seven".to_string())));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_returns_promptly() {
        let queue: AsyncOperationQueue<u32> = AsyncOperationQueue::new();
        let ctx = Context::new();
        ctx.cancel();

        let started = Instant::now();
        assert_eq!(queue.wait_for_result(&ctx).await, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_expired_deadline_returns_none() {
        let queue: AsyncOperationQueue<u32> = AsyncOperationQueue::new();
        let ctx = Context::with_timeout(Duration::from_millis(20));
        assert_eq!(queue.wait_for_result(&ctx).await, None);
    }

    #[tokio::test]
    async fn test_single_slot_overwrites() {
        let queue = AsyncOperationQueue::new();
        queue.complete_operation(1);
        queue.complete_operation(2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_take(), Some(2));
    }

    #[tokio::test]
    async fn test_fifo_keeps_order() {
        let queue = AsyncOperationQueue::fifo();
        queue.complete_operation(1);
        queue.complete_operation(2);
        let ctx = Context::new();
        assert_eq!(queue.wait_for_result(&ctx).await, Some(1));
        assert_eq!(queue.wait_for_result(&ctx).await, Some(2));
    }

    #[tokio::test]
    async fn test_completion_from_another_task_wakes_waiter() {
        let queue = Arc::new(AsyncOperationQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.complete_operation("done");
        });

        let ctx = Context::with_timeout(Duration::from_secs(5));
        assert_eq!(queue.wait_for_result(&ctx).await, Some("done"));
    }

    #[tokio::test]
    async fn test_pollables_are_driven_while_waiting() {
        let queue: AsyncOperationQueue<u32> = AsyncOperationQueue::new();
        let pollable = CountingPollable {
            polls: AtomicUsize::new(0),
        };
        let ctx = Context::with_timeout(Duration::from_millis(50));

        assert_eq!(queue.wait_for_polled_result(&ctx, &[&pollable]).await, None);
        assert!(pollable.polls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_ready_waiter_ends_wait() {
        let queue: AsyncOperationQueue<u32> = AsyncOperationQueue::new();
        let other: AsyncOperationQueue<&str> = AsyncOperationQueue::new();
        other.complete_operation("listener");

        let ctx = Context::with_timeout(Duration::from_secs(5));
        assert_eq!(queue.wait_for_polled_result(&ctx, &[&other]).await, None);
        assert_eq!(other.try_take(), Some("listener"));
    }

    #[tokio::test]
    async fn test_failing_pollable_ends_wait() {
        let queue: AsyncOperationQueue<u32> = AsyncOperationQueue::new();
        let ctx = Context::with_timeout(Duration::from_secs(5));
        assert_eq!(
            queue
                .wait_for_polled_result(&ctx, &[&FailingPollable])
                .await,
            None
        );
    }
}
