//! Single-slot latest-wins hand-off between the capture thread and the
//! network task

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Counters since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub published: u64,
    pub consumed: u64,
    /// Published but overwritten or cleared before being consumed
    pub dropped: u64,
}

/// Holds at most one pending value; a publish replaces an unconsumed one
///
/// `publish` never blocks beyond the slot lock, so a stalled consumer
/// cannot slow the producer down.
pub struct FrameMailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    closed: AtomicBool,
    published: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> Default for FrameMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameMailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Store `value`, replacing any pending one. Returns `true` if a
    /// pending value was overwritten.
    pub fn publish(&self, value: T) -> bool {
        let replaced = self.slot.lock().replace(value).is_some();
        self.published.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        replaced
    }

    /// Take the pending value without waiting
    pub fn try_take(&self) -> Option<T> {
        let value = self.slot.lock().take();
        if value.is_some() {
            self.consumed.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Wait for a value; `None` once the mailbox is closed
    pub async fn consume(&self) -> Option<T> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            // notify_one stores a permit, so a publish between the check
            // above and this await is not lost
            self.notify.notified().await;
        }
    }

    /// Discard a pending value; returns whether there was one
    pub fn clear(&self) -> bool {
        let cleared = self.slot.lock().take().is_some();
        if cleared {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        cleared
    }

    /// Wake the consumer and make every later `consume` return `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn test_latest_wins() {
        let mailbox = FrameMailbox::new();
        assert!(!mailbox.publish("A"));
        assert!(mailbox.publish("B"));

        assert_eq!(mailbox.consume().await, Some("B"));
        assert_eq!(mailbox.try_take(), None);
        assert_eq!(
            mailbox.stats(),
            MailboxStats {
                published: 2,
                consumed: 1,
                dropped: 1,
            }
        );
    }

    #[test]
    fn test_consume_waits_for_publish() {
        let mailbox = FrameMailbox::new();
        let mut consume = task::spawn(mailbox.consume());
        assert_pending!(consume.poll());

        mailbox.publish(5u32);
        assert!(consume.is_woken());
        assert_ready_eq!(consume.poll(), Some(5));
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let mailbox = Arc::new(FrameMailbox::<u32>::new());
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.consume().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close();
        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_clear_counts_as_drop() {
        let mailbox = FrameMailbox::new();
        assert!(!mailbox.clear());
        mailbox.publish(1u8);
        assert!(mailbox.clear());
        assert_eq!(mailbox.try_take(), None);
        assert_eq!(mailbox.stats().dropped, 1);
    }

    #[test]
    fn test_publish_from_blocking_thread() {
        let mailbox = Arc::new(FrameMailbox::new());
        let producer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    mailbox.publish(i);
                }
            })
        };
        producer.join().unwrap();
        assert_eq!(mailbox.try_take(), Some(99));
        let stats = mailbox.stats();
        assert_eq!(stats.published, 100);
        assert_eq!(stats.dropped + stats.consumed, 100);
    }
}
