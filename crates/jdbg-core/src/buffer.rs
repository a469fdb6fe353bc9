use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::events::{DebugEvent, EventKind};

pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 1000;

/// Diagnostics for a session's event buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventBufferInfo {
    pub buffered_count: usize,
    pub capacity: usize,
    /// Sticky until [`EventBuffer::clear`]: set once an event was evicted.
    pub dropped: bool,
    pub oldest_timestamp_ms: Option<u64>,
    pub newest_timestamp_ms: Option<u64>,
}

struct Inner {
    events: VecDeque<DebugEvent>,
    dropped: bool,
}

/// Bounded FIFO of [`DebugEvent`]s.
///
/// The producer pushes at the back, evicting the oldest event when full;
/// consumers pop from the front. Both `poll` and `wait` discard popped
/// events that fail the filter, so a narrow filter drains non-matching
/// events for every other consumer as well.
pub struct EventBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_BUFFER_CAPACITY)),
                dropped: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: DebugEvent) {
        {
            let mut inner = self.inner.lock();
            while inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.dropped = true;
            }
            inner.events.push_back(event);
        }
        self.notify.notify_waiters();
    }

    /// Pop events until `limit` matches were collected or the buffer is
    /// empty. A `limit` of 0 means no limit.
    pub fn poll(&self, limit: usize, filter: &[EventKind]) -> Vec<DebugEvent> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while limit == 0 || out.len() < limit {
            let Some(event) = inner.events.pop_front() else {
                break;
            };
            if event.matches(filter) {
                out.push(event);
            }
        }
        out
    }

    /// Wait up to `timeout` for the first event matching `filter`.
    pub async fn wait(&self, timeout: Duration, filter: &[EventKind]) -> Option<DebugEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking at the queue so a push between the
            // check and the await still wakes us.
            notified.as_mut().enable();

            if let Some(event) = self.pop_matching(filter) {
                return Some(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop_matching(filter);
            }
        }
    }

    fn pop_matching(&self, filter: &[EventKind]) -> Option<DebugEvent> {
        let mut inner = self.inner.lock();
        while let Some(event) = inner.events.pop_front() {
            if event.matches(filter) {
                return Some(event);
            }
        }
        None
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.events.clear();
        inner.dropped = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> EventBufferInfo {
        let inner = self.inner.lock();
        EventBufferInfo {
            buffered_count: inner.events.len(),
            capacity: self.capacity,
            dropped: inner.dropped,
            oldest_timestamp_ms: inner.events.front().map(|e| e.timestamp_ms),
            newest_timestamp_ms: inner.events.back().map(|e| e.timestamp_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::EventPayload;

    fn event(sequence: u64, payload: EventPayload) -> DebugEvent {
        DebugEvent {
            sequence,
            timestamp_ms: 1000 + sequence,
            session_id: "s".to_string(),
            payload,
        }
    }

    fn thread_start(sequence: u64) -> DebugEvent {
        event(
            sequence,
            EventPayload::ThreadStart {
                thread_id: sequence,
                name: format!("t{sequence}"),
            },
        )
    }

    #[test]
    fn overflow_drops_oldest_and_sets_sticky_flag() {
        let buffer = EventBuffer::new(2);
        for seq in 1..=3 {
            buffer.push(thread_start(seq));
        }
        let info = buffer.info();
        assert_eq!(info.buffered_count, 2);
        assert!(info.dropped);
        assert_eq!(info.oldest_timestamp_ms, Some(1002));
        assert_eq!(info.newest_timestamp_ms, Some(1003));

        let seqs: Vec<u64> = buffer.poll(0, &[]).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(buffer.info().dropped, "dropped flag survives draining");

        buffer.clear();
        assert!(!buffer.info().dropped);
    }

    #[test]
    fn poll_stops_at_limit_and_discards_mismatches() {
        let buffer = EventBuffer::new(10);
        buffer.push(thread_start(1));
        buffer.push(event(2, EventPayload::VmDeath { exit_code: 0 }));
        buffer.push(thread_start(3));
        buffer.push(thread_start(4));

        let got = buffer.poll(1, &[EventKind::VmDeath]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sequence, 2);
        // The thread start before the match was consumed too.
        assert_eq!(buffer.len(), 2);

        let rest = buffer.poll(1, &[]);
        assert_eq!(rest[0].sequence, 3);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_and_empties_buffer_of_mismatches() {
        let buffer = EventBuffer::new(10);
        buffer.push(thread_start(1));
        buffer.push(thread_start(2));

        let started = std::time::Instant::now();
        let got = buffer
            .wait(Duration::from_millis(50), &[EventKind::ExceptionThrown])
            .await;
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let buffer = Arc::new(EventBuffer::new(10));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait(Duration::from_secs(5), &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(thread_start(9));
        let got = waiter.await.unwrap();
        assert_eq!(got.map(|e| e.sequence), Some(9));
    }
}
