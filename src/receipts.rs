use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::config::Config;

#[derive(Debug, Clone, Copy)]
struct ReceiptEvent {
    message_id: Uuid,
    at: DateTime<Utc>,
}

/// One poll's worth of read-receipt events.
///
/// `latest` is the caller's next cursor (their `since` when nothing was
/// ready); `now` is the server clock so clients can reconcile skew.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptBatch {
    pub ids: Vec<Uuid>,
    pub latest: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Short-lived buffer of "message just became read" events.
///
/// This is a notification side channel for senders polling without an open
/// connection; the message's read flag stays authoritative. Events expire
/// after the retention window; pruning happens lazily on each access, so a
/// conversation nobody polls costs nothing beyond its capped buffer.
pub struct ReadReceiptTracker {
    events: Mutex<HashMap<Uuid, Vec<ReceiptEvent>>>,
    retention: Duration,
    buffer_cap: usize,
    clock: SharedClock,
}

impl ReadReceiptTracker {
    pub fn new(config: &Config, clock: SharedClock) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            retention: Duration::seconds(config.receipt_retention_secs as i64),
            buffer_cap: config.receipt_buffer_cap,
            clock,
        }
    }

    pub fn record(&self, conversation_id: Uuid, message_ids: &[Uuid]) {
        if message_ids.is_empty() {
            return;
        }
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let mut events = self.events.lock().expect("receipt buffer lock poisoned");
        let buffer = events.entry(conversation_id).or_default();
        buffer.retain(|e| e.at >= cutoff);
        for &message_id in message_ids {
            buffer.push(ReceiptEvent {
                message_id,
                at: now,
            });
        }
        if buffer.len() > self.buffer_cap {
            let excess = buffer.len() - self.buffer_cap;
            buffer.drain(..excess);
        }
    }

    /// Events strictly newer than `since`. Expired events are dropped before
    /// the read, so polling from zero never replays more than the retention
    /// window's worth of history.
    pub fn poll(&self, conversation_id: Uuid, since: DateTime<Utc>) -> ReceiptBatch {
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let mut events = self.events.lock().expect("receipt buffer lock poisoned");

        let mut ids = Vec::new();
        let mut latest = since;
        let mut drained = false;
        if let Some(buffer) = events.get_mut(&conversation_id) {
            buffer.retain(|e| e.at >= cutoff);
            for e in buffer.iter() {
                if e.at > since {
                    ids.push(e.message_id);
                    if e.at > latest {
                        latest = e.at;
                    }
                }
            }
            drained = buffer.is_empty();
        }
        if drained {
            events.remove(&conversation_id);
        }

        ReceiptBatch { ids, latest, now }
    }

    pub fn invalidate(&self, conversation_id: Uuid) {
        let mut events = self.events.lock().expect("receipt buffer lock poisoned");
        events.remove(&conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn tracker() -> (ReadReceiptTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let tracker = ReadReceiptTracker::new(&Config::default(), clock.clone());
        (tracker, clock)
    }

    #[tokio::test]
    async fn poll_returns_events_after_the_cursor() {
        let (tracker, clock) = tracker();
        let conv = Uuid::new_v4();
        let msg = Uuid::new_v4();

        let before = clock.now();
        clock.advance(Duration::seconds(10));
        tracker.record(conv, &[msg]);

        let batch = tracker.poll(conv, before);
        assert_eq!(batch.ids, vec![msg]);
        assert_eq!(batch.latest, clock.now());
        assert_eq!(batch.now, clock.now());

        // Polling from the returned cursor yields nothing new and keeps the
        // cursor where it was.
        let empty = tracker.poll(conv, batch.latest);
        assert!(empty.ids.is_empty());
        assert_eq!(empty.latest, batch.latest);
    }

    #[tokio::test]
    async fn events_expire_after_the_retention_window() {
        let (tracker, clock) = tracker();
        let conv = Uuid::new_v4();
        let epoch = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        tracker.record(conv, &[Uuid::new_v4()]);
        clock.advance(Duration::seconds(61));

        let batch = tracker.poll(conv, epoch);
        assert!(batch.ids.is_empty());
        assert_eq!(batch.latest, epoch);
    }

    #[tokio::test]
    async fn buffer_is_capped_to_the_newest_events() {
        let (tracker, _clock) = tracker();
        let conv = Uuid::new_v4();
        let epoch = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let ids: Vec<Uuid> = (0..600).map(|_| Uuid::new_v4()).collect();
        tracker.record(conv, &ids);

        let batch = tracker.poll(conv, epoch);
        assert_eq!(batch.ids.len(), 500);
        assert_eq!(batch.ids, ids[100..].to_vec());
    }

    #[tokio::test]
    async fn invalidate_drops_the_conversation_buffer() {
        let (tracker, _clock) = tracker();
        let conv = Uuid::new_v4();
        let epoch = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        tracker.record(conv, &[Uuid::new_v4()]);
        tracker.invalidate(conv);
        assert!(tracker.poll(conv, epoch).ids.is_empty());
    }
}
