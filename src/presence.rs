use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::config::Config;
use crate::error::AppResult;
use crate::store::ConversationStore;

#[derive(Debug, Clone, Copy)]
struct PresenceMark {
    last_activity: DateTime<Utc>,
    last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceStatus {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// In-memory last-activity tracking with a derived online flag.
///
/// `touch` runs on every authenticated request, so the durable last-seen row
/// is refreshed at most once per sync interval per user, precision traded
/// for write volume. That coarse row is the only presence signal that
/// survives a restart or is visible from another instance.
pub struct PresenceTracker {
    marks: DashMap<Uuid, PresenceMark>,
    store: Arc<dyn ConversationStore>,
    clock: SharedClock,
    window: Duration,
    sync_interval: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn ConversationStore>, config: &Config, clock: SharedClock) -> Self {
        Self {
            marks: DashMap::new(),
            store,
            clock,
            window: Duration::seconds(config.presence_window_secs as i64),
            sync_interval: Duration::seconds(config.presence_sync_secs as i64),
        }
    }

    /// Records activity. The durable write happens outside the map guard and
    /// its failure only costs the cross-instance fallback, never the request.
    pub async fn touch(&self, user_id: Uuid) {
        let now = self.clock.now();
        let mut sync_due = false;
        {
            let mut mark = self.marks.entry(user_id).or_insert(PresenceMark {
                last_activity: now,
                last_synced: None,
            });
            mark.last_activity = now;
            if mark.last_synced.map_or(true, |t| now - t >= self.sync_interval) {
                mark.last_synced = Some(now);
                sync_due = true;
            }
        }
        if sync_due {
            if let Err(e) = self.store.touch_last_seen(user_id, now).await {
                warn!(%user_id, error = %e, "presence soft-sync failed");
            }
        }
    }

    /// Explicit heartbeat: touches the in-memory mark and always refreshes
    /// the durable row. Concurrent soft-syncs resolve last-writer-wins.
    pub async fn heartbeat(&self, user_id: Uuid) -> AppResult<()> {
        let now = self.clock.now();
        {
            let mut mark = self.marks.entry(user_id).or_insert(PresenceMark {
                last_activity: now,
                last_synced: None,
            });
            mark.last_activity = now;
            mark.last_synced = Some(now);
        }
        self.store.touch_last_seen(user_id, now).await
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        let now = self.clock.now();
        self.marks
            .get(&user_id)
            .map(|m| now - m.last_activity < self.window)
            .unwrap_or(false)
    }

    pub fn bulk_is_online(&self, user_ids: &[Uuid]) -> HashMap<Uuid, bool> {
        let now = self.clock.now();
        user_ids
            .iter()
            .map(|&id| {
                let online = self
                    .marks
                    .get(&id)
                    .map(|m| now - m.last_activity < self.window)
                    .unwrap_or(false);
                (id, online)
            })
            .collect()
    }

    /// Online flag from the in-memory mark, last-seen from the durable row.
    pub async fn presence(&self, user_id: Uuid) -> AppResult<PresenceStatus> {
        let online = self.is_online(user_id);
        let last_seen = self.store.last_seen(user_id).await?;
        Ok(PresenceStatus { online, last_seen })
    }

    /// Drops marks idle beyond `idle_for`. Returns how many were evicted.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = self.clock.now();
        let before = self.marks.len();
        self.marks.retain(|_, m| now - m.last_activity < idle_for);
        before - self.marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{ConversationStore, MemoryStore};
    use chrono::TimeZone;

    fn tracker() -> (PresenceTracker, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tracker = PresenceTracker::new(store.clone(), &Config::default(), clock.clone());
        (tracker, clock, store)
    }

    #[tokio::test]
    async fn online_inside_the_window_only() {
        let (tracker, clock, _store) = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user).await;
        assert!(tracker.is_online(user));

        clock.advance(Duration::seconds(29));
        assert!(tracker.is_online(user));

        clock.advance(Duration::seconds(1));
        assert!(!tracker.is_online(user));
    }

    #[tokio::test]
    async fn unknown_user_is_offline() {
        let (tracker, _clock, _store) = tracker();
        assert!(!tracker.is_online(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn bulk_reports_each_user_independently() {
        let (tracker, clock, _store) = tracker();
        let (x, y, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        tracker.touch(y).await;
        clock.advance(Duration::seconds(40));
        tracker.touch(x).await;

        let online = tracker.bulk_is_online(&[x, y, z]);
        assert!(online[&x]);
        assert!(!online[&y]);
        assert!(!online[&z]);
    }

    #[tokio::test]
    async fn soft_sync_is_rate_limited() {
        let (tracker, clock, store) = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user).await;
        let first_sync = store.last_seen(user).await.unwrap().unwrap();

        // Frequent touches inside the interval do not move the durable row.
        clock.advance(Duration::seconds(30));
        tracker.touch(user).await;
        assert_eq!(store.last_seen(user).await.unwrap(), Some(first_sync));

        // Past the interval the next touch flows through.
        clock.advance(Duration::seconds(30));
        tracker.touch(user).await;
        assert_eq!(store.last_seen(user).await.unwrap(), Some(clock.now()));
    }

    #[tokio::test]
    async fn heartbeat_always_refreshes_the_durable_row() {
        let (tracker, clock, store) = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user).await;
        clock.advance(Duration::seconds(5));
        tracker.heartbeat(user).await.unwrap();
        assert_eq!(store.last_seen(user).await.unwrap(), Some(clock.now()));
    }

    #[tokio::test]
    async fn idle_marks_are_evicted_but_durable_last_seen_survives() {
        let (tracker, clock, store) = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user).await;
        let synced = store.last_seen(user).await.unwrap();
        clock.advance(Duration::hours(2));

        let evicted = tracker.evict_idle(Duration::hours(1));
        assert_eq!(evicted, 1);
        assert!(!tracker.is_online(user));

        let status = tracker.presence(user).await.unwrap();
        assert!(!status.online);
        assert_eq!(status.last_seen, synced);
    }
}
