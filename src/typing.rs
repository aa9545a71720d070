use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::config::Config;
use crate::error::AppResult;
use crate::store::ConversationStore;

/// Typing indicator over durable per-(conversation, user) marks.
///
/// The mark has to live in the store, not process memory: the API may be
/// served by several stateless instances and they must agree on who is
/// typing. Reads are pure derivations of the stored timestamp against the
/// clock, so there is nothing to expire; a stale mark simply stops counting.
pub struct TypingTracker {
    store: Arc<dyn ConversationStore>,
    clock: SharedClock,
    window: Duration,
}

impl TypingTracker {
    pub fn new(store: Arc<dyn ConversationStore>, config: &Config, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            window: Duration::seconds(config.typing_window_secs as i64),
        }
    }

    /// Last write wins; pings just keep moving the single mark forward.
    pub async fn set(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        self.store
            .upsert_typing_mark(conversation_id, user_id, self.clock.now())
            .await
    }

    pub async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mark = self.store.typing_mark(conversation_id, user_id).await?;
        Ok(match mark {
            Some(at) => self.clock.now() - at < self.window,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn tracker() -> (TypingTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tracker = TypingTracker::new(store, &Config::default(), clock.clone());
        (tracker, clock)
    }

    #[tokio::test]
    async fn typing_is_true_inside_the_window() {
        let (tracker, clock) = tracker();
        let (conv, user) = (Uuid::new_v4(), Uuid::new_v4());

        tracker.set(conv, user).await.unwrap();
        assert!(tracker.is_typing(conv, user).await.unwrap());

        clock.advance(Duration::seconds(3));
        assert!(tracker.is_typing(conv, user).await.unwrap());
    }

    #[tokio::test]
    async fn typing_expires_after_the_window() {
        let (tracker, clock) = tracker();
        let (conv, user) = (Uuid::new_v4(), Uuid::new_v4());

        tracker.set(conv, user).await.unwrap();
        clock.advance(Duration::seconds(4));
        assert!(!tracker.is_typing(conv, user).await.unwrap());
    }

    #[tokio::test]
    async fn a_fresh_ping_extends_the_window() {
        let (tracker, clock) = tracker();
        let (conv, user) = (Uuid::new_v4(), Uuid::new_v4());

        tracker.set(conv, user).await.unwrap();
        clock.advance(Duration::seconds(3));
        tracker.set(conv, user).await.unwrap();
        clock.advance(Duration::seconds(3));
        assert!(tracker.is_typing(conv, user).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_is_not_typing() {
        let (tracker, _clock) = tracker();
        assert!(!tracker
            .is_typing(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap());
    }
}
