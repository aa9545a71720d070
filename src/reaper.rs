use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::MessageCache;
use crate::config::Config;
use crate::presence::PresenceTracker;

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub trimmed_conversations: usize,
    pub dropped_messages: usize,
    pub evicted_presence: usize,
}

/// One maintenance pass: trim oversized cache entries, evict idle presence.
///
/// Works over a snapshot of keys and takes only each entry's own lock while
/// trimming it, so in-flight sends and fetches on other conversations are
/// never stalled behind the sweep.
pub async fn sweep(cache: &MessageCache, presence: &PresenceTracker, config: &Config) -> SweepStats {
    let mut stats = SweepStats::default();

    for key in cache.keys() {
        let dropped = cache
            .trim(key, config.cache_trim_threshold, config.cache_trim_to)
            .await;
        if dropped > 0 {
            debug!(conversation = %key, dropped, "trimmed cache entry");
            stats.trimmed_conversations += 1;
            stats.dropped_messages += dropped;
        }
    }

    stats.evicted_presence =
        presence.evict_idle(chrono::Duration::seconds(config.presence_evict_secs as i64));

    if stats.trimmed_conversations > 0 || stats.evicted_presence > 0 {
        info!(
            trimmed = stats.trimmed_conversations,
            dropped = stats.dropped_messages,
            evicted = stats.evicted_presence,
            "reaper sweep complete"
        );
    }
    stats
}

/// Periodic background reaper. One independently supervised task; a failing
/// iteration is contained and the loop keeps going.
pub struct Reaper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(cache: Arc<MessageCache>, presence: Arc<PresenceTracker>, config: Config) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = Duration::from_secs(config.reaper_interval_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first sweep
            // happens one full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&cache, &presence, &config).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        Self { shutdown, handle }
    }

    /// Signals the loop and waits for it to finish the iteration in flight.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedMessage;
    use crate::clock::{ManualClock, SystemClock};
    use crate::models::MessageKind;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn cached_message(i: i64) -> CachedMessage {
        CachedMessage {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: format!("m{i}"),
            kind: MessageKind::Text,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sweep_trims_oversized_entries_to_the_configured_tail() {
        let config = Config::default();
        let cache = MessageCache::new();
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let presence = PresenceTracker::new(store, &config, clock);

        let hot = Uuid::new_v4();
        let cold = Uuid::new_v4();
        for i in 0..1200 {
            cache.append(hot, cached_message(i)).await;
        }
        for i in 0..10 {
            cache.append(cold, cached_message(i)).await;
        }

        let stats = sweep(&cache, &presence, &config).await;

        assert_eq!(stats.trimmed_conversations, 1);
        assert_eq!(stats.dropped_messages, 700);
        assert_eq!(cache.get(hot).await.unwrap().len(), 500);
        assert_eq!(cache.get(cold).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn sweep_evicts_long_idle_presence() {
        let config = Config::default();
        let cache = MessageCache::new();
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let presence = PresenceTracker::new(store, &config, clock.clone());

        let idle = Uuid::new_v4();
        let active = Uuid::new_v4();
        presence.touch(idle).await;
        clock.advance(chrono::Duration::hours(2));
        presence.touch(active).await;

        let stats = sweep(&cache, &presence, &config).await;
        assert_eq!(stats.evicted_presence, 1);
        assert!(presence.is_online(active));
    }

    #[tokio::test]
    async fn reaper_shuts_down_cleanly() {
        let config = Config::default();
        let cache = Arc::new(MessageCache::new());
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let presence = Arc::new(PresenceTracker::new(store, &config, clock));

        let reaper = Reaper::spawn(cache, presence, config);
        reaper.shutdown().await;
    }
}
