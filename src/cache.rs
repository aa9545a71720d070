use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Message, MessageKind};

/// The cached projection of a message: exactly what a fetch returns, whether
/// it was served from here or hydrated from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for CachedMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            content: m.content.clone(),
            kind: m.kind,
            is_read: m.read,
            created_at: m.created_at,
        }
    }
}

type Entry = Arc<Mutex<Vec<CachedMessage>>>;

/// Per-conversation in-memory mirror of recent messages.
///
/// Entries are sharded by conversation key (the dashmap) and each entry list
/// has its own mutex, so operations on the same conversation are
/// linearizable while different conversations never contend. Appends never
/// trim inline; the reaper owns trimming so a hot conversation never pays an
/// O(n) cost inside a send.
///
/// Callers must complete the corresponding store write before mutating the
/// cache; when the two disagree, the store wins and the entry is rebuilt
/// from it.
#[derive(Default)]
pub struct MessageCache {
    entries: DashMap<Uuid, Entry>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: Uuid) -> Entry {
        self.entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .value()
            .clone()
    }

    /// Snapshot of the entry list. `None` means "must hydrate from store";
    /// the caller should then [`replace`](Self::replace) with store truth.
    pub async fn get(&self, key: Uuid) -> Option<Vec<CachedMessage>> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let entry = self.entries.get(&key).map(|e| e.value().clone())?;
        let guard = entry.lock().await;
        Some(guard.clone())
    }

    pub async fn append(&self, key: Uuid, message: CachedMessage) {
        let entry = self.entry(key);
        let mut guard = entry.lock().await;
        guard.push(message);
    }

    /// Installs the hydrated list for a conversation, replacing whatever was
    /// cached before.
    pub async fn replace(&self, key: Uuid, messages: Vec<CachedMessage>) {
        let entry = self.entry(key);
        let mut guard = entry.lock().await;
        *guard = messages;
    }

    pub async fn mark_read(&self, key: Uuid, message_ids: &[Uuid]) {
        let entry = match self.entries.get(&key) {
            Some(e) => e.value().clone(),
            None => return,
        };
        let mut guard = entry.lock().await;
        for m in guard.iter_mut() {
            if message_ids.contains(&m.id) {
                m.is_read = true;
            }
        }
    }

    pub fn invalidate(&self, key: Uuid) {
        self.entries.remove(&key);
    }

    /// Snapshot of the current keys (for the reaper; it then takes each
    /// entry's own lock, never a cache-wide one).
    pub fn keys(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Trims one entry down to its `keep` newest messages if it has grown
    /// past `threshold`. Returns how many messages were dropped.
    pub async fn trim(&self, key: Uuid, threshold: usize, keep: usize) -> usize {
        let entry = match self.entries.get(&key) {
            Some(e) => e.value().clone(),
            None => return 0,
        };
        let mut guard = entry.lock().await;
        if guard.len() <= threshold {
            return 0;
        }
        let dropped = guard.len() - keep;
        let tail = guard.split_off(dropped);
        *guard = tail;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(i: i64, read: bool) -> CachedMessage {
        CachedMessage {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: format!("m{i}"),
            kind: MessageKind::Text,
            is_read: read,
            created_at: Utc::now() + chrono::Duration::milliseconds(i),
        }
    }

    #[tokio::test]
    async fn absent_key_signals_hydration() {
        let cache = MessageCache::new();
        assert!(cache.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let cache = MessageCache::new();
        let key = Uuid::new_v4();
        for i in 0..5 {
            cache.append(key, message(i, false)).await;
        }
        let cached = cache.get(key).await.unwrap();
        let contents: Vec<&str> = cached.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn mark_read_updates_in_place() {
        let cache = MessageCache::new();
        let key = Uuid::new_v4();
        let first = message(0, false);
        let second = message(1, false);
        let first_id = first.id;
        cache.append(key, first).await;
        cache.append(key, second).await;

        cache.mark_read(key, &[first_id]).await;

        let cached = cache.get(key).await.unwrap();
        assert!(cached[0].is_read);
        assert!(!cached[1].is_read);
    }

    #[tokio::test]
    async fn trim_keeps_the_newest_tail() {
        let cache = MessageCache::new();
        let key = Uuid::new_v4();
        for i in 0..1200 {
            cache.append(key, message(i, false)).await;
        }

        let dropped = cache.trim(key, 1000, 500).await;
        assert_eq!(dropped, 700);

        let cached = cache.get(key).await.unwrap();
        assert_eq!(cached.len(), 500);
        assert_eq!(cached[0].content, "m700");
        assert_eq!(cached[499].content, "m1199");
    }

    #[tokio::test]
    async fn trim_below_threshold_is_a_noop() {
        let cache = MessageCache::new();
        let key = Uuid::new_v4();
        for i in 0..10 {
            cache.append(key, message(i, false)).await;
        }
        assert_eq!(cache.trim(key, 1000, 500).await, 0);
        assert_eq!(cache.get(key).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn invalidate_removes_the_entry() {
        let cache = MessageCache::new();
        let key = Uuid::new_v4();
        cache.append(key, message(0, false)).await;
        cache.invalidate(key);
        assert!(cache.get(key).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_on_one_key_all_land() {
        let cache = Arc::new(MessageCache::new());
        let key = Uuid::new_v4();
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.append(key, message(i, false)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.get(key).await.unwrap().len(), 32);
    }
}
