use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CachedMessage, MessageCache};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, NotificationDispatcher};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, Message, MessageKind, NewMessage, NotificationCategory,
    NotificationPreferences, NotificationRecord, PushKeys,
};
use crate::presence::{PresenceStatus, PresenceTracker};
use crate::push::PushTransport;
use crate::receipts::{ReadReceiptTracker, ReceiptBatch};
use crate::store::ConversationStore;
use crate::typing::TypingTracker;

const NOTIFICATION_BODY_PREVIEW: usize = 140;
const PENDING_NOTIFICATION_LIMIT: i64 = 50;

/// Messages returned by a fetch plus the ids whose read flag just flipped
/// (a side channel so the client can update its own view immediately).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub messages: Vec<CachedMessage>,
    pub read_ids: Vec<Uuid>,
}

/// The transport-agnostic API of the messaging core.
///
/// Callers supply authenticated user ids; conversation identity is always
/// derived from the (caller, other) pair, so a caller can only ever reach
/// conversations they participate in. Every mutating path writes the store
/// first and the cache second, so on a store failure the cache is untouched.
/// When the two disagree, the store wins.
pub struct MessagingService {
    store: Arc<dyn ConversationStore>,
    cache: Arc<MessageCache>,
    receipts: Arc<ReadReceiptTracker>,
    typing: TypingTracker,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<NotificationDispatcher>,
    clock: SharedClock,
    config: Config,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn PushTransport>,
        config: Config,
    ) -> Self {
        Self::with_clock(store, transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn PushTransport>,
        config: Config,
        clock: SharedClock,
    ) -> Self {
        let cache = Arc::new(MessageCache::new());
        let receipts = Arc::new(ReadReceiptTracker::new(&config, clock.clone()));
        let typing = TypingTracker::new(store.clone(), &config, clock.clone());
        let presence = Arc::new(PresenceTracker::new(store.clone(), &config, clock.clone()));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            transport,
            clock.clone(),
        ));
        Self {
            store,
            cache,
            receipts,
            typing,
            presence,
            dispatcher,
            clock,
            config,
        }
    }

    pub fn cache(&self) -> Arc<MessageCache> {
        self.cache.clone()
    }

    pub fn presence_tracker(&self) -> Arc<PresenceTracker> {
        self.presence.clone()
    }

    pub fn dispatcher(&self) -> Arc<NotificationDispatcher> {
        self.dispatcher.clone()
    }

    fn pair_id(caller: Uuid, other: Uuid) -> AppResult<Uuid> {
        if caller == other {
            return Err(AppError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }
        Ok(Conversation::id_for(caller, other))
    }

    pub async fn send_message(
        &self,
        sender: Uuid,
        receiver: Uuid,
        content: &str,
        kind: MessageKind,
        reply_to: Option<Uuid>,
    ) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("message content is empty".into()));
        }
        if sender == receiver {
            return Err(AppError::Validation("sender equals receiver".into()));
        }

        let conversation = self.store.get_or_create_conversation(sender, receiver).await?;
        let message = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: sender,
                receiver_id: receiver,
                content: content.to_string(),
                kind,
                reply_to,
            })
            .await?;

        self.cache
            .append(conversation.id, CachedMessage::from(&message))
            .await;

        // Fan out after the durable write committed; a failed or slow push
        // never reaches the sender.
        let dispatcher = self.dispatcher.clone();
        let preview: String = content.chars().take(NOTIFICATION_BODY_PREVIEW).collect();
        let data = serde_json::json!({
            "sender_id": sender,
            "conversation_id": conversation.id,
        });
        tokio::spawn(async move {
            if let Err(e) = dispatcher
                .dispatch(
                    receiver,
                    NotificationCategory::Message,
                    "New message",
                    &preview,
                    data,
                )
                .await
            {
                warn!(%receiver, error = %e, "message push dispatch failed");
            }
        });

        Ok(message)
    }

    pub async fn fetch_messages(
        &self,
        caller: Uuid,
        other: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<FetchResult> {
        let conversation = self.store.get_or_create_conversation(caller, other).await?;
        let key = conversation.id;

        if let Some(mut cached) = self.cache.get(key).await {
            // Scan the whole entry, not just the requested window, so a
            // same-timestamp message still gets its read flag flipped.
            let unread: Vec<Uuid> = cached
                .iter()
                .filter(|m| m.receiver_id == caller && !m.is_read)
                .map(|m| m.id)
                .collect();
            let read_ids = self.mark_read_through(key, &unread).await?;
            for m in cached.iter_mut() {
                if read_ids.contains(&m.id) {
                    m.is_read = true;
                }
            }

            let messages = match since {
                Some(ts) => cached.into_iter().filter(|m| m.created_at > ts).collect(),
                None => {
                    let window = self.config.recent_window as usize;
                    if cached.len() > window {
                        cached.split_off(cached.len() - window)
                    } else {
                        cached
                    }
                }
            };
            return Ok(FetchResult { messages, read_ids });
        }

        // Cache miss: hydrate the recent window from the store.
        let recent = self
            .store
            .fetch_since(key, None, self.config.recent_window)
            .await?;
        let requested = match since {
            Some(_) => {
                self.store
                    .fetch_since(key, since, self.config.recent_window)
                    .await?
            }
            None => recent.clone(),
        };

        let mut unread: Vec<Uuid> = recent
            .iter()
            .chain(requested.iter())
            .filter(|m| m.receiver_id == caller && !m.read)
            .map(|m| m.id)
            .collect();
        unread.sort();
        unread.dedup();
        let read_ids = self.mark_read_through(key, &unread).await?;

        let hydrated: Vec<CachedMessage> = recent
            .iter()
            .map(|m| {
                let mut cached = CachedMessage::from(m);
                if read_ids.contains(&cached.id) {
                    cached.is_read = true;
                }
                cached
            })
            .collect();
        self.cache.replace(key, hydrated).await;

        let messages = requested
            .iter()
            .map(|m| {
                let mut cached = CachedMessage::from(m);
                if read_ids.contains(&cached.id) {
                    cached.is_read = true;
                }
                cached
            })
            .collect();
        Ok(FetchResult { messages, read_ids })
    }

    /// Store first, then cache, then the receipt side channel. Only the ids
    /// that actually transitioned come back.
    async fn mark_read_through(&self, key: Uuid, unread: &[Uuid]) -> AppResult<Vec<Uuid>> {
        if unread.is_empty() {
            return Ok(Vec::new());
        }
        let marked = self.store.mark_read(unread).await?;
        let read_ids: Vec<Uuid> = marked.iter().map(|m| m.message_id).collect();
        if !read_ids.is_empty() {
            self.cache.mark_read(key, &read_ids).await;
            self.receipts.record(key, &read_ids);
        }
        Ok(read_ids)
    }

    /// Idempotent: re-marking already-read messages is a no-op.
    pub async fn mark_read(&self, message_ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let marked = self.store.mark_read(message_ids).await?;
        let mut by_conversation: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for m in &marked {
            by_conversation
                .entry(m.conversation_id)
                .or_default()
                .push(m.message_id);
        }
        for (conversation_id, ids) in &by_conversation {
            self.cache.mark_read(*conversation_id, ids).await;
            self.receipts.record(*conversation_id, ids);
        }
        Ok(marked.iter().map(|m| m.message_id).collect())
    }

    pub async fn set_typing(&self, caller: Uuid, other: Uuid) -> AppResult<()> {
        let key = Self::pair_id(caller, other)?;
        self.typing.set(key, caller).await
    }

    /// Whether the *other* side of the conversation is typing right now.
    pub async fn is_typing(&self, caller: Uuid, other: Uuid) -> AppResult<bool> {
        let key = Self::pair_id(caller, other)?;
        self.typing.is_typing(key, other).await
    }

    pub async fn poll_read_receipts(
        &self,
        caller: Uuid,
        other: Uuid,
        since: DateTime<Utc>,
    ) -> AppResult<ReceiptBatch> {
        let key = Self::pair_id(caller, other)?;
        Ok(self.receipts.poll(key, since))
    }

    /// Implicit activity marking; call on every authenticated request.
    pub async fn touch_presence(&self, user_id: Uuid) {
        self.presence.touch(user_id).await;
    }

    /// Explicit heartbeat; always refreshes the durable last-seen row.
    pub async fn presence_ping(&self, user_id: Uuid) -> AppResult<()> {
        self.presence.heartbeat(user_id).await
    }

    pub async fn presence_get(&self, user_id: Uuid) -> AppResult<PresenceStatus> {
        self.presence.presence(user_id).await
    }

    pub fn presence_bulk(&self, user_ids: &[Uuid]) -> HashMap<Uuid, bool> {
        self.presence.bulk_is_online(user_ids)
    }

    pub async fn register_push_endpoint(
        &self,
        user_id: Uuid,
        endpoint: &str,
        keys: PushKeys,
    ) -> AppResult<()> {
        if endpoint.trim().is_empty() {
            return Err(AppError::Validation("push endpoint is empty".into()));
        }
        self.store.upsert_push_endpoint(user_id, endpoint, &keys).await
    }

    pub async fn unregister_push_endpoint(&self, endpoint: &str) -> AppResult<()> {
        self.store.remove_push_endpoint(endpoint).await
    }

    pub async fn clear_conversation(&self, caller: Uuid, other: Uuid) -> AppResult<()> {
        let key = Self::pair_id(caller, other)?;
        self.store.clear_conversation(key).await?;
        self.cache.invalidate(key);
        self.receipts.invalidate(key);
        Ok(())
    }

    pub async fn edit_message(
        &self,
        caller: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("message content is empty".into()));
        }
        let message = self.store.edit_message(message_id, caller, content).await?;
        // Force a rehydrate instead of patching the entry in place.
        self.cache.invalidate(message.conversation_id);
        Ok(message)
    }

    pub async fn delete_message(&self, caller: Uuid, message_id: Uuid) -> AppResult<()> {
        let conversation_id = self.store.delete_message(message_id, caller).await?;
        self.cache.invalidate(conversation_id);
        Ok(())
    }

    pub async fn unread_count(&self, caller: Uuid, other: Uuid) -> AppResult<i64> {
        let conversation = self.store.get_or_create_conversation(caller, other).await?;
        conversation.unread_for(caller).ok_or(AppError::Forbidden)
    }

    /// Push an arbitrary event through the dispatcher (likes, comments,
    /// friend requests: triggers owned by the surrounding application).
    pub async fn notify(
        &self,
        user_id: Uuid,
        category: NotificationCategory,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> AppResult<DispatchOutcome> {
        self.dispatcher
            .dispatch(user_id, category, title, body, data)
            .await
    }

    pub async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> AppResult<NotificationPreferences> {
        self.store.notification_preferences(user_id).await
    }

    pub async fn set_notification_preferences(
        &self,
        prefs: NotificationPreferences,
    ) -> AppResult<()> {
        self.store.set_notification_preferences(&prefs).await
    }

    /// Unread notification records from the last 24 hours, newest first.
    pub async fn pending_notifications(
        &self,
        user_id: Uuid,
    ) -> AppResult<Vec<NotificationRecord>> {
        let since = self.clock.now() - Duration::hours(24);
        self.store
            .pending_notifications(user_id, since, PENDING_NOTIFICATION_LIMIT)
            .await
    }

    /// Empty `ids` marks everything unread for the user.
    pub async fn mark_notifications_read(&self, user_id: Uuid, ids: &[Uuid]) -> AppResult<()> {
        self.store
            .mark_notifications_read(user_id, ids, self.clock.now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::push::DeliveryError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NullTransport;

    #[async_trait]
    impl PushTransport for NullTransport {
        async fn deliver(
            &self,
            _endpoint: &str,
            _keys: &PushKeys,
            _payload: &serde_json::Value,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn service() -> (MessagingService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let service = MessagingService::with_clock(
            store,
            Arc::new(NullTransport),
            Config::default(),
            clock.clone(),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn empty_content_is_rejected_before_any_state_changes() {
        let (service, _clock) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = service
            .send_message(a, b, "   ", MessageKind::Text, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Nothing was created for the pair.
        assert!(service.cache.get(Conversation::id_for(a, b)).await.is_none());
    }

    #[tokio::test]
    async fn self_send_is_rejected() {
        let (service, _clock) = service();
        let a = Uuid::new_v4();
        let err = service
            .send_message(a, a, "hi", MessageKind::Text, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn send_appends_to_the_cache_tail() {
        let (service, _clock) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let message = service
            .send_message(a, b, "hi", MessageKind::Text, None)
            .await
            .unwrap();

        let cached = service
            .cache
            .get(Conversation::id_for(a, b))
            .await
            .unwrap();
        let tail = cached.last().unwrap();
        assert_eq!(tail.id, message.id);
        assert_eq!(tail.content, "hi");
        assert_eq!(tail.sender_id, a);
        assert!(!tail.is_read);
    }

    #[tokio::test]
    async fn unread_count_follows_sends_and_fetches() {
        let (service, clock) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        service
            .send_message(a, b, "one", MessageKind::Text, None)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        service
            .send_message(a, b, "two", MessageKind::Text, None)
            .await
            .unwrap();

        assert_eq!(service.unread_count(b, a).await.unwrap(), 2);
        assert_eq!(service.unread_count(a, b).await.unwrap(), 0);

        service.fetch_messages(b, a, None).await.unwrap();
        assert_eq!(service.unread_count(b, a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn typing_is_scoped_to_the_conversation_and_the_other_user() {
        let (service, _clock) = service();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        service.set_typing(a, b).await.unwrap();

        // b sees a typing; a does not see themselves; c's pair is untouched.
        assert!(service.is_typing(b, a).await.unwrap());
        assert!(!service.is_typing(a, b).await.unwrap());
        assert!(!service.is_typing(c, a).await.unwrap());
    }
}
