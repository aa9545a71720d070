pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Conversation, Message, NewMessage, NotificationPreferences, NotificationRecord, PushEndpoint,
    PushKeys,
};

/// A message whose read flag just transitioned false -> true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedRead {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
}

/// Durable persistence for the messaging core.
///
/// The store is the single source of truth: every mutating operation must
/// complete here before the corresponding in-memory cache write is
/// attempted. Implementations provide their own transaction isolation;
/// unread-counter updates in particular must be atomic at the row level so
/// concurrent sends never lose an increment.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Idempotent by deterministic id; racing creators converge on one row.
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation>;

    async fn conversation(&self, id: Uuid) -> AppResult<Conversation>;

    /// Validates the sender/receiver pair against the conversation, hashes
    /// the content, and persists the message together with the receiver's
    /// unread-counter increment and the last-message pointer update.
    async fn append_message(&self, new: NewMessage) -> AppResult<Message>;

    /// Sets read flags. Idempotent: only messages actually transitioning are
    /// returned, and re-marking is a no-op. Affected conversations' unread
    /// counters are re-derived in the same transaction.
    async fn mark_read(&self, message_ids: &[Uuid]) -> AppResult<Vec<MarkedRead>>;

    /// `Some(ts)`: messages strictly after `ts`, ascending. `None`: the most
    /// recent `limit` messages, ascending. Soft-deleted messages excluded.
    async fn fetch_since(
        &self,
        conversation_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Deletes all messages, resets counters and the last-message pointer.
    async fn clear_conversation(&self, conversation_id: Uuid) -> AppResult<()>;

    /// Sender-only content rewrite; restamps the hash and `edited_at`.
    async fn edit_message(&self, message_id: Uuid, editor: Uuid, content: &str)
        -> AppResult<Message>;

    /// Sender-only soft delete; re-derives the receiver's unread counter.
    /// Returns the owning conversation id.
    async fn delete_message(&self, message_id: Uuid, caller: Uuid) -> AppResult<Uuid>;

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64>;

    /// Last-write-wins single row per (conversation, user).
    async fn upsert_typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>>;

    /// Coarse durable presence; never moves the value backwards.
    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn last_seen(&self, user_id: Uuid) -> AppResult<Option<DateTime<Utc>>>;

    /// Atomic upsert keyed by endpoint identity.
    async fn upsert_push_endpoint(
        &self,
        user_id: Uuid,
        endpoint: &str,
        keys: &PushKeys,
    ) -> AppResult<()>;

    async fn remove_push_endpoint(&self, endpoint: &str) -> AppResult<()>;

    async fn push_endpoints(&self, user_id: Uuid) -> AppResult<Vec<PushEndpoint>>;

    /// Defaults (everything enabled) when the user has no stored row.
    async fn notification_preferences(&self, user_id: Uuid)
        -> AppResult<NotificationPreferences>;

    async fn set_notification_preferences(
        &self,
        prefs: &NotificationPreferences,
    ) -> AppResult<()>;

    async fn record_notification(&self, record: &NotificationRecord) -> AppResult<()>;

    /// Unread notification records for a user, newest first.
    async fn pending_notifications(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>>;

    /// Empty `ids` marks everything unread for the user.
    async fn mark_notifications_read(
        &self,
        user_id: Uuid,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> AppResult<()>;
}
