use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    content_hash, Conversation, Message, MessageKind, NewMessage, NotificationCategory,
    NotificationPreferences, NotificationRecord, PushEndpoint, PushKeys,
};
use crate::store::{ConversationStore, MarkedRead};

/// Postgres-backed `ConversationStore`.
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn conversation_from_row(row: &PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        user_a: row.get("user_a"),
        user_b: row.get("user_b"),
        unread_a: row.get("unread_a"),
        unread_b: row.get("unread_b"),
        last_message_id: row.get("last_message_id"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    let kind: String = row.get("kind");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        kind: MessageKind::from_str(&kind),
        read: row.get("is_read"),
        created_at: row.get("created_at"),
        reply_to: row.get("reply_to"),
        edited_at: row.get("edited_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn record_from_row(row: &PgRow) -> NotificationRecord {
    let category: String = row.get("category");
    NotificationRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        category: NotificationCategory::from_str(&category),
        title: row.get("title"),
        body: row.get("body"),
        payload: row.get("payload"),
        delivered: row.get("delivered"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, content, \
     content_hash, kind, is_read, created_at, reply_to, edited_at, deleted_at";

/// Re-derives both unread counters for a set of conversations. Runs inside
/// the caller's transaction so the counters and the read flags move together.
async fn rederive_unread(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    conversation_ids: &[Uuid],
) -> AppResult<()> {
    if conversation_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE conversations c SET \
             unread_a = (SELECT COUNT(*) FROM messages m \
                 WHERE m.conversation_id = c.id AND m.receiver_id = c.user_a \
                   AND m.is_read = FALSE AND m.deleted_at IS NULL), \
             unread_b = (SELECT COUNT(*) FROM messages m \
                 WHERE m.conversation_id = c.id AND m.receiver_id = c.user_b \
                   AND m.is_read = FALSE AND m.deleted_at IS NULL) \
         WHERE c.id = ANY($1)",
    )
    .bind(conversation_ids.to_vec())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }
        let id = Conversation::id_for(a, b);
        let (user_a, user_b) = Conversation::sorted_pair(a, b);

        // Racing creators both hit DO NOTHING and converge on the same row.
        sqlx::query(
            "INSERT INTO conversations (id, user_a, user_b, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(user_a)
        .bind(user_b)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.conversation(id).await
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query(
            "SELECT id, user_a, user_b, unread_a, unread_b, last_message_id, \
                    last_message_at, created_at \
             FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
        Ok(conversation_from_row(&row))
    }

    async fn append_message(&self, new: NewMessage) -> AppResult<Message> {
        let conversation = self.conversation(new.conversation_id).await?;
        if new.sender_id == new.receiver_id {
            return Err(AppError::Validation("sender equals receiver".into()));
        }
        if !conversation.is_participant(new.sender_id)
            || !conversation.is_participant(new.receiver_id)
        {
            return Err(AppError::Validation(
                "sender/receiver are not this conversation's participants".into(),
            ));
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content_hash: content_hash(&new.content),
            content: new.content,
            kind: new.kind,
            read: false,
            created_at: Utc::now(),
            reply_to: new.reply_to,
            edited_at: None,
            deleted_at: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages \
                 (id, conversation_id, sender_id, receiver_id, content, content_hash, \
                  kind, is_read, created_at, reply_to) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $9)",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(&message.content)
        .bind(&message.content_hash)
        .bind(message.kind.as_str())
        .bind(message.created_at)
        .bind(message.reply_to)
        .execute(&mut *tx)
        .await?;

        // Row-level atomic increment; concurrent sends never lose an update.
        let counter = if conversation.user_a == new.receiver_id {
            "unread_a = unread_a + 1"
        } else {
            "unread_b = unread_b + 1"
        };
        let sql = format!(
            "UPDATE conversations SET {counter}, last_message_id = $2, last_message_at = $3 \
             WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(message.conversation_id)
            .bind(message.id)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    async fn mark_read(&self, message_ids: &[Uuid]) -> AppResult<Vec<MarkedRead>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE messages SET is_read = TRUE \
             WHERE id = ANY($1) AND is_read = FALSE AND deleted_at IS NULL \
             RETURNING id, conversation_id",
        )
        .bind(message_ids.to_vec())
        .fetch_all(&mut *tx)
        .await?;

        let marked: Vec<MarkedRead> = rows
            .iter()
            .map(|r| MarkedRead {
                message_id: r.get("id"),
                conversation_id: r.get("conversation_id"),
            })
            .collect();

        let mut affected: Vec<Uuid> = marked.iter().map(|m| m.conversation_id).collect();
        affected.sort();
        affected.dedup();
        rederive_unread(&mut tx, &affected).await?;
        tx.commit().await?;
        Ok(marked)
    }

    async fn fetch_since(
        &self,
        conversation_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        // Existence first so an unknown conversation is an error, not an
        // empty history.
        self.conversation(conversation_id).await?;

        let rows = match since {
            Some(ts) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND deleted_at IS NULL AND created_at > $2 \
                     ORDER BY created_at ASC"
                ))
                .bind(conversation_id)
                .bind(ts)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                let mut rows = sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
        };
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn clear_conversation(&self, conversation_id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE conversations \
             SET unread_a = 0, unread_b = 0, last_message_id = NULL, last_message_at = NULL \
             WHERE id = $1",
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound("conversation"));
        }
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        message_id: Uuid,
        editor: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("message"))?;
        let mut message = message_from_row(&row);
        if message.sender_id != editor {
            return Err(AppError::Forbidden);
        }

        let edited_at = Utc::now();
        let hash = content_hash(content);
        sqlx::query(
            "UPDATE messages SET content = $2, content_hash = $3, edited_at = $4 WHERE id = $1",
        )
        .bind(message_id)
        .bind(content)
        .bind(&hash)
        .bind(edited_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        message.content = content.to_string();
        message.content_hash = hash;
        message.edited_at = Some(edited_at);
        Ok(message)
    }

    async fn delete_message(&self, message_id: Uuid, caller: Uuid) -> AppResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT sender_id, conversation_id FROM messages \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("message"))?;
        let sender_id: Uuid = row.get("sender_id");
        let conversation_id: Uuid = row.get("conversation_id");
        if sender_id != caller {
            return Err(AppError::Forbidden);
        }

        sqlx::query("UPDATE messages SET deleted_at = $2 WHERE id = $1")
            .bind(message_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        rederive_unread(&mut tx, &[conversation_id]).await?;
        tx.commit().await?;
        Ok(conversation_id)
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let conversation = self.conversation(conversation_id).await?;
        conversation.unread_for(user_id).ok_or(AppError::Forbidden)
    }

    async fn upsert_typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO typing_marks (conversation_id, user_id, typing_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (conversation_id, user_id) DO UPDATE SET typing_at = EXCLUDED.typing_at",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT typing_at FROM typing_marks WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("typing_at")))
    }

    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO user_presence (user_id, last_seen_at) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE \
             SET last_seen_at = GREATEST(user_presence.last_seen_at, EXCLUDED.last_seen_at)",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_seen(&self, user_id: Uuid) -> AppResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen_at FROM user_presence WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("last_seen_at")))
    }

    async fn upsert_push_endpoint(
        &self,
        user_id: Uuid,
        endpoint: &str,
        keys: &PushKeys,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO push_endpoints (id, user_id, endpoint, p256dh, auth, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (endpoint) DO UPDATE \
             SET user_id = EXCLUDED.user_id, p256dh = EXCLUDED.p256dh, auth = EXCLUDED.auth",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(endpoint)
        .bind(&keys.p256dh)
        .bind(&keys.auth)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_push_endpoint(&self, endpoint: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM push_endpoints WHERE endpoint = $1")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn push_endpoints(&self, user_id: Uuid) -> AppResult<Vec<PushEndpoint>> {
        let rows = sqlx::query(
            "SELECT id, user_id, endpoint, p256dh, auth, created_at \
             FROM push_endpoints WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PushEndpoint {
                id: r.get("id"),
                user_id: r.get("user_id"),
                endpoint: r.get("endpoint"),
                keys: PushKeys {
                    p256dh: r.get("p256dh"),
                    auth: r.get("auth"),
                },
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> AppResult<NotificationPreferences> {
        let row = sqlx::query(
            "SELECT user_id, messages, likes, comments, friend_requests, general \
             FROM notification_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(r) => NotificationPreferences {
                user_id: r.get("user_id"),
                messages: r.get("messages"),
                likes: r.get("likes"),
                comments: r.get("comments"),
                friend_requests: r.get("friend_requests"),
                general: r.get("general"),
            },
            None => NotificationPreferences::default_for(user_id),
        })
    }

    async fn set_notification_preferences(
        &self,
        prefs: &NotificationPreferences,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO notification_preferences \
                 (user_id, messages, likes, comments, friend_requests, general) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 messages = EXCLUDED.messages, likes = EXCLUDED.likes, \
                 comments = EXCLUDED.comments, friend_requests = EXCLUDED.friend_requests, \
                 general = EXCLUDED.general",
        )
        .bind(prefs.user_id)
        .bind(prefs.messages)
        .bind(prefs.likes)
        .bind(prefs.comments)
        .bind(prefs.friend_requests)
        .bind(prefs.general)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_notification(&self, record: &NotificationRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO notification_log \
                 (id, user_id, category, title, body, payload, delivered, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.category.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.payload)
        .bind(record.delivered)
        .bind(&record.error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_notifications(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, category, title, body, payload, delivered, error, \
                    created_at, read_at \
             FROM notification_log \
             WHERE user_id = $1 AND created_at >= $2 AND read_at IS NULL \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(user_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn mark_notifications_read(
        &self,
        user_id: Uuid,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        if ids.is_empty() {
            sqlx::query(
                "UPDATE notification_log SET read_at = $2 \
                 WHERE user_id = $1 AND read_at IS NULL",
            )
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE notification_log SET read_at = $3 \
                 WHERE user_id = $1 AND id = ANY($2) AND read_at IS NULL",
            )
            .bind(user_id)
            .bind(ids.to_vec())
            .bind(at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
