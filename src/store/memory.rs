use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::error::{AppError, AppResult};
use crate::models::{
    content_hash, Conversation, Message, NewMessage, NotificationPreferences, NotificationRecord,
    PushEndpoint, PushKeys,
};
use crate::store::{ConversationStore, MarkedRead};

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<Message>,
    typing: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    last_seen: HashMap<Uuid, DateTime<Utc>>,
    endpoints: HashMap<String, PushEndpoint>,
    preferences: HashMap<Uuid, NotificationPreferences>,
    notifications: Vec<NotificationRecord>,
}

/// In-memory `ConversationStore`.
///
/// A single mutex over plain maps: transaction isolation for free, contents
/// inspectable, time injectable. This is the deterministic double the tests
/// run against; the production implementation is [`super::PgStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }
}

fn recompute_unread(inner: &mut Inner, conversation_id: Uuid) {
    let (user_a, user_b) = match inner.conversations.get(&conversation_id) {
        Some(c) => (c.user_a, c.user_b),
        None => return,
    };
    let mut unread_a = 0;
    let mut unread_b = 0;
    for m in &inner.messages {
        if m.conversation_id != conversation_id || m.read || m.deleted_at.is_some() {
            continue;
        }
        if m.receiver_id == user_a {
            unread_a += 1;
        } else if m.receiver_id == user_b {
            unread_b += 1;
        }
    }
    if let Some(c) = inner.conversations.get_mut(&conversation_id) {
        c.unread_a = unread_a;
        c.unread_b = unread_b;
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::Validation(
                "a conversation needs two distinct participants".into(),
            ));
        }
        let id = Conversation::id_for(a, b);
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.conversations.get(&id) {
            return Ok(existing.clone());
        }
        let (user_a, user_b) = Conversation::sorted_pair(a, b);
        let conversation = Conversation {
            id,
            user_a,
            user_b,
            unread_a: 0,
            unread_b: 0,
            last_message_id: None,
            last_message_at: None,
            created_at: self.clock.now(),
        };
        inner.conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Conversation> {
        let inner = self.inner.lock().await;
        inner
            .conversations
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound("conversation"))
    }

    async fn append_message(&self, new: NewMessage) -> AppResult<Message> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get(&new.conversation_id)
            .ok_or(AppError::NotFound("conversation"))?;
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
            created_at: self.clock.now(),
            reply_to: new.reply_to,
            edited_at: None,
            deleted_at: None,
        };

        let receiver_is_a = conversation.user_a == new.receiver_id;
        if let Some(c) = inner.conversations.get_mut(&new.conversation_id) {
            if receiver_is_a {
                c.unread_a += 1;
            } else {
                c.unread_b += 1;
            }
            c.last_message_id = Some(message.id);
            c.last_message_at = Some(message.created_at);
        }
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, message_ids: &[Uuid]) -> AppResult<Vec<MarkedRead>> {
        let wanted: HashSet<Uuid> = message_ids.iter().copied().collect();
        let mut inner = self.inner.lock().await;
        let mut marked = Vec::new();
        for m in inner.messages.iter_mut() {
            if wanted.contains(&m.id) && !m.read && m.deleted_at.is_none() {
                m.read = true;
                marked.push(MarkedRead {
                    message_id: m.id,
                    conversation_id: m.conversation_id,
                });
            }
        }
        let affected: HashSet<Uuid> = marked.iter().map(|r| r.conversation_id).collect();
        for conversation_id in affected {
            recompute_unread(&mut inner, conversation_id);
        }
        Ok(marked)
    }

    async fn fetch_since(
        &self,
        conversation_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(AppError::NotFound("conversation"));
        }
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.deleted_at.is_none())
            .filter(|m| match since {
                Some(ts) => m.created_at > ts,
                None => true,
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        if since.is_none() && messages.len() > limit as usize {
            messages = messages.split_off(messages.len() - limit as usize);
        }
        Ok(messages)
    }

    async fn clear_conversation(&self, conversation_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(AppError::NotFound("conversation"));
        }
        inner.messages.retain(|m| m.conversation_id != conversation_id);
        if let Some(c) = inner.conversations.get_mut(&conversation_id) {
            c.unread_a = 0;
            c.unread_b = 0;
            c.last_message_id = None;
            c.last_message_at = None;
        }
        Ok(())
    }

    async fn edit_message(
        &self,
        message_id: Uuid,
        editor: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.deleted_at.is_none())
            .ok_or(AppError::NotFound("message"))?;
        if message.sender_id != editor {
            return Err(AppError::Forbidden);
        }
        message.content = content.to_string();
        message.content_hash = content_hash(content);
        message.edited_at = Some(now);
        Ok(message.clone())
    }

    async fn delete_message(&self, message_id: Uuid, caller: Uuid) -> AppResult<Uuid> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let conversation_id = {
            let message = inner
                .messages
                .iter_mut()
                .find(|m| m.id == message_id && m.deleted_at.is_none())
                .ok_or(AppError::NotFound("message"))?;
            if message.sender_id != caller {
                return Err(AppError::Forbidden);
            }
            message.deleted_at = Some(now);
            message.conversation_id
        };
        recompute_unread(&mut inner, conversation_id);
        Ok(conversation_id)
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound("conversation"))?;
        conversation.unread_for(user_id).ok_or(AppError::Forbidden)
    }

    async fn upsert_typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.typing.insert((conversation_id, user_id), at);
        Ok(())
    }

    async fn typing_mark(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner.typing.get(&(conversation_id, user_id)).copied())
    }

    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.last_seen.entry(user_id).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }

    async fn last_seen(&self, user_id: Uuid) -> AppResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner.last_seen.get(&user_id).copied())
    }

    async fn upsert_push_endpoint(
        &self,
        user_id: Uuid,
        endpoint: &str,
        keys: &PushKeys,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        match inner.endpoints.get_mut(endpoint) {
            Some(existing) => {
                existing.user_id = user_id;
                existing.keys = keys.clone();
            }
            None => {
                inner.endpoints.insert(
                    endpoint.to_string(),
                    PushEndpoint {
                        id: Uuid::new_v4(),
                        user_id,
                        endpoint: endpoint.to_string(),
                        keys: keys.clone(),
                        created_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_push_endpoint(&self, endpoint: &str) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.endpoints.remove(endpoint);
        Ok(())
    }

    async fn push_endpoints(&self, user_id: Uuid) -> AppResult<Vec<PushEndpoint>> {
        let inner = self.inner.lock().await;
        let mut endpoints: Vec<PushEndpoint> = inner
            .endpoints
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn notification_preferences(
        &self,
        user_id: Uuid,
    ) -> AppResult<NotificationPreferences> {
        let inner = self.inner.lock().await;
        Ok(inner
            .preferences
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| NotificationPreferences::default_for(user_id)))
    }

    async fn set_notification_preferences(
        &self,
        prefs: &NotificationPreferences,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.preferences.insert(prefs.user_id, prefs.clone());
        Ok(())
    }

    async fn record_notification(&self, record: &NotificationRecord) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.notifications.push(record.clone());
        Ok(())
    }

    async fn pending_notifications(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<NotificationRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<NotificationRecord> = inner
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && n.created_at >= since && n.read_at.is_none())
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn mark_notifications_read(
        &self,
        user_id: Uuid,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        for n in inner.notifications.iter_mut() {
            if n.user_id != user_id || n.read_at.is_some() {
                continue;
            }
            if ids.is_empty() || ids.contains(&n.id) {
                n.read_at = Some(at);
            }
        }
        Ok(())
    }
}
