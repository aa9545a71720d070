use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification category, gated per user by `NotificationPreferences`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    /// Direct message received
    Message,
    /// Post liked
    Like,
    /// Post commented on
    Comment,
    /// Friend request received or accepted
    FriendRequest,
    /// Everything else (system, test pings)
    General,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Message => "message",
            NotificationCategory::Like => "like",
            NotificationCategory::Comment => "comment",
            NotificationCategory::FriendRequest => "friend_request",
            NotificationCategory::General => "general",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "message" => NotificationCategory::Message,
            "like" => NotificationCategory::Like,
            "comment" => NotificationCategory::Comment,
            "friend_request" => NotificationCategory::FriendRequest,
            _ => NotificationCategory::General,
        }
    }
}

/// Per-user notification toggles. A missing row means everything enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub messages: bool,
    pub likes: bool,
    pub comments: bool,
    pub friend_requests: bool,
    pub general: bool,
}

impl NotificationPreferences {
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            messages: true,
            likes: true,
            comments: true,
            friend_requests: true,
            general: true,
        }
    }

    pub fn allows(&self, category: NotificationCategory) -> bool {
        match category {
            NotificationCategory::Message => self.messages,
            NotificationCategory::Like => self.likes,
            NotificationCategory::Comment => self.comments,
            NotificationCategory::FriendRequest => self.friend_requests,
            NotificationCategory::General => self.general,
        }
    }
}

/// Web-Push key material registered with an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A user's registered push delivery target, unique by endpoint identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEndpoint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint: String,
    pub keys: PushKeys,
    pub created_at: DateTime<Utc>,
}

/// Audit row for one delivery attempt to one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
    pub delivered: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}
