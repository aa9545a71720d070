pub mod conversation;
pub mod message;
pub mod notification;

pub use conversation::Conversation;
pub use message::{content_hash, Message, MessageKind, NewMessage};
pub use notification::{
    NotificationCategory, NotificationPreferences, NotificationRecord, PushEndpoint, PushKeys,
};
