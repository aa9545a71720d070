pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod migrations;
pub mod models;
pub mod presence;
pub mod push;
pub mod reaper;
pub mod receipts;
pub mod service;
pub mod store;
pub mod typing;

pub use cache::{CachedMessage, MessageCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use dispatch::{DispatchOutcome, NotificationDispatcher};
pub use error::{AppError, AppResult};
pub use models::{
    Conversation, Message, MessageKind, NotificationCategory, NotificationPreferences,
    NotificationRecord, PushEndpoint, PushKeys,
};
pub use presence::{PresenceStatus, PresenceTracker};
pub use push::{DeliveryError, PushTransport, WebPushClient};
pub use reaper::{sweep, Reaper, SweepStats};
pub use receipts::{ReadReceiptTracker, ReceiptBatch};
pub use service::{FetchResult, MessagingService};
pub use store::{ConversationStore, MemoryStore, PgStore};
pub use typing::TypingTracker;
