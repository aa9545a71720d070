//! Store contract against a live Postgres.
//!
//! Ignored by default: point DATABASE_URL at a scratch database and run
//! `cargo test -- --ignored` to exercise them.

use uuid::Uuid;

use messaging_core::models::{MessageKind, NewMessage, PushKeys};
use messaging_core::{db, migrations, ConversationStore, PgStore};

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for pg tests");
    let pool = db::init_pool(&url).await.expect("connect postgres");
    migrations::run_all(&pool).await.expect("run migrations");
    PgStore::new(pool)
}

#[tokio::test]
#[ignore]
async fn conversation_creation_is_idempotent() {
    let store = store().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let first = store.get_or_create_conversation(a, b).await.unwrap();
    let second = store.get_or_create_conversation(b, a).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.created_at, second.created_at);
}

#[tokio::test]
#[ignore]
async fn send_mark_read_and_counters_round() {
    let store = store().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = store.get_or_create_conversation(a, b).await.unwrap();

    let message = store
        .append_message(NewMessage {
            conversation_id: conversation.id,
            sender_id: a,
            receiver_id: b,
            content: "hi".into(),
            kind: MessageKind::Text,
            reply_to: None,
        })
        .await
        .unwrap();
    assert_eq!(store.unread_count(conversation.id, b).await.unwrap(), 1);

    let marked = store.mark_read(&[message.id]).await.unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(store.unread_count(conversation.id, b).await.unwrap(), 0);

    // Idempotent re-mark.
    assert!(store.mark_read(&[message.id]).await.unwrap().is_empty());

    let fetched = store.fetch_since(conversation.id, None, 50).await.unwrap();
    assert!(fetched.iter().any(|m| m.id == message.id && m.read));

    store.clear_conversation(conversation.id).await.unwrap();
    assert!(store
        .fetch_since(conversation.id, None, 50)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore]
async fn typing_presence_and_push_rows_round() {
    let store = store().await;
    let (conv, user) = (Uuid::new_v4(), Uuid::new_v4());
    let now = chrono::Utc::now();

    store.upsert_typing_mark(conv, user, now).await.unwrap();
    let mark = store.typing_mark(conv, user).await.unwrap().unwrap();
    assert!((mark - now).num_milliseconds().abs() < 5);

    store.touch_last_seen(user, now).await.unwrap();
    store
        .touch_last_seen(user, now - chrono::Duration::seconds(30))
        .await
        .unwrap();
    let seen = store.last_seen(user).await.unwrap().unwrap();
    assert!((seen - now).num_milliseconds().abs() < 5);

    let keys = PushKeys {
        p256dh: "p".into(),
        auth: "a".into(),
    };
    let endpoint = format!("https://push.example/{user}");
    store.upsert_push_endpoint(user, &endpoint, &keys).await.unwrap();
    store.upsert_push_endpoint(user, &endpoint, &keys).await.unwrap();
    assert_eq!(store.push_endpoints(user).await.unwrap().len(), 1);
    store.remove_push_endpoint(&endpoint).await.unwrap();
    assert!(store.push_endpoints(user).await.unwrap().is_empty());
}
