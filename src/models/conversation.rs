use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving conversation ids from participant pairs.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c_1b2a_6d4e_49f7_a0c5_2e8b_7d61_34a9);

/// A direct-message pairing of two users.
///
/// The id is a pure function of the unordered participant pair, so creating
/// the conversation for (a, b) and for (b, a) always yields the same row.
/// Participants are stored sorted (`user_a < user_b`) and the per-participant
/// unread counters follow that ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub unread_a: i64,
    pub unread_b: i64,
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Deterministic id for the unordered pair: v5 UUID over the sorted
    /// participant ids, so `id_for(a, b) == id_for(b, a)`.
    pub fn id_for(a: Uuid, b: Uuid) -> Uuid {
        let (lo, hi) = Self::sorted_pair(a, b);
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(lo.as_bytes());
        name[16..].copy_from_slice(hi.as_bytes());
        Uuid::new_v5(&CONVERSATION_NAMESPACE, &name)
    }

    pub fn sorted_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The stored unread counter for one of the two participants.
    pub fn unread_for(&self, user_id: Uuid) -> Option<i64> {
        if user_id == self.user_a {
            Some(self.unread_a)
        } else if user_id == self.user_b {
            Some(self.unread_b)
        } else {
            None
        }
    }
}
