use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, Direction};

text_enum!(ConversationStatus {
    Active => "active",
    Archived => "archived",
});

/// Thread between one instance and one remote contact. At most one active
/// row per (instance, contact) pair, enforced by a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instance_id: Uuid,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    pub pushname: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_direction: Option<Direction>,
    pub unread_count: i32,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// What a contact list renders: pushname wins over the saved name, the
    /// bare number is the fallback.
    pub fn display_name(&self) -> &str {
        self.pushname
            .as_deref()
            .or(self.contact_name.as_deref())
            .unwrap_or(&self.contact_phone)
    }
}
