use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

text_enum!(InstanceStatus {
    Pending => "pending",
    Connected => "connected",
    Disconnected => "disconnected",
});

/// One registered WhatsApp line. Created by the registry with status
/// `pending`; only an explicit pairing confirmation moves it to `connected`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub phone_number: String,
    pub status: InstanceStatus,
    /// Last QR payload handed out by the pairing webhook, kept for audit.
    pub qr_data: Option<String>,
    /// Raw creation webhook reply, kept for diagnostics.
    pub webhook_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
