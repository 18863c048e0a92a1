use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

text_enum!(Direction {
    Inbound => "inbound",
    Outbound => "outbound",
});

text_enum!(DeliveryStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
});

text_enum!(AttachmentKind {
    Image => "image",
    Video => "video",
    Audio => "audio",
    Document => "document",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    /// Media kind is not part of the inbound payload; infer it from the URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = infer_kind(&url);
        Self { url, kind }
    }
}

fn infer_kind(url: &str) -> AttachmentKind {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => AttachmentKind::Image,
        "mp4" | "mov" | "webm" | "3gp" => AttachmentKind::Video,
        "ogg" | "oga" | "opus" | "mp3" | "m4a" | "wav" => AttachmentKind::Audio,
        _ => AttachmentKind::Document,
    }
}

/// One chat turn. Never mutated after insert except `delivery_status`,
/// never deleted in normal operation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    /// Platform message id when the ingestion path supplies one; the dedup
    /// key for redelivered inbound events.
    pub external_id: Option<String>,
    pub direction: Direction,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_kind: Option<AttachmentKind>,
    pub delivery_status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_image_kind_from_extension() {
        let att = Attachment::from_url("https://cdn.example.com/media/abc.JPG");
        assert_eq!(att.kind, AttachmentKind::Image);
    }

    #[test]
    fn ignores_query_string_when_inferring() {
        let att = Attachment::from_url("https://cdn.example.com/v/clip.mp4?token=1.2");
        assert_eq!(att.kind, AttachmentKind::Video);
    }

    #[test]
    fn voice_note_extensions_map_to_audio() {
        for url in ["a.ogg", "b.opus", "c.m4a"] {
            assert_eq!(Attachment::from_url(url).kind, AttachmentKind::Audio);
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_document() {
        let att = Attachment::from_url("https://cdn.example.com/files/contract.pdf");
        assert_eq!(att.kind, AttachmentKind::Document);
    }

    #[test]
    fn direction_round_trips_through_text() {
        assert_eq!("inbound".parse::<Direction>().unwrap(), Direction::Inbound);
        assert_eq!(Direction::Outbound.as_str(), "outbound");
        assert!("sideways".parse::<Direction>().is_err());
    }
}
