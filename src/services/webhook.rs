use std::time::Duration;

use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::schema::UserRef;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Identity envelope the automation webhooks expect on every call.
#[derive(Debug, Serialize)]
pub struct WebhookEnvelope<'a> {
    #[serde(rename = "usuario")]
    pub user: &'a UserRef,
    #[serde(rename = "instancia")]
    pub instance: InstanceRef<'a>,
}

#[derive(Debug, Serialize)]
pub struct InstanceRef<'a> {
    #[serde(rename = "nombre_instancia")]
    pub name: &'a str,
    #[serde(rename = "numero_whatsapp")]
    pub phone_number: &'a str,
}

/// Reply from the instance-creation webhook. `status` is already normalized
/// (see [`normalize_status`]); the caller decides acceptance.
#[derive(Debug, Clone)]
pub struct CreationReply {
    pub raw: serde_json::Value,
    pub status: Option<String>,
}

/// Reply from the QR webhook, normalized to a single payload string.
#[derive(Debug, Clone)]
pub struct QrReply {
    pub payload: String,
}

#[async_trait::async_trait]
pub trait PairingWebhook: Send + Sync {
    async fn create_instance(
        &self,
        user: &UserRef,
        name: &str,
        phone_number: &str,
    ) -> CoreResult<CreationReply>;

    async fn request_qr(
        &self,
        user: &UserRef,
        name: &str,
        phone_number: &str,
    ) -> CoreResult<QrReply>;
}

pub struct HttpPairingWebhook {
    client: reqwest::Client,
    create_url: String,
    qr_url: String,
}

impl HttpPairingWebhook {
    pub fn new(
        create_url: String,
        qr_url: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            create_url,
            qr_url,
        })
    }

    async fn post(
        &self,
        url: &str,
        user: &UserRef,
        name: &str,
        phone_number: &str,
    ) -> CoreResult<String> {
        let body = WebhookEnvelope {
            user,
            instance: InstanceRef { name, phone_number },
        };

        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(CoreError::Contract {
                reason: format!("webhook returned {status}"),
                raw: text,
            });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl PairingWebhook for HttpPairingWebhook {
    async fn create_instance(
        &self,
        user: &UserRef,
        name: &str,
        phone_number: &str,
    ) -> CoreResult<CreationReply> {
        let text = self.post(&self.create_url, user, name, phone_number).await?;

        // a non-JSON 2xx body is still kept for diagnostics, as the original
        // preserved the raw text under a message field
        let raw = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or_else(|_| serde_json::json!({ "message": text }));
        let status = normalize_status(&raw);

        Ok(CreationReply { raw, status })
    }

    async fn request_qr(
        &self,
        user: &UserRef,
        name: &str,
        phone_number: &str,
    ) -> CoreResult<QrReply> {
        let text = self.post(&self.qr_url, user, name, phone_number).await?;

        match extract_qr_payload(&text) {
            Some(payload) => Ok(QrReply { payload }),
            None => Err(CoreError::Contract {
                reason: "QR webhook returned an empty body".into(),
                raw: text,
            }),
        }
    }
}

/// Normalizes the status field of a creation reply. The webhook is loose
/// about shape, so parsing is deliberately tolerant, in this order:
///
/// 1. a single level of array wrapping is unwrapped (first element);
/// 2. the key may be `status` or `state`, in any case (`status` wins);
/// 3. the value is trimmed and lowercased.
///
/// Shapes beyond these are not guessed at; the caller treats `None` as a
/// contract violation.
pub fn normalize_status(value: &serde_json::Value) -> Option<String> {
    let inner = match value {
        serde_json::Value::Array(items) => items.first()?,
        other => other,
    };
    let object = inner.as_object()?;

    for wanted in ["status", "state"] {
        let found = object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
            .and_then(|(_, v)| v.as_str());
        if let Some(text) = found {
            let normalized = text.trim().to_ascii_lowercase();
            if !normalized.is_empty() {
                return Some(normalized);
            }
        }
    }
    None
}

/// Whether a normalized creation status means the webhook accepted the work.
pub fn creation_accepted(status: &str) -> bool {
    matches!(status, "starting" | "ok")
}

/// Normalizes a QR webhook body to the payload string. JSON bodies are
/// searched for a payload field in precedence order `qr`, `qr_code`,
/// `qrcode`, `code`, `base64`; a JSON string is used directly; any other
/// JSON is passed through serialized, matching the original's behavior.
/// Non-JSON bodies are themselves the payload.
pub fn extract_qr_payload(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Some(trimmed.to_string());
    };

    match &value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Object(object) => {
            for key in ["qr", "qr_code", "qrcode", "code", "base64"] {
                if let Some(text) = object.get(key).and_then(|v| v.as_str()) {
                    if !text.trim().is_empty() {
                        return Some(text.trim().to_string());
                    }
                }
            }
            Some(value.to_string())
        }
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn envelope_serializes_contract_field_names() {
        let user = UserRef::new(Uuid::new_v4(), "demo@example.com");
        let envelope = WebhookEnvelope {
            user: &user,
            instance: InstanceRef {
                name: "Demo",
                phone_number: "+10000000000",
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["instancia"]["nombre_instancia"], "Demo");
        assert_eq!(value["instancia"]["numero_whatsapp"], "+10000000000");
        assert_eq!(value["usuario"]["plan"], "freemium");
        assert!(value["usuario"]["nombre"].is_string());
    }

    #[test]
    fn normalizes_plain_status_object() {
        assert_eq!(
            normalize_status(&json!({ "status": "STARTING" })).as_deref(),
            Some("starting")
        );
    }

    #[test]
    fn unwraps_one_array_level() {
        assert_eq!(
            normalize_status(&json!([{ "Status": "ok" }])).as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn accepts_state_key_in_any_case() {
        assert_eq!(
            normalize_status(&json!({ "STATE": "starting" })).as_deref(),
            Some("starting")
        );
    }

    #[test]
    fn status_key_wins_over_state() {
        assert_eq!(
            normalize_status(&json!({ "state": "ok", "status": "starting" })).as_deref(),
            Some("starting")
        );
    }

    #[test]
    fn rejects_shapes_it_does_not_know() {
        assert_eq!(normalize_status(&json!({})), None);
        assert_eq!(normalize_status(&json!([])), None);
        assert_eq!(normalize_status(&json!("starting")), None);
        assert_eq!(normalize_status(&json!({ "status": 7 })), None);
        // only one array level is unwrapped
        assert_eq!(normalize_status(&json!([[{ "status": "ok" }]])), None);
    }

    #[test]
    fn creation_accepts_starting_and_ok_only() {
        assert!(creation_accepted("starting"));
        assert!(creation_accepted("ok"));
        assert!(!creation_accepted("error"));
        assert!(!creation_accepted(""));
    }

    #[test]
    fn qr_payload_prefers_named_fields() {
        let body = r#"{"qr":"2@abc","code":"ignored"}"#;
        assert_eq!(extract_qr_payload(body).as_deref(), Some("2@abc"));

        let body = r#"{"qr_code":"2@def"}"#;
        assert_eq!(extract_qr_payload(body).as_deref(), Some("2@def"));
    }

    #[test]
    fn qr_payload_falls_back_to_serialized_json() {
        let body = r#"{"unexpected":"shape"}"#;
        assert_eq!(
            extract_qr_payload(body).as_deref(),
            Some(r#"{"unexpected":"shape"}"#)
        );
    }

    #[test]
    fn raw_text_body_is_the_payload() {
        assert_eq!(
            extract_qr_payload("  2@rawpairingcode  ").as_deref(),
            Some("2@rawpairingcode")
        );
    }

    #[test]
    fn json_string_body_is_unquoted() {
        assert_eq!(extract_qr_payload(r#""2@quoted""#).as_deref(), Some("2@quoted"));
    }

    #[test]
    fn empty_bodies_yield_nothing() {
        assert_eq!(extract_qr_payload(""), None);
        assert_eq!(extract_qr_payload("   "), None);
        assert_eq!(extract_qr_payload("null"), None);
    }
}
