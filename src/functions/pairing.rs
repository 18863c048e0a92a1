use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::functions::instances::fetch_instance;
use crate::schema::{Instance, InstanceStatus, UserRef};
use crate::services::PairingWebhook;

/// Working-memory state of one pairing attempt. Only `connected` is ever
/// persisted; everything else lives for the duration of the QR dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    /// Webhook call in flight; never persisted.
    QrRequested,
    /// A QR payload was received and is on display.
    AwaitingScan { payload: String },
    Connected,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct PairingSession {
    pub instance_id: Uuid,
    state: PairingState,
}

impl PairingSession {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            state: PairingState::Idle,
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    /// A new QR request is allowed from anywhere except the terminal state;
    /// a failed attempt may be retried.
    fn begin_request(&mut self) -> CoreResult<()> {
        if self.state == PairingState::Connected {
            return Err(CoreError::AlreadyConnected);
        }
        self.state = PairingState::QrRequested;
        Ok(())
    }

    fn qr_received(&mut self, payload: String) {
        self.state = PairingState::AwaitingScan { payload };
    }

    fn failed(&mut self, reason: String) {
        self.state = PairingState::Failed { reason };
    }

    fn confirmed(&mut self) {
        self.state = PairingState::Connected;
    }
}

/// How the received payload should be rendered.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QrRender {
    /// The webhook already produced an image; pass the URL through.
    ImageUrl { url: String },
    /// Raw pairing string; `terminal` carries a locally rendered text QR
    /// when encoding succeeded.
    Scannable {
        payload: String,
        terminal: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QrCode {
    pub payload: String,
    pub render: QrRender,
}

pub fn classify_qr_payload(payload: &str) -> QrRender {
    if payload.starts_with("http://")
        || payload.starts_with("https://")
        || payload.starts_with("data:image")
    {
        return QrRender::ImageUrl {
            url: payload.to_string(),
        };
    }

    let terminal = match qr2term::generate_qr_string(payload) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(error = %e, "could not render QR payload locally");
            None
        }
    };
    QrRender::Scannable {
        payload: payload.to_string(),
        terminal,
    }
}

/// Asks the QR webhook for a fresh pairing code. Blocked once the stored
/// status is `connected`; a transport or contract failure parks the session
/// in `Failed` and the user may retry.
pub async fn request_pairing(
    db: &PgPool,
    webhook: &dyn PairingWebhook,
    user: &UserRef,
    session: &mut PairingSession,
) -> CoreResult<QrCode> {
    let instance = fetch_instance(db, user, session.instance_id).await?;
    if instance.status == InstanceStatus::Connected {
        session.confirmed();
        return Err(CoreError::AlreadyConnected);
    }

    session.begin_request()?;

    let reply = match webhook
        .request_qr(user, &instance.name, &instance.phone_number)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            session.failed(e.to_string());
            return Err(e);
        }
    };

    // audit copy; pairing continues on the in-memory payload if this fails
    let persisted = sqlx::query(
        "UPDATE instances SET qr_data = $3, updated_at = now() WHERE id = $1 AND user_id = $2",
    )
    .bind(instance.id)
    .bind(user.id)
    .bind(&reply.payload)
    .execute(db)
    .await;
    if let Err(e) = persisted {
        tracing::warn!(instance_id = %instance.id, error = %e, "could not persist QR payload");
    }

    session.qr_received(reply.payload.clone());
    tracing::info!(instance_id = %instance.id, "QR payload received, awaiting scan");

    let render = classify_qr_payload(&reply.payload);
    Ok(QrCode {
        payload: reply.payload,
        render,
    })
}

/// The user says they scanned the code. There is no channel to observe the
/// real handshake, so this trusts the user and persists `connected`.
/// Idempotent: confirming an already-connected instance is a no-op success.
pub async fn confirm_pairing(
    db: &PgPool,
    user: &UserRef,
    instance_id: Uuid,
) -> CoreResult<Instance> {
    let instance = sqlx::query_as::<_, Instance>(
        r#"
        UPDATE instances
        SET status = 'connected', updated_at = now()
        WHERE id = $1 AND user_id = $2
        RETURNING *
        "#,
    )
    .bind(instance_id)
    .bind(user.id)
    .fetch_optional(db)
    .await?
    .ok_or(CoreError::NotFound)?;

    tracing::info!(instance_id = %instance.id, "pairing confirmed");
    Ok(instance)
}
