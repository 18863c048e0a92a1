use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::schema::{Instance, UserRef};
use crate::services::{creation_accepted, PairingWebhook};

#[derive(Debug, Clone, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub phone_number: String,
}

/// Trims and rejects empty fields before anything leaves the process.
pub fn validate_new_instance(input: &NewInstance) -> CoreResult<(String, String)> {
    let name = input.name.trim();
    let phone = input.phone_number.trim();
    if name.is_empty() {
        return Err(CoreError::Invalid("instance name must not be empty".into()));
    }
    if phone.is_empty() {
        return Err(CoreError::Invalid("phone number must not be empty".into()));
    }
    Ok((name.to_string(), phone.to_string()))
}

/// Registers a new WhatsApp instance. The creation webhook is called first
/// and must accept (`starting`/`ok` after normalization) before anything is
/// persisted; the row lands with status `pending` and the raw reply attached
/// for audit.
pub async fn create_instance(
    db: &PgPool,
    webhook: &dyn PairingWebhook,
    user: &UserRef,
    input: &NewInstance,
) -> CoreResult<Instance> {
    let (name, phone_number) = validate_new_instance(input)?;

    let reply = webhook.create_instance(user, &name, &phone_number).await?;
    let status = reply.status.clone().ok_or_else(|| CoreError::Contract {
        reason: "creation webhook reply carries no recognizable status field".into(),
        raw: reply.raw.to_string(),
    })?;
    if !creation_accepted(&status) {
        return Err(CoreError::Contract {
            reason: format!("creation webhook answered status \"{status}\""),
            raw: reply.raw.to_string(),
        });
    }

    let instance = sqlx::query_as::<_, Instance>(
        r#"
        INSERT INTO instances (user_id, name, phone_number, status, webhook_response)
        VALUES ($1, $2, $3, 'pending', $4)
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(&name)
    .bind(&phone_number)
    .bind(&reply.raw)
    .fetch_one(db)
    .await
    .map_err(|e| {
        // the webhook side effect already happened; this must not pass as
        // "nothing was created"
        tracing::error!(
            user_id = %user.id,
            name = %name,
            error = %e,
            "creation webhook accepted but the instance row could not be written"
        );
        CoreError::StorageAfterWebhook { source: e }
    })?;

    tracing::info!(
        user_id = %user.id,
        instance_id = %instance.id,
        webhook_status = status,
        "instance registered"
    );
    Ok(instance)
}

/// All instances owned by the caller, newest first.
pub async fn list_instances(db: &PgPool, user: &UserRef) -> CoreResult<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        r#"
        SELECT *
        FROM instances
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(user.id)
    .fetch_all(db)
    .await?;
    Ok(instances)
}

/// Owner-scoped display rename. Does not touch the pairing state.
pub async fn rename_instance(
    db: &PgPool,
    user: &UserRef,
    instance_id: Uuid,
    name: &str,
) -> CoreResult<Instance> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Invalid("instance name must not be empty".into()));
    }

    sqlx::query_as::<_, Instance>(
        r#"
        UPDATE instances
        SET name = $3, updated_at = now()
        WHERE id = $1 AND user_id = $2
        RETURNING *
        "#,
    )
    .bind(instance_id)
    .bind(user.id)
    .bind(name)
    .fetch_optional(db)
    .await?
    .ok_or(CoreError::NotFound)
}

pub(crate) async fn fetch_instance(
    db: &PgPool,
    user: &UserRef,
    instance_id: Uuid,
) -> CoreResult<Instance> {
    sqlx::query_as::<_, Instance>(
        "SELECT * FROM instances WHERE id = $1 AND user_id = $2",
    )
    .bind(instance_id)
    .bind(user.id)
    .fetch_optional(db)
    .await?
    .ok_or(CoreError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{CreationReply, QrReply};
    use serde_json::json;

    struct StubWebhook {
        reply: serde_json::Value,
    }

    #[async_trait::async_trait]
    impl PairingWebhook for StubWebhook {
        async fn create_instance(
            &self,
            _user: &UserRef,
            _name: &str,
            _phone_number: &str,
        ) -> CoreResult<CreationReply> {
            let status = crate::services::normalize_status(&self.reply);
            Ok(CreationReply {
                raw: self.reply.clone(),
                status,
            })
        }

        async fn request_qr(
            &self,
            _user: &UserRef,
            _name: &str,
            _phone_number: &str,
        ) -> CoreResult<QrReply> {
            Ok(QrReply {
                payload: "2@stub".into(),
            })
        }
    }

    fn lazy_pool() -> sqlx::PgPool {
        // never actually connected; these tests must fail before storage
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost:1/unused")
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_error_status_persists_nothing() {
        let webhook = StubWebhook {
            reply: json!({ "status": "error" }),
        };
        let user = UserRef::new(Uuid::new_v4(), "demo@example.com");
        let err = create_instance(
            &lazy_pool(),
            &webhook,
            &user,
            &input("Demo", "+10000000000"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "contract");
    }

    #[tokio::test]
    async fn webhook_reply_without_status_is_a_contract_violation() {
        let webhook = StubWebhook {
            reply: json!({ "message": "hello" }),
        };
        let user = UserRef::new(Uuid::new_v4(), "demo@example.com");
        let err = create_instance(
            &lazy_pool(),
            &webhook,
            &user,
            &input("Demo", "+10000000000"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "contract");
    }

    #[tokio::test]
    async fn validation_runs_before_the_webhook_is_called() {
        let webhook = StubWebhook {
            reply: json!({ "status": "ok" }),
        };
        let user = UserRef::new(Uuid::new_v4(), "demo@example.com");
        let err = create_instance(&lazy_pool(), &webhook, &user, &input("", "+10000000000"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    fn input(name: &str, phone: &str) -> NewInstance {
        NewInstance {
            name: name.into(),
            phone_number: phone.into(),
        }
    }

    #[sqlx::test]
    async fn starting_reply_lands_a_pending_row(pool: sqlx::PgPool) {
        use crate::schema::InstanceStatus;

        let webhook = StubWebhook {
            reply: json!([{ "status": "STARTING" }]),
        };
        let user = UserRef::new(Uuid::new_v4(), "demo@example.com");

        let instance = create_instance(&pool, &webhook, &user, &input("Demo", "+10000000000"))
            .await
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(instance.webhook_response.is_some());

        let listed = list_instances(&pool, &user).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, instance.id);
    }

    #[test]
    fn validation_trims_both_fields() {
        let (name, phone) = validate_new_instance(&input("  Demo  ", " +10000000000 ")).unwrap();
        assert_eq!(name, "Demo");
        assert_eq!(phone, "+10000000000");
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = validate_new_instance(&input("   ", "+10000000000")).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn empty_phone_is_rejected() {
        let err = validate_new_instance(&input("Demo", "")).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }
}
