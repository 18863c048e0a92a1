use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::schema::{Attachment, Conversation, DeliveryStatus, Direction, Message, UserRef};

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
    /// Platform message id, when the caller has one; dedup key for
    /// redelivered inbound events.
    pub external_id: Option<String>,
}

async fn select_active_conversation(
    db: &PgPool,
    user: &UserRef,
    instance_id: Uuid,
    contact_phone: &str,
) -> CoreResult<Option<Conversation>> {
    let found = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT *
        FROM conversations
        WHERE user_id = $1 AND instance_id = $2 AND contact_phone = $3
          AND status = 'active'
        "#,
    )
    .bind(user.id)
    .bind(instance_id)
    .bind(contact_phone)
    .fetch_optional(db)
    .await?;
    Ok(found)
}

/// Finds the active conversation for (instance, contact) or creates it. Safe
/// under concurrent invocation: a lost insert race lands on the partial
/// unique index and is resolved by re-reading the winner's row.
pub async fn find_or_create_conversation(
    db: &PgPool,
    user: &UserRef,
    instance_id: Uuid,
    contact_phone: &str,
) -> CoreResult<Conversation> {
    let contact_phone = contact_phone.trim();
    if contact_phone.is_empty() {
        return Err(CoreError::Invalid("contact phone must not be empty".into()));
    }

    // ownership check; never trust a client-supplied instance id
    let owned: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM instances WHERE id = $1 AND user_id = $2")
            .bind(instance_id)
            .bind(user.id)
            .fetch_optional(db)
            .await?;
    if owned.is_none() {
        return Err(CoreError::NotFound);
    }

    if let Some(existing) = select_active_conversation(db, user, instance_id, contact_phone).await? {
        return Ok(existing);
    }

    let inserted = sqlx::query_as::<_, Conversation>(
        r#"
        INSERT INTO conversations (user_id, instance_id, contact_phone)
        VALUES ($1, $2, $3)
        ON CONFLICT (instance_id, contact_phone) WHERE status = 'active' DO NOTHING
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(instance_id)
    .bind(contact_phone)
    .fetch_optional(db)
    .await?;

    match inserted {
        Some(conversation) => {
            tracing::info!(
                conversation_id = %conversation.id,
                instance_id = %instance_id,
                "conversation created"
            );
            Ok(conversation)
        }
        // someone else created it between the select and the insert
        None => select_active_conversation(db, user, instance_id, contact_phone)
            .await?
            .ok_or(CoreError::NotFound),
    }
}

/// Appends one message and refreshes the parent's denormalized preview and
/// unread counter in the same transaction. The unread increment happens
/// in-place in SQL; concurrent appenders never lose updates.
///
/// When `external_id` is set and already stored for this conversation, the
/// replayed event is a no-op and the existing row comes back untouched.
/// Platform ids are only unique within one chat, so the dedup key is
/// `(conversation_id, external_id)`.
pub async fn append_message(db: &PgPool, user: &UserRef, input: &NewMessage) -> CoreResult<Message> {
    if input.content.as_deref().map_or(true, |c| c.trim().is_empty())
        && input.attachment.is_none()
    {
        return Err(CoreError::Invalid(
            "a message needs content or an attachment".into(),
        ));
    }

    let owned: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM conversations WHERE id = $1 AND user_id = $2")
            .bind(input.conversation_id)
            .bind(user.id)
            .fetch_optional(db)
            .await?;
    if owned.is_none() {
        return Err(CoreError::NotFound);
    }

    let content = input.content.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let (attachment_url, attachment_kind) = match &input.attachment {
        Some(att) => (Some(att.url.as_str()), Some(att.kind)),
        None => (None, None),
    };
    // outbound messages start their delivery life as sent
    let delivery_status = match input.direction {
        Direction::Outbound => Some(DeliveryStatus::Sent),
        Direction::Inbound => None,
    };

    let mut tx = db.begin().await?;

    let inserted = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages
            (user_id, conversation_id, external_id, direction, content,
             attachment_url, attachment_kind, delivery_status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (conversation_id, external_id) WHERE external_id IS NOT NULL DO NOTHING
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(input.conversation_id)
    .bind(&input.external_id)
    .bind(input.direction)
    .bind(content)
    .bind(attachment_url)
    .bind(attachment_kind)
    .bind(delivery_status)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(message) = inserted else {
        // redelivery of an event we already hold; counters stay untouched
        tx.rollback().await?;
        let external_id = input.external_id.as_deref().unwrap_or_default();
        tracing::debug!(external_id, "duplicate inbound event ignored");
        return sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1 AND external_id = $2 AND user_id = $3
            "#,
        )
        .bind(input.conversation_id)
        .bind(external_id)
        .bind(user.id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound);
    };

    let preview = match (content, &input.attachment) {
        (Some(text), _) => text.to_string(),
        (None, Some(att)) => format!("[{}]", att.kind),
        (None, None) => String::new(),
    };

    sqlx::query(
        r#"
        UPDATE conversations
        SET last_message = $2,
            last_message_at = $3,
            last_message_direction = $4,
            unread_count = unread_count + CASE WHEN $4 = 'inbound' THEN 1 ELSE 0 END,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(input.conversation_id)
    .bind(&preview)
    .bind(message.created_at)
    .bind(input.direction)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::debug!(
        conversation_id = %input.conversation_id,
        message_id = %message.id,
        direction = %input.direction,
        "message appended"
    );
    Ok(message)
}

/// All messages of a conversation in their stable total order: creation time
/// ascending, server-assigned id as the tiebreak.
pub async fn list_messages(
    db: &PgPool,
    user: &UserRef,
    conversation_id: Uuid,
) -> CoreResult<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT *
        FROM messages
        WHERE conversation_id = $1 AND user_id = $2
        ORDER BY created_at, id
        "#,
    )
    .bind(conversation_id)
    .bind(user.id)
    .fetch_all(db)
    .await?;
    Ok(messages)
}

/// Resets the unread counter; called when the owner opens the conversation.
pub async fn mark_read(db: &PgPool, user: &UserRef, conversation_id: Uuid) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET unread_count = 0, updated_at = now()
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(conversation_id)
    .bind(user.id)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound);
    }
    Ok(())
}

/// Active conversations for the list view, most recent activity first.
pub async fn list_conversations(db: &PgPool, user: &UserRef) -> CoreResult<Vec<Conversation>> {
    let conversations = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT *
        FROM conversations
        WHERE user_id = $1 AND status = 'active'
        ORDER BY last_message_at DESC NULLS LAST, created_at DESC
        "#,
    )
    .bind(user.id)
    .fetch_all(db)
    .await?;
    Ok(conversations)
}
