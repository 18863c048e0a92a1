use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{FromRequestParts, Path, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::functions::{
    append_message, confirm_pairing, create_instance, find_or_create_conversation,
    list_conversations, list_instances, list_messages, mark_read, rename_instance,
    request_pairing, watch_conversation_messages, watch_conversations, watch_instances,
    NewInstance, NewMessage, PairingSession, Watch,
};
use crate::schema::{Attachment, Conversation, Direction, UserRef};
use crate::services::PairingWebhook;

pub struct AppState {
    pub db: PgPool,
    pub webhook: Arc<dyn PairingWebhook>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/instances", get(get_instances).post(post_instance))
        .route("/api/instances/{id}", patch(patch_instance))
        .route("/api/instances/{id}/pairing", post(post_pairing))
        .route("/api/instances/{id}/pairing/confirm", post(post_confirm))
        .route(
            "/api/conversations",
            get(get_conversations).post(post_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/ws/instances", get(ws_instances))
        .route("/ws/conversations", get(ws_conversations))
        .route("/ws/conversations/{id}", get(ws_conversation))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// The fronting identity proxy authenticates the session and forwards the
/// user as trusted headers; this only reconstructs the context value.
impl<S> FromRequestParts<S> for UserRef
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let Some(id) = header("x-user-id").and_then(|v| Uuid::parse_str(&v).ok()) else {
            let body = Json(json!({ "error": "unauthenticated" }));
            return Err((StatusCode::UNAUTHORIZED, body).into_response());
        };
        let email = header("x-user-email").unwrap_or_default();

        Ok(UserRef::new(id, email).with_profile(header("x-user-name"), header("x-user-plan")))
    }
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::AlreadyConnected => StatusCode::CONFLICT,
            CoreError::Transport(_) | CoreError::Contract { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Storage(_) | CoreError::StorageAfterWebhook { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
            "retryable": self.0.retryable(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn get_instances(
    State(state): State<Arc<AppState>>,
    user: UserRef,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(list_instances(&state.db, &user).await?))
}

async fn post_instance(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Json(input): Json<NewInstance>,
) -> ApiResult<impl IntoResponse> {
    let instance = create_instance(&state.db, state.webhook.as_ref(), &user, &input).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

async fn patch_instance(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
    Json(body): Json<RenameBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(rename_instance(&state.db, &user, id, &body.name).await?))
}

async fn post_pairing(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let mut session = PairingSession::new(id);
    let qr = request_pairing(&state.db, state.webhook.as_ref(), &user, &mut session).await?;
    Ok(Json(qr))
}

async fn post_confirm(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(confirm_pairing(&state.db, &user, id).await?))
}

/// Conversation row plus the resolved contact label the list view renders.
#[derive(Debug, serde::Serialize)]
struct ConversationView {
    display_name: String,
    #[serde(flatten)]
    conversation: Conversation,
}

impl From<Conversation> for ConversationView {
    fn from(conversation: Conversation) -> Self {
        Self {
            display_name: conversation.display_name().to_string(),
            conversation,
        }
    }
}

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    user: UserRef,
) -> ApiResult<impl IntoResponse> {
    let views: Vec<ConversationView> = list_conversations(&state.db, &user)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct OpenConversationBody {
    instance_id: Uuid,
    contact_phone: String,
}

async fn post_conversation(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Json(body): Json<OpenConversationBody>,
) -> ApiResult<impl IntoResponse> {
    let conversation =
        find_or_create_conversation(&state.db, &user, body.instance_id, &body.contact_phone)
            .await?;
    Ok(Json(conversation))
}

/// Opening the thread also clears the unread counter.
async fn get_messages(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let messages = list_messages(&state.db, &user, id).await?;
    mark_read(&state.db, &user, id).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    content: Option<String>,
    attachment_url: Option<String>,
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let input = NewMessage {
        conversation_id: id,
        direction: Direction::Outbound,
        content: body.content,
        attachment: body.attachment_url.map(Attachment::from_url),
        external_id: None,
    };
    let message = append_message(&state.db, &user, &input).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn ws_instances(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user: UserRef,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match watch_instances(&state.db, &user).await {
            Ok(watch) => pump_watch(socket, watch, "instances").await,
            Err(e) => tracing::warn!(error = %e, "could not open instance watch"),
        }
    })
}

async fn ws_conversations(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user: UserRef,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match watch_conversations(&state.db, &user).await {
            Ok(watch) => pump_watch(socket, watch, "conversations").await,
            Err(e) => tracing::warn!(error = %e, "could not open conversation watch"),
        }
    })
}

async fn ws_conversation(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user: UserRef,
    Path(id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match watch_conversation_messages(&state.db, &user, id).await {
            Ok(watch) => pump_watch(socket, watch, "messages").await,
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "could not open message watch")
            }
        }
    })
}

/// Pushes the full snapshot on every storage change. The watch is torn down
/// when the socket goes away, releasing the listener.
async fn pump_watch<T>(socket: WebSocket, mut watch: Watch<T>, stream: &'static str)
where
    T: Clone + serde::Serialize,
{
    let (mut sender, mut receiver) = socket.split();

    let initial = serde_json::to_string(&watch.latest()).unwrap_or_else(|_| "[]".into());
    if sender.send(WsMessage::Text(initial.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            snapshot = watch.next() => {
                let Some(snapshot) = snapshot else {
                    break;
                };
                let payload = serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".into());
                if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    // inbound frames are ignored; the socket is push-only
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    watch.close();
    tracing::debug!(stream, "live stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: CoreError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn errors_map_onto_http_statuses() {
        assert_eq!(
            status_of(CoreError::Invalid("empty".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(CoreError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CoreError::AlreadyConnected), StatusCode::CONFLICT);
        assert_eq!(
            status_of(CoreError::Transport("timed out".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(CoreError::Contract {
                reason: "no status".into(),
                raw: "{}".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(CoreError::Storage(sqlx::Error::PoolClosed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(CoreError::StorageAfterWebhook {
                source: sqlx::Error::PoolClosed
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
