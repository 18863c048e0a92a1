use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::functions::conversations::{list_conversations, list_messages};
use crate::functions::instances::list_instances;
use crate::schema::{Conversation, Instance, Message, UserRef};

/// Notification channel the storage triggers publish on.
pub const CHANGE_CHANNEL: &str = "store_changes";

const LISTENER_RETRY: Duration = Duration::from_millis(500);

/// What a storage trigger tells us. Hints are invalidation signals only;
/// the watched collection is always re-read in full, so delivery order and
/// coalescing of the channel never matter.
#[derive(Debug, Deserialize)]
struct ChangeHint {
    table: String,
    user_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
}

fn parse_hint(payload: &str) -> Option<ChangeHint> {
    serde_json::from_str(payload).ok()
}

/// An unparseable hint still triggers a re-fetch; the channel is never
/// trusted enough to skip one.
fn message_hint_matches(payload: &str, conversation_id: Uuid) -> bool {
    match parse_hint(payload) {
        Some(hint) => hint.table == "messages" && hint.conversation_id == Some(conversation_id),
        None => true,
    }
}

fn table_hint_matches(payload: &str, table: &str, user_id: Uuid) -> bool {
    match parse_hint(payload) {
        Some(hint) => hint.table == table && hint.user_id == Some(user_id),
        None => true,
    }
}

/// A live view over one collection. Owns the background listener task;
/// dropping (or `close`) tears the subscription down deterministically.
pub struct Watch<T> {
    rx: watch::Receiver<Vec<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> Watch<T> {
    /// Waits for the next published snapshot. `None` once the watch is
    /// closed.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        if self.rx.changed().await.is_err() {
            return None;
        }
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn latest(&self) -> Vec<T> {
        self.rx.borrow().clone()
    }

    pub fn close(self) {
        // Drop aborts the task
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_watch<T, M, F>(
    pool: &PgPool,
    initial: Vec<T>,
    matches: M,
    refetch: F,
) -> CoreResult<Watch<T>>
where
    T: Clone + Send + Sync + 'static,
    M: Fn(&str) -> bool + Send + 'static,
    F: Fn(PgPool) -> BoxFuture<'static, CoreResult<Vec<T>>> + Send + Sync + 'static,
{
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;

    let (tx, rx) = watch::channel(initial);
    let pool = pool.clone();

    let task = tokio::spawn(async move {
        loop {
            let relevant = match listener.recv().await {
                Ok(notification) => matches(notification.payload()),
                Err(e) => {
                    // the listener reconnects on the next recv; until then a
                    // change may have been missed, so re-fetch
                    tracing::warn!(error = %e, "change listener interrupted");
                    tokio::time::sleep(LISTENER_RETRY).await;
                    true
                }
            };
            if !relevant {
                continue;
            }

            match refetch(pool.clone()).await {
                Ok(snapshot) => {
                    if tx.send(snapshot).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "re-fetch after change failed"),
            }
        }
    });

    Ok(Watch { rx, task })
}

/// Live ordered view of one conversation's messages. The initial snapshot is
/// fetched before subscribing callers see anything.
pub async fn watch_conversation_messages(
    pool: &PgPool,
    user: &UserRef,
    conversation_id: Uuid,
) -> CoreResult<Watch<Message>> {
    let initial = list_messages(pool, user, conversation_id).await?;
    let user = user.clone();
    spawn_watch(
        pool,
        initial,
        move |payload| message_hint_matches(payload, conversation_id),
        move |pool: PgPool| {
            let user = user.clone();
            Box::pin(async move { list_messages(&pool, &user, conversation_id).await }) as BoxFuture<'static, _>
        },
    )
    .await
}

/// Live view of the caller's active conversations (list screen).
pub async fn watch_conversations(pool: &PgPool, user: &UserRef) -> CoreResult<Watch<Conversation>> {
    let initial = list_conversations(pool, user).await?;
    let user_id = user.id;
    let user = user.clone();
    spawn_watch(
        pool,
        initial,
        move |payload| table_hint_matches(payload, "conversations", user_id),
        move |pool: PgPool| {
            let user = user.clone();
            Box::pin(async move { list_conversations(&pool, &user).await }) as BoxFuture<'static, _>
        },
    )
    .await
}

/// Live view of the caller's instances (status changes during pairing).
pub async fn watch_instances(pool: &PgPool, user: &UserRef) -> CoreResult<Watch<Instance>> {
    let initial = list_instances(pool, user).await?;
    let user_id = user.id;
    let user = user.clone();
    spawn_watch(
        pool,
        initial,
        move |payload| table_hint_matches(payload, "instances", user_id),
        move |pool: PgPool| {
            let user = user.clone();
            Box::pin(async move { list_instances(&pool, &user).await }) as BoxFuture<'static, _>
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_hint_must_match_conversation() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let hit = format!(r#"{{"table":"messages","user_id":null,"conversation_id":"{id}"}}"#);
        let miss = format!(r#"{{"table":"messages","conversation_id":"{other}"}}"#);
        let wrong_table = format!(r#"{{"table":"conversations","conversation_id":"{id}"}}"#);

        assert!(message_hint_matches(&hit, id));
        assert!(!message_hint_matches(&miss, id));
        assert!(!message_hint_matches(&wrong_table, id));
    }

    #[test]
    fn unparseable_hints_force_a_refetch() {
        let id = Uuid::new_v4();
        assert!(message_hint_matches("not json", id));
        assert!(table_hint_matches("{}", "instances", id));
    }

    #[test]
    fn table_hints_are_scoped_to_the_owner() {
        let me = Uuid::new_v4();
        let someone_else = Uuid::new_v4();
        let mine = format!(r#"{{"table":"instances","user_id":"{me}"}}"#);
        let theirs = format!(r#"{{"table":"instances","user_id":"{someone_else}"}}"#);

        assert!(table_hint_matches(&mine, "instances", me));
        assert!(!table_hint_matches(&theirs, "instances", me));
        assert!(!table_hint_matches(&mine, "conversations", me));
    }
}
