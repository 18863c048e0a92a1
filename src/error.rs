use thiserror::Error;

/// Failure taxonomy at the component boundary. The view layer only ever sees
/// one of these kinds plus whether a retry makes sense.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Network-level failure reaching a webhook, including timeouts.
    /// Retryable by re-invoking the user action; never auto-retried.
    #[error("webhook transport failure: {0}")]
    Transport(String),

    /// The webhook answered but outside its contract. The raw body is
    /// preserved for diagnostics.
    #[error("webhook contract violation: {reason}")]
    Contract { reason: String, raw: String },

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    /// Storage write failed after the webhook side effect already happened.
    /// Distinct from `Storage` because "nothing happened" is not true.
    #[error("storage failure after webhook side effect: {source}")]
    StorageAfterWebhook { source: sqlx::Error },

    #[error("not found")]
    NotFound,

    /// Pairing cannot be re-requested for an instance that is already
    /// connected.
    #[error("instance is already connected")]
    AlreadyConnected,
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Invalid(_) => "invalid",
            CoreError::Transport(_) => "transport",
            CoreError::Contract { .. } => "contract",
            CoreError::Storage(_) => "storage",
            CoreError::StorageAfterWebhook { .. } => "storage_after_webhook",
            CoreError::NotFound => "not_found",
            CoreError::AlreadyConnected => "already_connected",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::Storage(_) | CoreError::StorageAfterWebhook { .. }
        )
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Transport(format!("request timed out: {err}"))
        } else {
            CoreError::Transport(err.to_string())
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_retryable_contract_is_not() {
        assert!(CoreError::Transport("connection refused".into()).retryable());
        assert!(!CoreError::Contract {
            reason: "unexpected status".into(),
            raw: "{}".into()
        }
        .retryable());
        assert!(!CoreError::AlreadyConnected.retryable());
    }

    #[test]
    fn kinds_are_stable_identifiers() {
        assert_eq!(CoreError::NotFound.kind(), "not_found");
        assert_eq!(
            CoreError::StorageAfterWebhook {
                source: sqlx::Error::PoolClosed
            }
            .kind(),
            "storage_after_webhook"
        );
    }
}
