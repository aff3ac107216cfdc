use crate::{client::Client, Error};
use thiserror::Error as ThisError;
use tracing::debug;

#[derive(Debug, ThisError)]
pub enum LockError {
    /// The turn was already locked. Expected when the transition is
    /// requested twice; non-fatal.
    #[error("turn already locked")]
    AlreadyLocked,
    #[error("lock rejected: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Transport(Error),
}

/// End this player's ability to submit further orders for the current
/// turn. No local state is mutated; any resulting change arrives through
/// the change feeds.
pub async fn lock_orders(client: &Client, game_id: &str) -> Result<(), LockError> {
    match client.lock_orders(game_id).await {
        Ok(()) => {
            debug!(game_id, "orders locked");
            Ok(())
        }
        Err(Error::FailedWithBody { status, body }) => {
            if status == reqwest::StatusCode::CONFLICT {
                debug!(game_id, "turn already locked");
                Err(LockError::AlreadyLocked)
            } else {
                Err(LockError::Rejected { status, body })
            }
        }
        Err(source) => Err(LockError::Transport(source)),
    }
}
