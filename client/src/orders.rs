use crate::{client::Client, store::GameStore, Error};
use terrapulse_types::{NewOrder, Order, OrderKind, OrderPayload};
use thiserror::Error as ThisError;
use tracing::debug;

/// Fixed cost of every order. Deliberate simplification: a resolution
/// engine would vary cost by kind.
pub const ORDER_COST_AP: u32 = 1;

#[derive(Debug, ThisError)]
pub enum SubmitError {
    /// Local validation failure; the remote authority was never contacted.
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: &'static str },
    /// The authority rejected the order (phase closed, budget exhausted,
    /// unknown game). The store is left unchanged.
    #[error("order rejected: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Transport(Error),
}

/// Validate a draft's fields into a wire payload. Never touches the
/// network.
pub fn validate(kind: OrderKind, from: &str, to: &str) -> Result<OrderPayload, SubmitError> {
    if to.is_empty() {
        return Err(SubmitError::InvalidPayload {
            reason: "target territory is required",
        });
    }
    if kind.requires_from() && from.is_empty() {
        return Err(SubmitError::InvalidPayload {
            reason: "source territory is required",
        });
    }
    Ok(OrderPayload {
        from: kind.requires_from().then(|| from.to_string()),
        to: to.to_string(),
    })
}

/// The order form as the player fills it in.
#[derive(Clone, Debug)]
pub struct OrderDraft {
    pub kind: OrderKind,
    pub from: String,
    pub to: String,
}

impl OrderDraft {
    pub fn new(kind: OrderKind) -> Self {
        Self {
            kind,
            from: String::new(),
            to: String::new(),
        }
    }

    pub fn clear(&mut self) {
        self.from.clear();
        self.to.clear();
    }
}

/// Submits player-authored orders for one `(game_id, player_id)` session.
///
/// The local budget is not pre-checked before submission; the remote
/// authority decides affordability. The store's budget remains available
/// to collaborators for UI gating.
pub struct OrderService {
    client: Client,
    store: GameStore,
    game_id: String,
    player_id: String,
}

impl OrderService {
    pub fn new(client: Client, store: GameStore, game_id: &str, player_id: &str) -> Self {
        Self {
            client,
            store,
            game_id: game_id.to_string(),
            player_id: player_id.to_string(),
        }
    }

    /// Validate and submit one order. On acceptance the stored row is
    /// appended to the store; the later realtime delivery of the same
    /// insert is then a safe no-op. On rejection the store is untouched.
    pub async fn submit(
        &self,
        kind: OrderKind,
        from: &str,
        to: &str,
    ) -> Result<Order, SubmitError> {
        let payload = validate(kind, from, to)?;
        let request = NewOrder {
            game_id: self.game_id.clone(),
            player_id: self.player_id.clone(),
            kind,
            payload,
            cost_ap: ORDER_COST_AP,
        };
        let order = match self.client.create_order(&request).await {
            Ok(order) => order,
            Err(Error::FailedWithBody { status, body }) => {
                debug!(game_id = %self.game_id, %status, "order rejected");
                return Err(SubmitError::Rejected { status, body });
            }
            Err(source) => return Err(SubmitError::Transport(source)),
        };
        self.store.append_order_if_absent(order.clone());
        Ok(order)
    }

    /// Submit from a form draft. The draft's territory fields are cleared
    /// regardless of outcome so the form never sticks; a lost order is
    /// detectable by the player re-checking the order list.
    pub async fn submit_draft(&self, draft: &mut OrderDraft) -> Result<Order, SubmitError> {
        let result = self.submit(draft.kind, &draft.from, &draft.to).await;
        draft.clear();
        result
    }
}
