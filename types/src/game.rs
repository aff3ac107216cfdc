use serde::{Deserialize, Serialize};

/// One ownable map region. Mutated only by applying world events; the
/// client never edits a territory in response to its own actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Territory {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub armies: u32,
}

/// The three order kinds a player can queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Reinforce,
    Attack,
    Fortify,
}

impl OrderKind {
    /// Whether this kind requires a source territory in its payload.
    pub fn requires_from(&self) -> bool {
        !matches!(self, OrderKind::Reinforce)
    }
}

/// Kind-specific order arguments. `from` is omitted from the wire for
/// reinforce orders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
}

/// A queued player intent, as stored by the remote authority. The same
/// shape serves the wire and the local snapshot.
///
/// `id` and `created_at` are assigned by the authority; `executed_at`
/// stays `None` until the authority resolves the order. The client never
/// sets either.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub game_id: String,
    pub player_id: String,
    pub kind: OrderKind,
    pub payload: OrderPayload,
    pub cost_ap: u32,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds; `None` until resolved.
    pub executed_at: Option<u64>,
}

/// The spendable action-point budget for one turn. The cap is set once
/// per turn by the remote authority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPoints {
    pub spent: u32,
    pub cap: u32,
}

impl ActionPoints {
    pub fn new(spent: u32, cap: u32) -> Self {
        Self {
            spent: spent.min(cap),
            cap,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.spent)
    }

    /// Record a charge against the budget. `spent` is clamped to `cap`
    /// so the invariant holds even against a misbehaving authority.
    pub fn charge(&mut self, cost: u32) {
        self.spent = self.spent.saturating_add(cost).min(self.cap);
    }
}

/// Where the current turn is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPhase {
    #[default]
    Orders,
    Locked,
    Resolving,
}
