use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use terrapulse_types::{
    Change, ChangeKind, GameStatusRow, NewOrder, Order, Table, TerritoryRow, TurnPhase,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

mod api;
pub use api::Api;

const CHANGE_BUS_CAPACITY: usize = 1024;

/// Behavior knobs. The binary reads these from the environment; tests
/// set them directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimulatorConfig {
    /// Reject change-feed upgrades, for exercising
    /// subscription-establishment failure in clients.
    pub refuse_changes: bool,
    /// Fail the query routes with a server error, for exercising
    /// partial-initial-load tolerance in clients.
    pub fail_queries: bool,
}

/// One change-feed frame, serialized once, with the routing metadata the
/// per-connection filters need.
#[derive(Clone, Debug)]
pub struct ChangeFrame {
    pub game_id: String,
    pub table: Table,
    pub json: String,
}

/// Why an order creation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderRejection {
    UnknownGame,
    PhaseClosed,
    BudgetExhausted,
}

/// Why a lock request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRejection {
    UnknownGame,
    AlreadyLocked,
}

struct GameWorld {
    turn: u32,
    phase: TurnPhase,
    ap_cap: u32,
    territories: BTreeMap<String, TerritoryRow>,
    orders: Vec<Order>,
}

/// In-memory remote authority: the query/write/rpc interfaces plus one
/// broadcast change bus feeding the per-connection WebSocket filters.
pub struct Simulator {
    pub config: SimulatorConfig,
    games: Mutex<BTreeMap<String, GameWorld>>,
    changes: broadcast::Sender<ChangeFrame>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self {
            config,
            games: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    /// Subscribe to the raw change bus. Connections filter by table and
    /// game before forwarding.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeFrame> {
        self.changes.subscribe()
    }

    fn broadcast<R: serde::Serialize>(
        &self,
        game_id: &str,
        table: Table,
        kind: ChangeKind,
        row: &R,
    ) {
        let frame = Change { table, kind, row };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                // No subscribers is fine.
                let _ = self.changes.send(ChangeFrame {
                    game_id: game_id.to_string(),
                    table,
                    json,
                });
            }
            Err(err) => warn!(game_id, %table, error = %err, "failed to encode change frame"),
        }
    }

    /// Create a game in the `orders` phase of turn 1.
    pub fn create_game(&self, game_id: &str, ap_cap: u32) {
        let mut games = self.games.lock().unwrap();
        games.insert(
            game_id.to_string(),
            GameWorld {
                turn: 1,
                phase: TurnPhase::Orders,
                ap_cap,
                territories: BTreeMap::new(),
                orders: Vec::new(),
            },
        );
        debug!(game_id, ap_cap, "game created");
    }

    /// Force a turn phase. Returns whether the game exists.
    pub fn set_phase(&self, game_id: &str, phase: TurnPhase) -> bool {
        let mut games = self.games.lock().unwrap();
        match games.get_mut(game_id) {
            Some(game) => {
                game.phase = phase;
                true
            }
            None => false,
        }
    }

    pub fn game_status(&self, game_id: &str) -> Option<GameStatusRow> {
        let games = self.games.lock().unwrap();
        games.get(game_id).map(|game| GameStatusRow {
            game_id: game_id.to_string(),
            turn: game.turn,
            phase: game.phase,
            ap_cap: game.ap_cap,
        })
    }

    pub fn territories(&self, game_id: &str) -> Option<Vec<TerritoryRow>> {
        let games = self.games.lock().unwrap();
        games
            .get(game_id)
            .map(|game| game.territories.values().cloned().collect())
    }

    /// One player's orders, ordered by creation time ascending.
    pub fn orders(&self, game_id: &str, player_id: &str) -> Option<Vec<Order>> {
        let games = self.games.lock().unwrap();
        games.get(game_id).map(|game| {
            let mut orders: Vec<Order> = game
                .orders
                .iter()
                .filter(|order| order.player_id == player_id)
                .cloned()
                .collect();
            orders.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            orders
        })
    }

    /// Insert or replace a territory row, broadcasting the change.
    /// Returns whether the game exists.
    pub fn put_territory(&self, game_id: &str, row: TerritoryRow) -> bool {
        let kind = {
            let mut games = self.games.lock().unwrap();
            let Some(game) = games.get_mut(game_id) else {
                return false;
            };
            let kind = if game.territories.contains_key(&row.territory_id) {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            };
            game.territories.insert(row.territory_id.clone(), row.clone());
            kind
        };
        self.broadcast(game_id, Table::Territories, kind, &row);
        true
    }

    /// Remove a territory, broadcasting a delete carrying the full last
    /// row. Returns whether it was present.
    pub fn remove_territory(&self, game_id: &str, territory_id: &str) -> bool {
        let removed = {
            let mut games = self.games.lock().unwrap();
            games
                .get_mut(game_id)
                .and_then(|game| game.territories.remove(territory_id))
        };
        match removed {
            Some(row) => {
                self.broadcast(game_id, Table::Territories, ChangeKind::Delete, &row);
                true
            }
            None => false,
        }
    }

    /// The write interface: store a new order, enforcing the phase gate
    /// and the per-player action-point cap.
    pub fn create_order(&self, new: NewOrder) -> Result<Order, OrderRejection> {
        let order = {
            let mut games = self.games.lock().unwrap();
            let game = games.get_mut(&new.game_id).ok_or(OrderRejection::UnknownGame)?;
            if game.phase != TurnPhase::Orders {
                return Err(OrderRejection::PhaseClosed);
            }
            let spent: u32 = game
                .orders
                .iter()
                .filter(|order| order.player_id == new.player_id)
                .map(|order| order.cost_ap)
                .sum();
            if spent + new.cost_ap > game.ap_cap {
                return Err(OrderRejection::BudgetExhausted);
            }
            store_order(game, new)
        };
        self.broadcast(&order.game_id, Table::Orders, ChangeKind::Insert, &order);
        Ok(order)
    }

    /// Test handle: store an order without the phase and budget gates,
    /// broadcasting its insert. `None` when the game is unknown.
    pub fn insert_order(&self, new: NewOrder) -> Option<Order> {
        let order = {
            let mut games = self.games.lock().unwrap();
            let game = games.get_mut(&new.game_id)?;
            store_order(game, new)
        };
        self.broadcast(&order.game_id, Table::Orders, ChangeKind::Insert, &order);
        Some(order)
    }

    /// Test handle: rebroadcast an existing order's insert frame, for
    /// exercising duplicate delivery in clients. Returns whether the
    /// order exists.
    pub fn redeliver_order(&self, game_id: &str, order_id: &str) -> bool {
        let order = {
            let games = self.games.lock().unwrap();
            games.get(game_id).and_then(|game| {
                game.orders
                    .iter()
                    .find(|order| order.id == order_id)
                    .cloned()
            })
        };
        match order {
            Some(order) => {
                self.broadcast(game_id, Table::Orders, ChangeKind::Insert, &order);
                true
            }
            None => false,
        }
    }

    /// The `lock_orders` remote procedure: end the orders phase.
    pub fn lock_orders(&self, game_id: &str) -> Result<(), LockRejection> {
        let mut games = self.games.lock().unwrap();
        let game = games.get_mut(game_id).ok_or(LockRejection::UnknownGame)?;
        if game.phase != TurnPhase::Orders {
            return Err(LockRejection::AlreadyLocked);
        }
        game.phase = TurnPhase::Locked;
        debug!(game_id, "orders locked");
        Ok(())
    }
}

fn store_order(game: &mut GameWorld, new: NewOrder) -> Order {
    let order = Order {
        id: Uuid::new_v4().to_string(),
        game_id: new.game_id,
        player_id: new.player_id,
        kind: new.kind,
        payload: new.payload,
        cost_ap: new.cost_ap,
        created_at: now_millis(),
        executed_at: None,
    };
    game.orders.push(order.clone());
    order
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
