use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use terrapulse_types::{ActionPoints, Order, Territory, TurnPhase};
use tokio::sync::watch;

/// The complete local materialized view of game state for one session.
#[derive(Clone, Debug, Default)]
pub struct GameSnapshot {
    pub territories: BTreeMap<String, Territory>,
    /// Kept sorted by `(created_at, id)` ascending.
    pub orders: Vec<Order>,
    pub budget: ActionPoints,
    pub phase: TurnPhase,
    pub turn: u32,
}

struct Inner {
    snapshot: Mutex<GameSnapshot>,
    revision: watch::Sender<u64>,
}

/// Owner of the [`GameSnapshot`] for one session.
///
/// All mutations are synchronous and total; each effective mutation bumps
/// a revision observable through [`GameStore::changes`]. Handles are cheap
/// to clone and share one snapshot.
#[derive(Clone)]
pub struct GameStore {
    inner: Arc<Inner>,
}

impl Default for GameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                snapshot: Mutex::new(GameSnapshot::default()),
                revision,
            }),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut GameSnapshot) -> (R, bool)) -> R {
        let mut snapshot = self.inner.snapshot.lock().unwrap();
        let (result, changed) = f(&mut snapshot);
        drop(snapshot);
        if changed {
            self.inner.revision.send_modify(|revision| *revision += 1);
        }
        result
    }

    /// Replace the whole territory set, keyed by id.
    pub fn replace_territories(&self, territories: Vec<Territory>) {
        self.mutate(|snapshot| {
            snapshot.territories = territories
                .into_iter()
                .map(|territory| (territory.id.clone(), territory))
                .collect();
            ((), true)
        });
    }

    /// Replace-by-id. Each world event carries the full territory record,
    /// so repeated or out-of-order deliveries converge by replacement.
    pub fn upsert_territory(&self, territory: Territory) {
        self.mutate(|snapshot| {
            let existing = snapshot.territories.get(&territory.id);
            if existing == Some(&territory) {
                return ((), false);
            }
            snapshot.territories.insert(territory.id.clone(), territory);
            ((), true)
        });
    }

    /// Remove a territory by id. Returns whether it was present.
    pub fn remove_territory(&self, territory_id: &str) -> bool {
        self.mutate(|snapshot| {
            let removed = snapshot.territories.remove(territory_id).is_some();
            (removed, removed)
        })
    }

    /// Replace the whole order list and recompute `spent` from it.
    pub fn replace_orders(&self, mut orders: Vec<Order>) {
        self.mutate(|snapshot| {
            orders.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            let spent: u32 = orders.iter().map(|order| order.cost_ap).sum();
            snapshot.orders = orders;
            snapshot.budget.spent = spent.min(snapshot.budget.cap);
            ((), true)
        });
    }

    /// Append an order unless one with the same id is already present.
    ///
    /// Idempotent by id: a duplicate is a no-op returning `false`, with
    /// the budget untouched. This is what makes duplicate realtime
    /// deliveries safe. An effective append charges the budget by the
    /// order's `cost_ap` and re-sorts by `(created_at, id)`.
    pub fn append_order_if_absent(&self, order: Order) -> bool {
        self.mutate(|snapshot| {
            if snapshot.orders.iter().any(|existing| existing.id == order.id) {
                return (false, false);
            }
            snapshot.budget.charge(order.cost_ap);
            snapshot.orders.push(order);
            snapshot
                .orders
                .sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            (true, true)
        })
    }

    /// Set the budget outright. `spent` is clamped to `cap`.
    pub fn set_budget(&self, spent: u32, cap: u32) {
        self.mutate(|snapshot| {
            snapshot.budget = ActionPoints::new(spent, cap);
            ((), true)
        });
    }

    /// Record the turn number and phase reported by the authority.
    pub fn set_status(&self, turn: u32, phase: TurnPhase) {
        self.mutate(|snapshot| {
            snapshot.turn = turn;
            snapshot.phase = phase;
            ((), true)
        });
    }

    /// Clone out the current snapshot.
    pub fn snapshot(&self) -> GameSnapshot {
        self.inner.snapshot.lock().unwrap().clone()
    }

    /// Observe mutations: the watched value is a revision counter bumped
    /// once per effective mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}
