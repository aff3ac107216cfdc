pub mod api;
pub mod game;

pub use api::{Change, ChangeKind, GameStatusRow, NewOrder, Table, TerritoryRow};
pub use game::{ActionPoints, Order, OrderKind, OrderPayload, Territory, TurnPhase};
