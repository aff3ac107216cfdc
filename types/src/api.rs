use crate::game::{OrderKind, OrderPayload, Territory, TurnPhase};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Territory row as served by the remote authority's query interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerritoryRow {
    pub territory_id: String,
    pub territory_name: String,
    pub owner_name: Option<String>,
    pub armies: u32,
}

impl From<TerritoryRow> for Territory {
    fn from(row: TerritoryRow) -> Self {
        Territory {
            id: row.territory_id,
            name: row.territory_name,
            // A null owner is an unowned territory, never an error.
            owner: row.owner_name,
            armies: row.armies,
        }
    }
}

/// Turn-level game row as served by the remote authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStatusRow {
    pub game_id: String,
    pub turn: u32,
    pub phase: TurnPhase,
    pub ap_cap: u32,
}

/// Request body for creating an order. The authority assigns `id` and
/// `created_at` and echoes the stored row back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub game_id: String,
    pub player_id: String,
    pub kind: OrderKind,
    pub payload: OrderPayload,
    pub cost_ap: u32,
}

/// Tables the change feed can be scoped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Territories,
    Orders,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Territories => "territories",
            Table::Orders => "orders",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown table: {0}")]
pub struct UnknownTable(pub String);

impl FromStr for Table {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "territories" => Ok(Table::Territories),
            "orders" => Ok(Table::Orders),
            other => Err(UnknownTable(other.to_string())),
        }
    }
}

/// What happened to a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change-feed frame. Every frame carries the full row so repeated
/// or out-of-order deliveries converge by replacement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<R> {
    pub table: Table,
    pub kind: ChangeKind,
    pub row: R,
}
