use crate::{ChangeFrame, LockRejection, OrderRejection, Simulator};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use terrapulse_types::{NewOrder, Table};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/games/:game_id", get(game_status))
            .route("/games/:game_id/territories", get(list_territories))
            .route("/games/:game_id/orders", get(list_orders))
            .route("/orders", post(create_order))
            .route("/rpc/lock_orders", post(lock_orders))
            .route("/changes/:table", get(changes_ws))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.simulator.clone())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

fn query_failure(simulator: &Simulator) -> Option<Response> {
    simulator
        .config
        .fail_queries
        .then(|| (StatusCode::INTERNAL_SERVER_ERROR, "queries disabled").into_response())
}

async fn game_status(
    State(simulator): State<Arc<Simulator>>,
    Path(game_id): Path<String>,
) -> Response {
    if let Some(response) = query_failure(&simulator) {
        return response;
    }
    match simulator.game_status(&game_id) {
        Some(row) => Json(row).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown game").into_response(),
    }
}

async fn list_territories(
    State(simulator): State<Arc<Simulator>>,
    Path(game_id): Path<String>,
) -> Response {
    if let Some(response) = query_failure(&simulator) {
        return response;
    }
    match simulator.territories(&game_id) {
        Some(rows) => Json(rows).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown game").into_response(),
    }
}

#[derive(Deserialize)]
struct OrdersQuery {
    player_id: String,
}

async fn list_orders(
    State(simulator): State<Arc<Simulator>>,
    Path(game_id): Path<String>,
    Query(query): Query<OrdersQuery>,
) -> Response {
    if let Some(response) = query_failure(&simulator) {
        return response;
    }
    match simulator.orders(&game_id, &query.player_id) {
        Some(rows) => Json(rows).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown game").into_response(),
    }
}

async fn create_order(
    State(simulator): State<Arc<Simulator>>,
    Json(new): Json<NewOrder>,
) -> Response {
    match simulator.create_order(new) {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(OrderRejection::UnknownGame) => {
            (StatusCode::NOT_FOUND, "unknown game").into_response()
        }
        Err(OrderRejection::PhaseClosed) => {
            (StatusCode::CONFLICT, "orders are locked").into_response()
        }
        Err(OrderRejection::BudgetExhausted) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "action points exhausted").into_response()
        }
    }
}

#[derive(Deserialize)]
struct LockRequest {
    game_id: String,
}

async fn lock_orders(
    State(simulator): State<Arc<Simulator>>,
    Json(request): Json<LockRequest>,
) -> Response {
    match simulator.lock_orders(&request.game_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(LockRejection::UnknownGame) => {
            (StatusCode::NOT_FOUND, "unknown game").into_response()
        }
        Err(LockRejection::AlreadyLocked) => {
            (StatusCode::CONFLICT, "turn already locked").into_response()
        }
    }
}

/// The `player_id` query parameter clients send on the orders feed is
/// advisory and deliberately ignored: the feed is scoped per game, which
/// is coarser than one player, and clients re-filter on their side.
#[derive(Deserialize)]
struct ChangesQuery {
    game_id: String,
}

async fn changes_ws(
    State(simulator): State<Arc<Simulator>>,
    Path(table): Path<String>,
    Query(query): Query<ChangesQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if simulator.config.refuse_changes {
        return (StatusCode::SERVICE_UNAVAILABLE, "change feed disabled").into_response();
    }
    let Ok(table) = table.parse::<Table>() else {
        return (StatusCode::NOT_FOUND, "unknown table").into_response();
    };
    let receiver = simulator.subscribe_changes();
    ws.on_upgrade(move |socket| stream_changes(socket, receiver, table, query.game_id))
}

async fn stream_changes(
    mut socket: WebSocket,
    mut receiver: broadcast::Receiver<ChangeFrame>,
    table: Table,
    game_id: String,
) {
    debug!(%game_id, %table, "change subscriber connected");
    loop {
        match receiver.recv().await {
            Ok(frame) => {
                if frame.table != table || frame.game_id != game_id {
                    continue;
                }
                if socket.send(Message::Text(frame.json)).await.is_err() {
                    debug!(%game_id, %table, "change subscriber disconnected");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%game_id, %table, skipped, "change subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
