pub mod client;
pub mod events;
pub mod orders;
pub mod session;
pub mod store;
pub mod turn;

pub use client::Client;
pub use events::Stream;
pub use orders::{validate, OrderDraft, OrderService, SubmitError, ORDER_COST_AP};
pub use session::{Session, SessionState, SyncError};
pub use store::{GameSnapshot, GameStore};
pub use turn::{lock_orders, LockError};

use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed: {status}: {body}")]
    FailedWithBody {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::ws::{Message as WsMessage, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use terrapulse_simulator::{Api, Simulator, SimulatorConfig};
    use terrapulse_types::{
        Change, ChangeKind, NewOrder, OrderKind, OrderPayload, Table, TerritoryRow, TurnPhase,
    };
    use tokio::time::{sleep, timeout, Duration};

    struct TestContext {
        simulator: Arc<Simulator>,
        base_url: String,
        server_handle: tokio::task::JoinHandle<()>,
    }

    impl TestContext {
        async fn new() -> Self {
            Self::with_config(SimulatorConfig::default()).await
        }

        async fn with_config(config: SimulatorConfig) -> Self {
            let simulator = Arc::new(Simulator::new(config));
            let api = Api::new(simulator.clone());
            let router = api.router();

            // Start server on random port
            let addr = SocketAddr::from(([127, 0, 0, 1], 0));
            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            let actual_addr = listener.local_addr().unwrap();
            let base_url = format!("http://{actual_addr}");

            let server_handle = tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });

            // Give server time to start
            sleep(Duration::from_millis(50)).await;

            Self {
                simulator,
                base_url,
                server_handle,
            }
        }

        fn client(&self) -> Client {
            Client::new(&self.base_url).unwrap()
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            self.server_handle.abort();
        }
    }

    fn territory_row(id: &str, name: &str, owner: Option<&str>, armies: u32) -> TerritoryRow {
        TerritoryRow {
            territory_id: id.to_string(),
            territory_name: name.to_string(),
            owner_name: owner.map(str::to_string),
            armies,
        }
    }

    fn new_order(game_id: &str, player_id: &str, to: &str) -> NewOrder {
        NewOrder {
            game_id: game_id.to_string(),
            player_id: player_id.to_string(),
            kind: OrderKind::Reinforce,
            payload: OrderPayload {
                from: None,
                to: to.to_string(),
            },
            cost_ap: 1,
        }
    }

    async fn wait_for_state(session: &Session, target: SessionState) {
        let mut rx = session.state();
        timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target))
            .await
            .expect("timed out waiting for session state")
            .expect("session state channel closed");
    }

    async fn wait_for_store(store: &GameStore, predicate: impl Fn(&GameSnapshot) -> bool) {
        let mut rx = store.changes();
        timeout(Duration::from_secs(5), async {
            loop {
                if predicate(&store.snapshot()) {
                    return;
                }
                rx.changed().await.expect("store revision channel closed");
            }
        })
        .await
        .expect("timed out waiting for store condition");
    }

    #[tokio::test]
    async fn initial_load_then_world_event() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);
        ctx.simulator
            .put_territory("G1", territory_row("T1", "Alpha", None, 3));

        let session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;

        let snapshot = session.store().snapshot();
        let t1 = &snapshot.territories["T1"];
        assert_eq!(t1.name, "Alpha");
        assert_eq!(t1.owner, None);
        assert_eq!(t1.armies, 3);
        assert_eq!(snapshot.budget.cap, 10);
        assert_eq!(snapshot.phase, TurnPhase::Orders);

        // A world event updates the territory in place.
        ctx.simulator
            .put_territory("G1", territory_row("T1", "Alpha", Some("P9"), 5));
        let store = session.store();
        wait_for_store(&store, |snapshot| {
            snapshot.territories["T1"].owner.as_deref() == Some("P9")
        })
        .await;

        let t1 = &store.snapshot().territories["T1"];
        assert_eq!(t1.name, "Alpha");
        assert_eq!(t1.armies, 5);
    }

    #[tokio::test]
    async fn territory_delete_events_remove() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);
        ctx.simulator
            .put_territory("G1", territory_row("T1", "Alpha", None, 3));
        ctx.simulator
            .put_territory("G1", territory_row("T2", "Bravo", None, 2));

        let session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;

        ctx.simulator.remove_territory("G1", "T2");
        let store = session.store();
        wait_for_store(&store, |snapshot| !snapshot.territories.contains_key("T2")).await;
        assert!(store.snapshot().territories.contains_key("T1"));
    }

    #[tokio::test]
    async fn redelivered_order_insert_is_a_no_op() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);

        let session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;

        let service = OrderService::new(ctx.client(), session.store(), "G1", "P1");
        let order = service.submit(OrderKind::Reinforce, "", "T1").await.unwrap();

        // The accepted order is in the store before any realtime delivery.
        let snapshot = session.store().snapshot();
        assert_eq!(snapshot.orders.len(), 1);
        assert_eq!(snapshot.budget.spent, 1);

        // Redeliver the same insert, then a second order as a marker; the
        // feed is ordered per connection, so once the marker lands the
        // redelivery has been applied.
        assert!(ctx.simulator.redeliver_order("G1", &order.id));
        let marker = ctx
            .simulator
            .insert_order(new_order("G1", "P1", "T2"))
            .unwrap();

        let store = session.store();
        wait_for_store(&store, |snapshot| {
            snapshot.orders.iter().any(|o| o.id == marker.id)
        })
        .await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.orders.len(), 2);
        assert_eq!(
            snapshot
                .orders
                .iter()
                .filter(|o| o.id == order.id)
                .count(),
            1
        );
        assert_eq!(snapshot.budget.spent, 2);
    }

    #[tokio::test]
    async fn own_order_feed_filters_other_players() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);

        let session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;

        // The simulator's order feed is scoped to the game, not the
        // player, so the P2 insert reaches the client and must be
        // filtered there.
        let foreign = ctx
            .simulator
            .insert_order(new_order("G1", "P2", "T1"))
            .unwrap();
        let own = ctx
            .simulator
            .insert_order(new_order("G1", "P1", "T2"))
            .unwrap();

        let store = session.store();
        wait_for_store(&store, |snapshot| {
            snapshot.orders.iter().any(|o| o.id == own.id)
        })
        .await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.orders.len(), 1);
        assert!(snapshot.orders.iter().all(|o| o.id != foreign.id));
    }

    #[tokio::test]
    async fn sessions_are_isolated_across_switches() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);
        ctx.simulator
            .put_territory("G1", territory_row("T1", "Alpha", None, 3));
        ctx.simulator.create_game("G2", 10);
        ctx.simulator
            .put_territory("G2", territory_row("T9", "Zulu", Some("P2"), 7));

        let first = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&first, SessionState::Live).await;
        let service = OrderService::new(ctx.client(), first.store(), "G1", "P1");
        service.submit(OrderKind::Reinforce, "", "T1").await.unwrap();
        first.close();

        let second = Session::open(ctx.client(), "G2", "P2");
        wait_for_state(&second, SessionState::Live).await;

        let snapshot = second.store().snapshot();
        assert_eq!(snapshot.territories.len(), 1);
        assert!(snapshot.territories.contains_key("T9"));
        assert!(snapshot.orders.is_empty());
    }

    #[tokio::test]
    async fn unknown_game_goes_live_with_empty_snapshot() {
        let ctx = TestContext::new().await;

        let mut session = Session::open(ctx.client(), "GHOST", "P1");
        wait_for_state(&session, SessionState::Live).await;

        let snapshot = session.store().snapshot();
        assert!(snapshot.territories.is_empty());
        assert!(snapshot.orders.is_empty());
        assert_eq!(snapshot.budget.cap, 0);
        assert!(session.try_error().is_none());
    }

    #[tokio::test]
    async fn failed_fetches_are_reported_but_tolerated() {
        let ctx = TestContext::with_config(SimulatorConfig {
            fail_queries: true,
            ..SimulatorConfig::default()
        })
        .await;
        ctx.simulator.create_game("G1", 10);

        let mut session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;

        let snapshot = session.store().snapshot();
        assert!(snapshot.territories.is_empty());
        assert!(snapshot.orders.is_empty());

        // Status, territories, and orders all failed.
        let mut fetch_errors = 0;
        while let Some(err) = session.try_error() {
            assert!(matches!(err, SyncError::Fetch { .. }));
            fetch_errors += 1;
        }
        assert_eq!(fetch_errors, 3);
    }

    #[tokio::test]
    async fn refused_subscription_stays_loading() {
        let ctx = TestContext::with_config(SimulatorConfig {
            refuse_changes: true,
            ..SimulatorConfig::default()
        })
        .await;
        ctx.simulator.create_game("G1", 10);

        let mut session = Session::open(ctx.client(), "G1", "P1");
        let err = timeout(Duration::from_secs(5), session.next_error())
            .await
            .expect("timed out waiting for subscribe error")
            .expect("error channel closed early");
        assert!(matches!(err, SyncError::Subscribe { .. }));

        // The engine must not claim Live.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*session.state().borrow(), SessionState::Loading);
    }

    #[tokio::test]
    async fn locking_twice_reports_already_locked() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);
        let client = ctx.client();

        lock_orders(&client, "G1").await.unwrap();
        let err = lock_orders(&client, "G1").await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked));

        // Submissions after the lock are rejected and leave the store
        // unchanged.
        let store = GameStore::new();
        let service = OrderService::new(client.clone(), store.clone(), "G1", "P1");
        let err = service
            .submit(OrderKind::Reinforce, "", "T1")
            .await
            .unwrap_err();
        let SubmitError::Rejected { status, .. } = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(status, reqwest::StatusCode::CONFLICT);
        assert!(store.snapshot().orders.is_empty());
    }

    #[tokio::test]
    async fn lock_on_unknown_game_is_rejected() {
        let ctx = TestContext::new().await;
        let err = lock_orders(&ctx.client(), "GHOST").await.unwrap_err();
        let LockError::Rejected { status, .. } = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exhausted_budget_rejects_submission() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 2);

        let session = Session::open(ctx.client(), "G1", "P1");
        wait_for_state(&session, SessionState::Live).await;
        let service = OrderService::new(ctx.client(), session.store(), "G1", "P1");

        service.submit(OrderKind::Reinforce, "", "T1").await.unwrap();
        service.submit(OrderKind::Reinforce, "", "T2").await.unwrap();
        let err = service
            .submit(OrderKind::Reinforce, "", "T3")
            .await
            .unwrap_err();
        let SubmitError::Rejected { status, .. } = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(status, reqwest::StatusCode::UNPROCESSABLE_ENTITY);

        let snapshot = session.store().snapshot();
        assert_eq!(snapshot.orders.len(), 2);
        assert_eq!(snapshot.budget.spent, 2);
        assert_eq!(snapshot.budget.remaining(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_never_contacts_the_authority() {
        // Port 1 is unroutable; a network attempt would surface as a
        // transport error, not InvalidPayload.
        let client = Client::new("http://127.0.0.1:1").unwrap();
        let store = GameStore::new();
        let service = OrderService::new(client, store.clone(), "G1", "P1");

        let err = service
            .submit(OrderKind::Attack, "", "T2")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidPayload { .. }));
        assert!(store.snapshot().orders.is_empty());
    }

    #[tokio::test]
    async fn draft_is_cleared_on_success_and_on_failure() {
        let ctx = TestContext::new().await;
        ctx.simulator.create_game("G1", 10);
        let service = OrderService::new(ctx.client(), GameStore::new(), "G1", "P1");

        let mut draft = OrderDraft::new(OrderKind::Reinforce);
        draft.to = "T1".to_string();
        service.submit_draft(&mut draft).await.unwrap();
        assert!(draft.to.is_empty());

        let mut draft = OrderDraft::new(OrderKind::Attack);
        draft.to = "T2".to_string();
        let err = service.submit_draft(&mut draft).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidPayload { .. }));
        assert!(draft.to.is_empty());
    }

    async fn serve_router(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();
        let base_url = format!("http://{actual_addr}");

        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        sleep(Duration::from_millis(50)).await;
        (base_url, handle)
    }

    #[tokio::test]
    async fn malformed_change_frames_are_dropped() {
        async fn noisy_changes(ws: WebSocketUpgrade) -> impl IntoResponse {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(WsMessage::Text("not json at all".to_string()))
                    .await;
                let frame = serde_json::to_string(&Change {
                    table: Table::Territories,
                    kind: ChangeKind::Insert,
                    row: TerritoryRow {
                        territory_id: "T1".to_string(),
                        territory_name: "Alpha".to_string(),
                        owner_name: None,
                        armies: 3,
                    },
                })
                .unwrap();
                let _ = socket.send(WsMessage::Text(frame)).await;
                sleep(Duration::from_millis(200)).await;
            })
        }

        let router = Router::new().route("/changes/:table", get(noisy_changes));
        let (base_url, handle) = serve_router(router).await;

        let client = Client::new(&base_url).unwrap();
        let mut stream = client
            .connect_changes::<TerritoryRow>(Table::Territories, "G1", None)
            .await
            .unwrap();

        // The garbage frame is dropped; the first delivery is the valid one.
        let change = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended early")
            .expect("expected a decoded frame");
        assert_eq!(change.row.territory_id, "T1");

        handle.abort();
    }
}
