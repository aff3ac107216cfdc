use crate::{client::Client, events::Stream, store::GameStore, Error};
use std::sync::Arc;
use std::time::Duration;
use terrapulse_types::{Change, ChangeKind, Order, Table, Territory, TerritoryRow};
use thiserror::Error as ThisError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// How long to wait before re-establishing a dropped subscription.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of one synchronization session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Live,
    Closed,
}

/// Non-fatal synchronization failures, surfaced to a supervising
/// collaborator on the session's error channel.
#[derive(Debug, ThisError)]
pub enum SyncError {
    #[error("failed to fetch {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: Error,
    },
    #[error("failed to subscribe to {what}: {source}")]
    Subscribe {
        what: &'static str,
        #[source]
        source: Error,
    },
}

/// One `(game_id, player_id)` synchronization session.
///
/// Opening a session performs the initial bulk load and then applies the
/// two change feeds (world events, own-order inserts) to a session-owned
/// [`GameStore`]. The store is created per session, so a stale fetch from
/// a previous session can never write into a newer session's snapshot.
pub struct Session {
    store: GameStore,
    state: Arc<watch::Sender<SessionState>>,
    errors: mpsc::UnboundedReceiver<SyncError>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Open a session. If either id is empty the session stays `Idle`
    /// and performs no I/O.
    pub fn open(client: Client, game_id: &str, player_id: &str) -> Self {
        let store = GameStore::new();
        let state = Arc::new(watch::channel(SessionState::Idle).0);
        let (error_tx, errors) = mpsc::unbounded_channel();
        if game_id.is_empty() || player_id.is_empty() {
            debug!("session ids empty; staying idle");
            return Self {
                store,
                state,
                errors,
                task: None,
            };
        }
        let task = tokio::spawn(run(
            client,
            game_id.to_string(),
            player_id.to_string(),
            store.clone(),
            state.clone(),
            error_tx,
        ));
        Self {
            store,
            state,
            errors,
            task: Some(task),
        }
    }

    /// Handle to the session-owned store. All reads go through this.
    pub fn store(&self) -> GameStore {
        self.store.clone()
    }

    /// Observe the session lifecycle.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drain one reported error without waiting, if any is pending.
    pub fn try_error(&mut self) -> Option<SyncError> {
        self.errors.try_recv().ok()
    }

    /// Wait for the next reported error. Returns `None` once the sync
    /// task has ended and all pending errors were drained.
    pub async fn next_error(&mut self) -> Option<SyncError> {
        self.errors.recv().await
    }

    /// Tear the session down, cancelling any in-flight fetch or
    /// subscription. Idempotent: closing an already-closed session is a
    /// no-op.
    pub fn close(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    client: Client,
    game_id: String,
    player_id: String,
    store: GameStore,
    state: Arc<watch::Sender<SessionState>>,
    errors: mpsc::UnboundedSender<SyncError>,
) {
    // `send_replace` updates the value even when no receiver is currently
    // subscribed, so late subscribers observe the correct state.
    state.send_replace(SessionState::Loading);

    // Initial bulk load. Each fetch is independently fallible: a failure
    // leaves that half of the snapshot empty instead of aborting the
    // session open.
    let (status, territories, orders) = tokio::join!(
        client.game_status(&game_id),
        client.list_territories(&game_id),
        client.list_orders(&game_id, &player_id),
    );
    match status {
        Ok(Some(row)) => {
            store.set_status(row.turn, row.phase);
            store.set_budget(0, row.ap_cap);
        }
        Ok(None) => warn!(%game_id, "game unknown during initial load"),
        Err(source) => {
            warn!(%game_id, error = %source, "failed to fetch game status");
            let _ = errors.send(SyncError::Fetch {
                what: "game status",
                source,
            });
        }
    }
    match territories {
        Ok(rows) => store.replace_territories(rows.into_iter().map(Territory::from).collect()),
        Err(source) => {
            warn!(%game_id, error = %source, "failed to fetch territories");
            let _ = errors.send(SyncError::Fetch {
                what: "territories",
                source,
            });
        }
    }
    match orders {
        Ok(rows) => store.replace_orders(rows),
        Err(source) => {
            warn!(%game_id, error = %source, "failed to fetch orders");
            let _ = errors.send(SyncError::Fetch {
                what: "orders",
                source,
            });
        }
    }

    // Open both change feeds before claiming Live. If either fails to
    // establish, the other is dropped and the session stays Loading so a
    // supervisor can close and reopen it.
    let (world, own) = tokio::join!(
        client.connect_changes::<TerritoryRow>(Table::Territories, &game_id, None),
        client.connect_changes::<Order>(Table::Orders, &game_id, Some(&player_id)),
    );
    let (mut world, mut own) = match (world, own) {
        (Ok(world), Ok(own)) => (world, own),
        (world, own) => {
            if let Err(source) = world {
                warn!(%game_id, error = %source, "failed to subscribe to territory changes");
                let _ = errors.send(SyncError::Subscribe {
                    what: "territory changes",
                    source,
                });
            }
            if let Err(source) = own {
                warn!(%game_id, error = %source, "failed to subscribe to order changes");
                let _ = errors.send(SyncError::Subscribe {
                    what: "order changes",
                    source,
                });
            }
            return;
        }
    };

    state.send_replace(SessionState::Live);
    info!(%game_id, %player_id, "session live");

    // Deliveries are applied in receipt order per feed; the two feeds
    // touch disjoint parts of the snapshot, so no cross-feed ordering is
    // needed. A dropped feed is re-established in place (missed events
    // are not replayed, so that half is re-fetched) and the session stays
    // Live throughout.
    loop {
        tokio::select! {
            delivery = world.next() => match delivery {
                Some(Ok(change)) => apply_world(&store, change),
                other => {
                    let source = match other {
                        Some(Err(source)) => source,
                        _ => Error::ConnectionClosed,
                    };
                    warn!(%game_id, error = %source, "territory feed dropped");
                    let _ = errors.send(SyncError::Subscribe {
                        what: "territory changes",
                        source,
                    });
                    world = recover_world(&client, &game_id, &store, &errors).await;
                }
            },
            delivery = own.next() => match delivery {
                Some(Ok(change)) => apply_own_order(&store, &player_id, change),
                other => {
                    let source = match other {
                        Some(Err(source)) => source,
                        _ => Error::ConnectionClosed,
                    };
                    warn!(%game_id, error = %source, "order feed dropped");
                    let _ = errors.send(SyncError::Subscribe {
                        what: "order changes",
                        source,
                    });
                    own = recover_orders(&client, &game_id, &player_id, &store, &errors).await;
                }
            },
        }
    }
}

fn apply_world(store: &GameStore, change: Change<TerritoryRow>) {
    match change.kind {
        // Inserts and updates both carry the full row; replacement by id
        // makes repeated deliveries converge.
        ChangeKind::Insert | ChangeKind::Update => store.upsert_territory(change.row.into()),
        ChangeKind::Delete => {
            store.remove_territory(&change.row.territory_id);
        }
    }
}

fn apply_own_order(store: &GameStore, player_id: &str, change: Change<Order>) {
    if change.kind != ChangeKind::Insert {
        trace!(kind = ?change.kind, "ignoring non-insert order change");
        return;
    }
    if change.row.player_id != player_id {
        // The server-side filter may be coarser than one player.
        trace!(order = %change.row.id, "ignoring order authored by another player");
        return;
    }
    store.append_order_if_absent(change.row);
}

async fn recover_world(
    client: &Client,
    game_id: &str,
    store: &GameStore,
    errors: &mpsc::UnboundedSender<SyncError>,
) -> Stream<Change<TerritoryRow>> {
    loop {
        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
        match client
            .connect_changes::<TerritoryRow>(Table::Territories, game_id, None)
            .await
        {
            Ok(stream) => {
                // Missed events are not replayed on reconnect.
                match client.list_territories(game_id).await {
                    Ok(rows) => {
                        store.replace_territories(
                            rows.into_iter().map(Territory::from).collect(),
                        );
                    }
                    Err(source) => {
                        warn!(game_id, error = %source, "failed to re-fetch territories");
                        let _ = errors.send(SyncError::Fetch {
                            what: "territories",
                            source,
                        });
                    }
                }
                info!(game_id, "territory feed re-established");
                return stream;
            }
            Err(source) => {
                warn!(game_id, error = %source, "failed to re-subscribe to territory changes");
                let _ = errors.send(SyncError::Subscribe {
                    what: "territory changes",
                    source,
                });
            }
        }
    }
}

async fn recover_orders(
    client: &Client,
    game_id: &str,
    player_id: &str,
    store: &GameStore,
    errors: &mpsc::UnboundedSender<SyncError>,
) -> Stream<Change<Order>> {
    loop {
        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
        match client
            .connect_changes::<Order>(Table::Orders, game_id, Some(player_id))
            .await
        {
            Ok(stream) => {
                match client.list_orders(game_id, player_id).await {
                    Ok(rows) => store.replace_orders(rows),
                    Err(source) => {
                        warn!(game_id, error = %source, "failed to re-fetch orders");
                        let _ = errors.send(SyncError::Fetch {
                            what: "orders",
                            source,
                        });
                    }
                }
                info!(game_id, "order feed re-established");
                return stream;
            }
            Err(source) => {
                warn!(game_id, error = %source, "failed to re-subscribe to order changes");
                let _ = errors.send(SyncError::Subscribe {
                    what: "order changes",
                    source,
                });
            }
        }
    }
}
