use crate::{events::Stream, Error, Result};
use serde::de::DeserializeOwned;
use terrapulse_types::{Change, GameStatusRow, NewOrder, Order, Table, TerritoryRow};
use tokio_tungstenite::connect_async;
use tracing::debug;
use url::Url;

/// HTTP + WebSocket client for the remote authority.
#[derive(Clone)]
pub struct Client {
    http_client: reqwest::Client,
    pub base_url: Url,
}

impl Client {
    /// Create a client rooted at an http(s) base URL. The WebSocket
    /// scheme is derived from the HTTP scheme at connect time.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        Ok(Self {
            http_client: reqwest::Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// GET a JSON resource; `404` means the resource is absent, which the
    /// callers of this interface tolerate rather than treat as failure.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::FailedWithBody { status, body });
        }
        Ok(Some(response.json().await?))
    }

    /// Turn-level status for a game, or `None` when the game is unknown.
    pub async fn game_status(&self, game_id: &str) -> Result<Option<GameStatusRow>> {
        let url = self.endpoint(&format!("games/{game_id}"))?;
        self.get_json(url).await
    }

    /// All territory rows for a game. An unknown game yields an empty set.
    pub async fn list_territories(&self, game_id: &str) -> Result<Vec<TerritoryRow>> {
        let url = self.endpoint(&format!("games/{game_id}/territories"))?;
        Ok(self.get_json(url).await?.unwrap_or_default())
    }

    /// This player's orders for a game, ordered by `created_at` ascending
    /// as the authority serves them. An unknown game yields an empty set.
    pub async fn list_orders(&self, game_id: &str, player_id: &str) -> Result<Vec<Order>> {
        let mut url = self.endpoint(&format!("games/{game_id}/orders"))?;
        url.query_pairs_mut().append_pair("player_id", player_id);
        Ok(self.get_json(url).await?.unwrap_or_default())
    }

    /// Ask the authority to store a new order. On success the stored row
    /// is returned, including the server-assigned `id` and `created_at`.
    pub async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        let url = self.endpoint("orders")?;
        let response = self.http_client.post(url).json(order).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::FailedWithBody { status, body });
        }
        Ok(response.json().await?)
    }

    /// Issue the `lock_orders` remote procedure for a game.
    pub async fn lock_orders(&self, game_id: &str) -> Result<()> {
        let url = self.endpoint("rpc/lock_orders")?;
        let response = self
            .http_client
            .post(url)
            .json(&serde_json::json!({ "game_id": game_id }))
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::FailedWithBody { status, body });
        }
        Ok(())
    }

    fn changes_url(&self, table: Table, game_id: &str, player_id: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(&format!("changes/{table}"))?;
        let ws_scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(url.scheme().to_string()))?;
        url.query_pairs_mut().append_pair("game_id", game_id);
        if let Some(player_id) = player_id {
            // Advisory: the server may deliver coarser than one player,
            // so consumers must still filter by player_id.
            url.query_pairs_mut().append_pair("player_id", player_id);
        }
        Ok(url)
    }

    /// Open the change feed for one table, scoped to a game. Frames are
    /// decoded into typed [`Change`] values at the connection boundary.
    pub async fn connect_changes<R>(
        &self,
        table: Table,
        game_id: &str,
        player_id: Option<&str>,
    ) -> Result<Stream<Change<R>>>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        let url = self.changes_url(table, game_id, player_id)?;
        debug!(%url, "connecting change feed");
        let (ws, _) = connect_async(url.as_str()).await?;
        Ok(Stream::new(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        let result = Client::new("ftp://example.com");
        assert!(result.is_err());
        if let Err(err) = result {
            assert!(matches!(err, Error::InvalidScheme(_)));
            assert_eq!(
                err.to_string(),
                "invalid URL scheme: ftp (expected http or https)"
            );
        }

        assert!(Client::new("http://localhost:8080").is_ok());
        assert!(Client::new("https://localhost:8080").is_ok());
    }

    #[test]
    fn changes_url_uses_ws_scheme_and_filters() {
        let client = Client::new("http://127.0.0.1:4000").unwrap();
        let url = client
            .changes_url(Table::Orders, "G1", Some("P1"))
            .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/changes/orders");
        assert_eq!(url.query(), Some("game_id=G1&player_id=P1"));
    }
}
