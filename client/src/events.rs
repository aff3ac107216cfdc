use crate::{Error, Result};
use futures_util::{Stream as FutStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Stream of typed frames from a WebSocket connection.
///
/// Frames are decoded at this boundary; a frame that fails to decode is
/// logged and dropped so untyped data never reaches consumers. A closed
/// or failed connection is forwarded once as `Err`, after which the
/// stream ends.
pub struct Stream<T: DeserializeOwned + Send + Sync + 'static> {
    receiver: mpsc::Receiver<Result<T>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> Drop for Stream<T> {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> Stream<T> {
    fn spawn_reader<S>(
        ws: WebSocketStream<S>,
        tx: mpsc::Sender<Result<T>>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ws = ws;
            let message_type = std::any::type_name::<T>();
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(data)) => {
                        trace!(message_type, len = data.len(), "received websocket frame");
                        match serde_json::from_str::<T>(&data) {
                            Ok(event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    break; // Receiver dropped
                                }
                            }
                            Err(e) => {
                                // Fail closed: drop the frame rather than
                                // forwarding undecodable data.
                                warn!(
                                    message_type,
                                    len = data.len(),
                                    error = %e,
                                    "dropping undecodable websocket frame"
                                );
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed");
                        let _ = tx.send(Err(Error::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => {} // Ignore other message types
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        })
    }

    pub(crate) fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let handle = Self::spawn_reader(ws, tx);
        Self {
            receiver: rx,
            _handle: handle,
        }
    }

    /// Receive the next frame from the stream.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> FutStream for Stream<T> {
    type Item = Result<T>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
