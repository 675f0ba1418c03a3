use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::souk::database::messages::Message;
use crate::types::MessageDomain;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Failed to connect to change feed: {0}")]
    Connect(String),

    #[error("Change feed protocol error: {0}")]
    Protocol(String),

    #[error("Change feed closed")]
    Closed,
}

/// What happened to a message row on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One change-feed frame: a message row was inserted or updated.
///
/// The payload row is optional; a thin frame carries only the id and
/// the subscriber fetches the row itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub domain: MessageDomain,
    pub message_id: Uuid,
    pub row: Option<Message>,
}

/// Subscription to the backend's message change feed.
///
/// Delivery is at least once: the same event may arrive more than once
/// and consumers must absorb replays. The returned channel closing
/// means the transport was lost and the consumer should reconnect.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, user_id: Uuid) -> Result<mpsc::Receiver<ChangeEvent>, FeedError>;
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    action: &'a str,
    user_id: Uuid,
}

/// Production feed over a websocket connection to the realtime gateway.
#[derive(Debug, Clone)]
pub struct WebsocketFeed {
    url: String,
}

impl WebsocketFeed {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ChangeFeed for WebsocketFeed {
    async fn subscribe(&self, user_id: Uuid) -> Result<mpsc::Receiver<ChangeEvent>, FeedError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let subscribe = serde_json::to_string(&SubscribeFrame {
            action: "subscribe",
            user_id,
        })
        .map_err(|e| FeedError::Protocol(e.to_string()))?;
        write
            .send(WsMessage::Text(subscribe))
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ChangeEvent>(&text) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    target: "souk::dispatcher::feed",
                                    "Dropping unparseable feed frame: {}",
                                    e
                                );
                            }
                        }
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            target: "souk::dispatcher::feed",
                            "Change feed read error: {}",
                            e
                        );
                        break;
                    }
                }
            }
            // Dropping tx closes the channel, which the dispatcher
            // treats as transport loss.
        });

        Ok(rx)
    }
}
