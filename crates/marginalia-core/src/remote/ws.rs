//! WebSocket remote store
//!
//! Talks to the annotation sync server over WebSocket with CBOR framed
//! messages. Requests are one-shot: connect, send, await the reply, close.
//! Subscriptions hold a connection open in a background task.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{millis_to_datetime, record_from_wire, ClientMessage, ServerMessage};
use super::{
    Ack, ErrorCallback, Principal, RemoteError, RemoteRecord, RemoteStore, UpdateCallback,
};
use crate::models::DocumentKey;
use crate::subscription::{CancelHandle, CancelToken};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote store backed by the sync server
#[derive(Debug, Clone)]
pub struct WsRemoteStore {
    url: String,
    device_id: String,
    timeout: Duration,
}

impl WsRemoteStore {
    pub fn new(url: &str, device_id: &str) -> Self {
        Self {
            url: url.to_string(),
            device_id: device_id.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the sync server
    async fn connect(url: &str) -> Result<WsStream, RemoteError> {
        debug!("Connecting to {}", url);
        let (ws_stream, _response) = connect_async(url).await.map_err(|e| {
            RemoteError::Network(format!("failed to connect to sync server ({}): {}", url, e))
        })?;
        Ok(ws_stream)
    }

    /// Send one message and wait for the server's reply
    async fn request(&self, msg: ClientMessage) -> Result<ServerMessage, RemoteError> {
        let exchange = async {
            let mut ws = Self::connect(&self.url).await?;
            ws.send(Message::Binary(msg.encode()?))
                .await
                .map_err(|e| RemoteError::Network(format!("send failed: {}", e)))?;

            let reply = read_reply(&mut ws, &self.url).await;
            ws.close(None).await.ok();
            reply
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => Err(RemoteError::Network(format!(
                "timeout waiting for sync server response ({})",
                self.url
            ))),
        }
    }
}

/// Read frames until a server message arrives
async fn read_reply(ws: &mut WsStream, url: &str) -> Result<ServerMessage, RemoteError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                Ok(ServerMessage::Error { code, message }) => {
                    return Err(ServerMessage::error_for(&code, &message));
                }
                Ok(msg) => return Ok(msg),
                Err(e) => warn!("Failed to decode server message: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(RemoteError::Network(format!(
                    "sync server ({}) closed connection",
                    url
                )));
            }
            Some(Err(e)) => {
                return Err(RemoteError::Network(format!(
                    "sync connection error ({}): {}",
                    url, e
                )));
            }
            Some(Ok(_)) => {}
        }
    }
}

#[async_trait]
impl RemoteStore for WsRemoteStore {
    async fn authenticate(&self) -> Result<Principal, RemoteError> {
        match self
            .request(ClientMessage::authenticate(&self.device_id))
            .await?
        {
            ServerMessage::Authenticated {
                principal_id,
                token,
            } => {
                info!("Authenticated with sync server as {}", principal_id);
                Ok(Principal {
                    id: principal_id,
                    token,
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn push(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        record: &RemoteRecord,
    ) -> Result<Ack, RemoteError> {
        let msg = ClientMessage::push(&principal.id, &principal.token, key, record);
        match self.request(msg).await? {
            ServerMessage::Ack {
                last_updated,
                applied,
                ..
            } => {
                debug!("Push for {} acknowledged, applied={}", key, applied);
                Ok(Ack {
                    document_key: key.clone(),
                    last_updated: millis_to_datetime(last_updated)?,
                    applied,
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    fn subscribe_with_errors(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        on_update: UpdateCallback,
        on_error: ErrorCallback,
    ) -> CancelHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Cannot subscribe to {} outside a tokio runtime", key);
            on_error(RemoteError::Network("no async runtime".to_string()));
            return CancelHandle::noop();
        };

        let url = self.url.clone();
        let msg = ClientMessage::subscribe(&principal.id, &principal.token, key);
        let key = key.clone();

        // The task needs the token before the handle owning its abort exists
        let (token_tx, token_rx) = tokio::sync::oneshot::channel::<CancelToken>();
        let task = runtime.spawn(async move {
            let Ok(token) = token_rx.await else {
                return;
            };
            if let Err(e) = run_subscription(&url, msg, &key, &token, on_update).await {
                if !token.is_cancelled() {
                    warn!("Subscription to {} ended: {}", key, e);
                    on_error(e);
                }
            }
        });

        let abort = task.abort_handle();
        let handle = CancelHandle::new(move || abort.abort());
        let _ = token_tx.send(handle.token());
        handle
    }
}

async fn run_subscription(
    url: &str,
    msg: ClientMessage,
    key: &DocumentKey,
    token: &CancelToken,
    on_update: UpdateCallback,
) -> Result<(), RemoteError> {
    let mut ws = WsRemoteStore::connect(url).await?;
    ws.send(Message::Binary(msg.encode()?))
        .await
        .map_err(|e| RemoteError::Network(format!("send failed: {}", e)))?;

    while !token.is_cancelled() {
        match read_reply(&mut ws, url).await? {
            ServerMessage::Update {
                document_key,
                annotations,
                last_updated,
            } if document_key == key.as_str() => {
                let record = record_from_wire(annotations, last_updated)?;
                if !token.is_cancelled() {
                    on_update(record);
                }
            }
            other => debug!("Ignoring message on subscription to {}: {:?}", key, other),
        }
    }

    ws.close(None).await.ok();
    Ok(())
}

fn unexpected(msg: &ServerMessage) -> RemoteError {
    RemoteError::Rejected(format!("unexpected server message: {:?}", msg))
}
