/// WebSocket channel
///
/// Frames are JSON text: `{"event": "<name>", "data": {...}}`.
///   in:  receivedMessage  (message payload)
///   in:  error            {"message": "..."}
///   out: sendMessage      {"recipient_id": "...", "body": "..."}
///
/// This is plain WebSocket with a JSON envelope, not socket.io. A backend that
/// only speaks socket.io (token in the handshake `auth` payload) needs a
/// compatible shim in front of it that maps these frames to its events.
use crate::auth::Credential;
use crate::channel::{Channel, ChannelEvent, Connector};
use crate::error::{ChatError, Result};
use crate::types::{Message, OutgoingMessage, RawMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundFrame {
    ReceivedMessage(RawMessage),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundFrame<'a> {
    SendMessage(&'a OutgoingMessage),
}

enum Outbound {
    Text(String),
    Close,
}

/// Map one text frame to a channel event. Malformed frames are logged and dropped.
pub fn decode_frame(text: &str) -> Option<ChannelEvent> {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("Dropping unrecognised frame: {}", e);
            return None;
        }
    };
    match frame {
        InboundFrame::ReceivedMessage(raw) => match Message::try_from(raw) {
            Ok(msg) => Some(ChannelEvent::MessageReceived(msg)),
            Err(e) => {
                warn!("Dropping malformed message event: {}", e);
                None
            }
        },
        InboundFrame::Error { message } => Some(ChannelEvent::Error(message)),
    }
}

pub fn encode_send(message: &OutgoingMessage) -> Result<String> {
    serde_json::to_string(&OutboundFrame::SendMessage(message)).map_err(ChatError::Serialization)
}

pub struct WsChannel {
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ChannelEvent>,
    // Holds everything since connect until the first subscriber takes it
    first_rx: Mutex<Option<broadcast::Receiver<ChannelEvent>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsChannel {
    /// Open a connection, sending the credential in the handshake
    pub async fn connect(url: &str, credential: &Credential) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ChatError::Connection(format!("invalid socket URL {}: {}", url, e)))?;
        let mut bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| ChatError::Connection("credential is not a valid header value".to_string()))?;
        bearer.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| ChatError::Connection(format!("{}: {}", url, e)))?;
        info!("Chat channel connected to {}", url);

        let (mut sink, mut source) = stream.split();
        let (events, first_rx) = broadcast::channel(EVENT_BUFFER);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let connected = Arc::new(AtomicBool::new(true));
        let _ = events.send(ChannelEvent::Connected);

        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let result = match item {
                    Outbound::Text(text) => sink.send(WsMessage::text(text)).await,
                    Outbound::Close => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    error!("Chat channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let events = events.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if let Some(event) = decode_frame(text.as_str()) {
                                let _ = events.send(event);
                            }
                        }
                        Ok(WsMessage::Close(_)) => {
                            debug!("Server closed the chat channel");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = events.send(ChannelEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                info!("Chat channel disconnected");
                let _ = events.send(ChannelEvent::Disconnected);
            })
        };

        Ok(Self {
            connected,
            events,
            first_rx: Mutex::new(Some(first_rx)),
            outbound,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        let first = self
            .first_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        first.unwrap_or_else(|| self.events.subscribe())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let text = encode_send(&message)?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| ChatError::NotConnected)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Closing chat channel");
        }
        let _ = self.outbound.send(Outbound::Close);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            // Let the writer flush the close frame; the reader stops with it
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                debug!("Chat channel task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Connector for `ws://` endpoints
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, credential: &Credential) -> Result<Arc<dyn Channel>> {
        let channel = WsChannel::connect(url, credential).await?;
        Ok(Arc::new(channel))
    }
}
