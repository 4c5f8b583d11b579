use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Lifecycle and payload events coming out of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Outbound half of a duplex text channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, frame: String) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Opens a transport. Inbound events are delivered on the returned receiver
/// and are not consumed until the caller starts polling it, so handlers can
/// be installed before the first message is processed.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError>;
}

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// Connects to the relay over a WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

struct WsTransport {
    out_tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(Message::Text(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.out_tx.send(Message::Close(None)).await;
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> {
        info!(url = %self.url, "Connecting to signaling server");
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let (ev_tx, ev_rx) = mpsc::channel(EVENT_BUFFER);

        // Handshake is complete at this point.
        let _ = ev_tx.send(TransportEvent::Open).await;

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "WebSocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer exiting");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(reason)) => {
                        debug!(?reason, "WebSocket close frame received");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = ev_tx.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                if ev_tx.send(event).await.is_err() {
                    break;
                }
            }
            let _ = ev_tx.send(TransportEvent::Closed).await;
            debug!("WebSocket reader exiting");
        });

        Ok((
            Arc::new(WsTransport {
                out_tx,
                closed: AtomicBool::new(false),
            }),
            ev_rx,
        ))
    }
}

/// In-process loopback transport. The [`memory::MemoryRelay`] half plays the
/// relay server: it sees every frame the client sends and injects events.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;

    pub struct MemoryConnector {
        parts: Mutex<Option<(mpsc::UnboundedSender<String>, EventReceiver)>>,
        events: mpsc::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    pub struct MemoryRelay {
        frames: mpsc::UnboundedReceiver<String>,
        events: mpsc::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    struct MemoryTransport {
        frames: mpsc::UnboundedSender<String>,
        events: mpsc::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    /// Creates a connected pair. The relay must call [`MemoryRelay::open`]
    /// before the client side considers the channel usable.
    pub fn channel() -> (MemoryConnector, MemoryRelay) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(EVENT_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemoryConnector {
                parts: Mutex::new(Some((frames_tx, ev_rx))),
                events: ev_tx.clone(),
                closed: closed.clone(),
            },
            MemoryRelay {
                frames: frames_rx,
                events: ev_tx,
                closed,
            },
        )
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> {
            let (frames, events) = self
                .parts
                .lock()
                .take()
                .ok_or_else(|| TransportError::Connect("memory channel already used".into()))?;
            let transport = MemoryTransport {
                frames,
                events: self.events.clone(),
                closed: self.closed.clone(),
            };
            Ok((Arc::new(transport), events))
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send_text(&self, frame: String) -> Result<(), TransportError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            self.frames.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                let _ = self.events.send(TransportEvent::Closed).await;
            }
        }
    }

    impl MemoryRelay {
        pub async fn open(&self) {
            let _ = self.events.send(TransportEvent::Open).await;
        }

        /// Delivers a raw text frame to the client.
        pub async fn send(&self, frame: impl Into<String>) {
            let _ = self.events.send(TransportEvent::Message(frame.into())).await;
        }

        pub async fn send_json(&self, frame: &Value) {
            self.send(frame.to_string()).await;
        }

        pub async fn fail(&self, reason: &str) {
            let _ = self.events.send(TransportEvent::Error(reason.to_string())).await;
        }

        /// Simulates the relay dropping the connection.
        pub async fn close(&self) {
            self.closed.store(true, Ordering::Release);
            let _ = self.events.send(TransportEvent::Closed).await;
        }

        /// Next frame the client sent, or `None` once the client side is gone.
        pub async fn recv(&mut self) -> Option<String> {
            self.frames.recv().await
        }

        pub async fn recv_json(&mut self) -> Option<Value> {
            let raw = self.recv().await?;
            serde_json::from_str(&raw).ok()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }
}
