//! Event-channel transports: trait seam and the WebSocket implementation.

use crate::events::EventFrame;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Inbound signal from a transport: a decoded frame or a connection loss.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Frame(EventFrame),
    Closed,
}

/// Transport seam for the event-channel client.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Establish the connection. Inbound frames flow to the signal sender
    /// given at construction until the connection drops.
    async fn open(&self) -> Result<(), String>;
    /// Send one frame. Fails when the connection is down.
    async fn send(&self, frame: &EventFrame) -> Result<(), String>;
    /// Tear the connection down.
    async fn close(&self);
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket transport: JSON text frames over tokio-tungstenite.
pub struct WsTransport {
    url: String,
    signal_tx: mpsc::Sender<ChannelSignal>,
    writer: Arc<Mutex<Option<WsSink>>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, signal_tx: mpsc::Sender<ChannelSignal>) -> Self {
        Self {
            url: url.into(),
            signal_tx,
            writer: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn open(&self) -> Result<(), String> {
        let (ws, _) = connect_async(&self.url).await.map_err(|e| e.to_string())?;
        let (sink, mut stream) = ws.split();
        *self.writer.lock().await = Some(sink);

        let signal_tx = self.signal_tx.clone();
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<EventFrame>(&text) {
                        Ok(frame) => {
                            if signal_tx.send(ChannelSignal::Frame(frame)).await.is_err() {
                                log::debug!("event channel: signal receiver dropped, stopping");
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("event channel: undecodable frame, skipping: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("event channel: read error: {}", e);
                        break;
                    }
                }
            }
            writer.lock().await.take();
            let _ = signal_tx.send(ChannelSignal::Closed).await;
        });
        Ok(())
    }

    async fn send(&self, frame: &EventFrame) -> Result<(), String> {
        let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
        let mut g = self.writer.lock().await;
        let sink = g.as_mut().ok_or("not connected")?;
        if let Err(e) = sink.send(Message::Text(text)).await {
            g.take();
            return Err(e.to_string());
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}
