//! In-process transport: frames land in a buffer instead of a socket.
//! Backs tests and standalone runs without a chat server.

use crate::channel::transport::{ChannelSignal, EventTransport};
use crate::events::EventFrame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Transport double: records sent frames, lets callers inject inbound frames
/// and simulate connection loss.
pub struct MemoryTransport {
    signal_tx: mpsc::Sender<ChannelSignal>,
    sent: Mutex<Vec<EventFrame>>,
    open_fails: AtomicBool,
    send_fails: AtomicBool,
}

impl MemoryTransport {
    pub fn new(signal_tx: mpsc::Sender<ChannelSignal>) -> Self {
        Self {
            signal_tx,
            sent: Mutex::new(Vec::new()),
            open_fails: AtomicBool::new(false),
            send_fails: AtomicBool::new(false),
        }
    }

    /// Frames sent so far, in order.
    pub async fn sent(&self) -> Vec<EventFrame> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_events(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|f| f.event.clone()).collect()
    }

    /// Deliver an inbound frame as if the server had pushed it.
    pub async fn inject(&self, frame: EventFrame) {
        let _ = self.signal_tx.send(ChannelSignal::Frame(frame)).await;
    }

    /// Signal connection loss to the dispatch loop.
    pub async fn drop_connection(&self) {
        let _ = self.signal_tx.send(ChannelSignal::Closed).await;
    }

    pub fn set_open_fails(&self, fails: bool) {
        self.open_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_send_fails(&self, fails: bool) {
        self.send_fails.store(fails, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn open(&self) -> Result<(), String> {
        if self.open_fails.load(Ordering::SeqCst) {
            return Err("open refused".to_string());
        }
        Ok(())
    }

    async fn send(&self, frame: &EventFrame) -> Result<(), String> {
        if self.send_fails.load(Ordering::SeqCst) {
            return Err("send refused".to_string());
        }
        self.sent.lock().await.push(frame.clone());
        Ok(())
    }

    async fn close(&self) {}
}
