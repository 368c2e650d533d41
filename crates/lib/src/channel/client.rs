//! Reconnecting event-channel client with a bounded outbound queue.
//!
//! Connection errors never escape to callers: a failed send marks the client
//! disconnected, queues the frame, and schedules exactly one reconnect timer
//! (cancel-and-replace). On reconnect the queue drains strictly FIFO with a
//! small pacing delay.

use crate::channel::transport::EventTransport;
use crate::config::ChannelConfig;
use crate::events::EventFrame;
use crate::timers::TaskTimers;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const RECONNECT_TIMER_KEY: &str = "channel:reconnect";

/// Brief settle before a failed emit is queued and reconnect is scheduled.
const EMIT_FAILURE_WAIT: Duration = Duration::from_millis(100);

struct QueuedEvent {
    frame: EventFrame,
    enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Client half of the chat server's real-time channel.
pub struct EventChannelClient {
    transport: Arc<dyn EventTransport>,
    timers: Arc<TaskTimers>,
    queue: Mutex<VecDeque<QueuedEvent>>,
    /// Permits for queue slots freed by the drain loop.
    space: Notify,
    capacity: usize,
    connected: AtomicBool,
    connect_in_flight: AtomicBool,
    reconnect_delay: Duration,
    pacing: Duration,
}

impl EventChannelClient {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        timers: Arc<TaskTimers>,
        config: &ChannelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            timers,
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            capacity: config.queue_capacity,
            connected: AtomicBool::new(false),
            connect_in_flight: AtomicBool::new(false),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            pacing: Duration::from_millis(config.drain_pacing_ms),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Connect if not already connected or connecting. Failure logs and
    /// schedules one retry after the fixed delay.
    pub async fn connect(self: &Arc<Self>) {
        if self.connected.load(Ordering::SeqCst) {
            return;
        }
        if self
            .connect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("event channel: connect already in flight");
            return;
        }
        match self.transport.open().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.connect_in_flight.store(false, Ordering::SeqCst);
                self.timers.cancel(RECONNECT_TIMER_KEY).await;
                log::info!("event channel: connected");
                self.drain().await;
            }
            Err(e) => {
                self.connect_in_flight.store(false, Ordering::SeqCst);
                log::warn!(
                    "event channel: connect failed, retrying in {:?}: {}",
                    self.reconnect_delay,
                    e
                );
                self.schedule_reconnect().await;
            }
        }
    }

    /// Tear down the connection and cancel any pending reconnect.
    pub async fn disconnect(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        self.timers.cancel(RECONNECT_TIMER_KEY).await;
        self.transport.close().await;
    }

    /// React to a transport-level connection loss (Closed signal).
    pub async fn on_connection_lost(self: &Arc<Self>) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::warn!("event channel: connection lost");
        }
        self.schedule_reconnect().await;
    }

    /// Emit an event. Connected: send now; a send failure disconnects, queues
    /// the frame after a brief wait, and schedules reconnect. Disconnected:
    /// queue directly. Queuing backpressures when the queue is full.
    pub async fn emit(self: &Arc<Self>, event: &str, payload: Value) {
        let frame = EventFrame::new(event, payload);
        if self.connected.load(Ordering::SeqCst) {
            match self.transport.send(&frame).await {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("event channel: send failed for {}: {}", frame.event, e);
                    self.connected.store(false, Ordering::SeqCst);
                    tokio::time::sleep(EMIT_FAILURE_WAIT).await;
                    self.enqueue_back(frame).await;
                    self.schedule_reconnect().await;
                    return;
                }
            }
        }
        self.enqueue_back(frame).await;
    }

    // Boxed so the timer's future (which awaits connect) does not appear in
    // connect's own future type; the cycle would defeat Send inference.
    fn schedule_reconnect(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let client = Arc::clone(self);
        let delay = self.reconnect_delay;
        Box::pin(async move {
            let retry = Arc::clone(&client);
            client
                .timers
                .schedule(RECONNECT_TIMER_KEY, delay, async move {
                    retry.connect().await;
                })
                .await;
        })
    }

    /// Append to the bounded queue, waiting for space when full.
    async fn enqueue_back(self: &Arc<Self>, frame: EventFrame) {
        loop {
            {
                let mut q = self.queue.lock().await;
                if q.len() < self.capacity {
                    q.push_back(QueuedEvent {
                        frame,
                        enqueued_at: chrono::Utc::now(),
                    });
                    break;
                }
            }
            log::debug!("event channel: outbound queue full, waiting");
            self.space.notified().await;
        }
        // A waiter can land here after the drain that freed its slot has
        // already finished; flush now rather than at the next reconnect.
        if self.connected.load(Ordering::SeqCst) {
            self.drain().await;
        }
    }

    /// Re-send queued frames strictly FIFO with pacing. A failed re-send puts
    /// the frame back at the front and retries reconnect.
    async fn drain(self: &Arc<Self>) {
        loop {
            let next = { self.queue.lock().await.pop_front() };
            let Some(item) = next else {
                return;
            };
            if let Err(e) = self.transport.send(&item.frame).await {
                log::warn!(
                    "event channel: drain failed for {} (queued {}), requeueing: {}",
                    item.frame.event,
                    item.enqueued_at,
                    e
                );
                self.queue.lock().await.push_front(item);
                self.connected.store(false, Ordering::SeqCst);
                self.schedule_reconnect().await;
                return;
            }
            self.space.notify_one();
            tokio::time::sleep(self.pacing).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryTransport;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn client_with_transport(capacity: usize) -> (Arc<EventChannelClient>, Arc<MemoryTransport>) {
        let (tx, _rx) = mpsc::channel(16);
        let transport = Arc::new(MemoryTransport::new(tx));
        let config = ChannelConfig {
            queue_capacity: capacity,
            reconnect_delay_secs: 1,
            drain_pacing_ms: 1,
            ..ChannelConfig::default()
        };
        let client = EventChannelClient::new(
            transport.clone() as Arc<dyn EventTransport>,
            TaskTimers::new(),
            &config,
        );
        (client, transport)
    }

    #[tokio::test]
    async fn queued_while_disconnected_delivered_fifo_after_connect() {
        let (client, transport) = client_with_transport(16);
        client.emit("a", json!({"n": 1})).await;
        client.emit("b", json!({"n": 2})).await;
        assert_eq!(client.queued().await, 2);
        assert!(transport.sent().await.is_empty());

        client.connect().await;
        let sent = transport.sent_events().await;
        assert_eq!(sent, vec!["a", "b"]);
        assert_eq!(client.queued().await, 0);
    }

    #[tokio::test]
    async fn send_failure_disconnects_and_queues() {
        let (client, transport) = client_with_transport(16);
        client.connect().await;
        assert!(client.is_connected());

        transport.set_send_fails(true);
        client.emit("x", json!({})).await;
        assert!(!client.is_connected());
        assert_eq!(client.queued().await, 1);

        // Reconnect delivers the queued frame.
        transport.set_send_fails(false);
        client.connect().await;
        assert_eq!(transport.sent_events().await, vec!["x"]);
    }

    #[tokio::test]
    async fn failed_connect_schedules_single_retry_timer() {
        let (client, transport) = client_with_transport(16);
        transport.set_open_fails(true);
        client.connect().await;
        client.connect().await;
        client.connect().await;
        // Cancel-and-replace keeps at most one reconnect timer outstanding.
        assert_eq!(client.timers.outstanding().await, 1);

        transport.set_open_fails(false);
        client.connect().await;
        assert!(client.is_connected());
        assert_eq!(client.timers.outstanding().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_retry_fires_and_reconnects() {
        let (client, transport) = client_with_transport(16);
        client.emit("a", json!({})).await;
        transport.set_open_fails(true);
        client.connect().await;
        assert!(!client.is_connected());

        // The retry timer reconnects and drains on its own.
        transport.set_open_fails(false);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(client.is_connected());
        assert_eq!(transport.sent_events().await, vec!["a"]);
    }

    #[tokio::test]
    async fn mid_drain_failure_requeues_at_front() {
        let (client, transport) = client_with_transport(16);
        client.emit("a", json!({})).await;
        client.emit("b", json!({})).await;

        // First connect: every send fails, so "a" stays at the front.
        transport.set_send_fails(true);
        client.connect().await;
        assert!(!client.is_connected());
        assert_eq!(client.queued().await, 2);

        transport.set_send_fails(false);
        client.connect().await;
        assert_eq!(transport.sent_events().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn waiter_that_wakes_after_drain_still_delivers() {
        let (client, transport) = client_with_transport(1);
        client.emit("a", json!({})).await;

        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client.emit("b", json!({})).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Connect drains "a"; the woken waiter must flush "b" itself rather
        // than leave it queued until the next reconnect.
        client.connect().await;
        blocked.await.expect("emit task");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.sent_events().await, vec!["a", "b"]);
        assert_eq!(client.queued().await, 0);
    }

    #[tokio::test]
    async fn full_queue_backpressures_until_drained() {
        let (client, transport) = client_with_transport(2);
        client.emit("a", json!({})).await;
        client.emit("b", json!({})).await;

        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client.emit("c", json!({})).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        client.connect().await;
        // Drain frees space; the blocked emit completes and delivers.
        blocked.await.expect("emit task");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.sent_events().await, vec!["a", "b", "c"]);
        assert_eq!(client.queued().await, 0);
    }
}
