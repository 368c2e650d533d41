//! Event-channel client (chat server socket).
//!
//! Transport seam plus the reconnecting client with its bounded outbound
//! queue. Inbound frames and disconnect signals arrive over an mpsc channel
//! owned by the observer's dispatch loop.

mod client;
mod memory;
mod transport;

pub use client::EventChannelClient;
pub use memory::MemoryTransport;
pub use transport::{ChannelSignal, EventTransport, WsTransport};
