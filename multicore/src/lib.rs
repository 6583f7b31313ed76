//! Per-channel dispatch primitives.
//!
//! The connection manager accepts and connects sockets on behalf of all 16 serial
//! channels but never touches a channel's client list directly: it hands each
//! connection event off through a dispatcher so that the channel's own scheduler
//! task is the sole writer of that channel's client state. This module provides
//! that hand-off channel along with the dispatch/drop counters used to observe
//! backpressure from a channel whose inbox is full.

mod channel_dispatcher;
mod dispatch_stats;

pub use channel_dispatcher::{ChannelDispatcher, ChannelId, ChannelMode, Channels, DispatchError};
pub use dispatch_stats::DispatchStats;
