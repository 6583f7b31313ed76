use crate::DispatchStats;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifies one of the server's physical channels (0-based).
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operating mode for a [`ChannelDispatcher`].
#[derive(Clone)]
pub enum ChannelMode {
    /// All events land in a single shared inbox.
    Shared,
    /// Events are routed to the inbox named by the channel they belong to.
    PerChannel(Vec<ChannelId>),
}

pub enum Channels<T> {
    Shared(Sender<T>, Arc<Receiver<T>>),
    PerChannel(HashMap<ChannelId, (Sender<T>, Arc<Receiver<T>>)>),
}

/// A bounded, non-blocking fan-out from one producer (the connection manager)
/// to one inbox per channel (the channel's own scheduler task).
pub struct ChannelDispatcher<T> {
    channels: Channels<T>,
    stats: DispatchStats,
}

impl<T: Send + 'static> ChannelDispatcher<T> {
    pub fn new(mode: ChannelMode, channel_size: usize) -> Self {
        match mode {
            ChannelMode::Shared => Self::new_shared(channel_size),
            ChannelMode::PerChannel(ids) => Self::new_per_channel(&ids, channel_size),
        }
    }

    fn new_shared(channel_size: usize) -> Self {
        let (tx, rx) = bounded(channel_size);
        Self {
            channels: Channels::Shared(tx, Arc::new(rx)),
            stats: DispatchStats::default(),
        }
    }

    fn new_per_channel(ids: &[ChannelId], channel_size: usize) -> Self {
        let mut map = HashMap::with_capacity(ids.len());
        for &id in ids {
            let (tx, rx) = bounded(channel_size);
            map.insert(id, (tx, Arc::new(rx)));
        }
        Self {
            channels: Channels::PerChannel(map),
            stats: DispatchStats::default(),
        }
    }

    /// Dispatches `data` to the inbox selected by `channel_id` (ignored in `Shared` mode).
    ///
    /// Never blocks: a full inbox is reported as [`DispatchError::SendFailed`] rather
    /// than stalling the connection manager's accept loop.
    pub fn dispatch(&self, data: T, channel_id: Option<ChannelId>) -> Result<(), DispatchError<T>> {
        let result = match &self.channels {
            Channels::PerChannel(map) => {
                let id = channel_id.ok_or(DispatchError::ChannelIdRequired)?;
                let (sender, _) = map.get(&id).ok_or(DispatchError::ChannelNotFound(id))?;
                sender.try_send(data)
            }
            Channels::Shared(sender, _) => sender.try_send(data),
        };
        match result {
            Ok(()) => {
                self.stats.record_dispatch();
                Ok(())
            }
            Err(e) => {
                self.stats.record_drop();
                Err(DispatchError::SendFailed(e))
            }
        }
    }

    /// Returns the receiving end for `channel_id` (or the shared receiver).
    pub fn receiver(&self, channel_id: ChannelId) -> Option<Arc<Receiver<T>>> {
        match &self.channels {
            Channels::PerChannel(map) => map.get(&channel_id).map(|(_, rx)| Arc::clone(rx)),
            Channels::Shared(_, rx) => Some(Arc::clone(rx)),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

#[derive(Debug, Error)]
pub enum DispatchError<T> {
    #[error("channel id required for per-channel dispatch")]
    ChannelIdRequired,

    #[error("no inbox registered for channel {0}")]
    ChannelNotFound(ChannelId),

    #[error("inbox send failed")]
    SendFailed(#[from] TrySendError<T>),
}
