//! Channel registry and cross-thread transfer
//!
//! Channels are the only sanctioned communication between VM threads.
//! The sync machinery lives on [`ChannelData`] in lattice-core (one mutex
//! per channel, a condvar for blocked senders and another for receivers);
//! this module owns the process-wide registry used for diagnostics and
//! enforces the transfer rule: fluid payloads are deep-cloned at the send
//! boundary so no `Rc` ever crosses a thread.

use crate::phase_ops::deep_clone_for_transfer;
use lattice_core::error::LatError;
use lattice_core::value::{ChannelData, LatValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::trace;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-global channel registry (id -> handle).
static CHANNEL_REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<ChannelData>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u64, Arc<ChannelData>>> {
    CHANNEL_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create a channel. `capacity` 0 means unbounded; otherwise senders
/// block once `capacity` messages are queued.
pub fn make_channel(capacity: usize) -> LatValue {
    let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
    let chan = Arc::new(ChannelData::new(id, capacity));
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, chan.clone());
    trace!(channel = id, capacity, "channel created");
    LatValue::channel(chan)
}

/// Blocking send. The value is transfer-cloned before it enters the
/// queue.
pub fn send_value(chan: &Arc<ChannelData>, value: &LatValue) -> Result<(), LatError> {
    let payload = deep_clone_for_transfer(value);
    chan.send(payload)
        .map_err(|_| LatError::channel(format!("send on closed channel#{}", chan.id)))
}

/// Blocking receive.
pub fn recv_value(chan: &Arc<ChannelData>) -> Result<LatValue, LatError> {
    chan.recv()
        .map_err(|_| LatError::channel(format!("receive on closed channel#{}", chan.id)))
}

/// Close and unregister.
pub fn close_channel(chan: &Arc<ChannelData>) {
    chan.close();
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&chan.id);
    trace!(channel = chan.id, "channel closed");
}

/// Number of open channels. `None` when the registry lock is held
/// elsewhere (best-effort diagnostic, never blocks).
pub fn channel_count() -> Option<usize> {
    match registry().try_lock() {
        Ok(guard) => Some(guard.len()),
        Err(_) => None,
    }
}

/// Queue depth per open channel, for diagnostics.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub id: u64,
    pub capacity: usize,
    pub queue_depth: usize,
}

/// Best-effort snapshot of every open channel.
pub fn channel_stats() -> Option<Vec<ChannelStats>> {
    match registry().try_lock() {
        Ok(guard) => Some(
            guard
                .values()
                .map(|chan| ChannelStats {
                    id: chan.id,
                    capacity: chan.capacity,
                    queue_depth: chan.queue_len(),
                })
                .collect(),
        ),
        Err(_) => None,
    }
}
