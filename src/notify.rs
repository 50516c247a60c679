use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BayId, LedgerEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for ledger changes: one firehose plus optional per-bay channels.
pub struct NotifyHub {
    all: broadcast::Sender<LedgerEvent>,
    channels: DashMap<Ulid, broadcast::Sender<LedgerEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            all,
            channels: DashMap::new(),
        }
    }

    /// Every event for every bay.
    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerEvent> {
        self.all.subscribe()
    }

    /// Subscribe to one bay. Creates the channel if needed.
    pub fn subscribe(&self, bay_id: BayId) -> broadcast::Receiver<LedgerEvent> {
        let sender = self
            .channels
            .entry(bay_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &LedgerEvent) {
        let _ = self.all.send(event.clone());
        if let Some(sender) = self.channels.get(&event.bay_id()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a bay channel (e.g. when the bay is decommissioned).
    pub fn remove(&self, bay_id: &BayId) {
        self.channels.remove(bay_id);
    }
}
