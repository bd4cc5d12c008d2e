//! Shutdown signal shared by the server and background tasks.

use tokio::sync::broadcast;

/// One broadcast channel that the serve loop, the invalidation listener,
/// and the usage aggregator all subscribe to. Triggering it stops accepting
/// connections and lets each task drain before exiting.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe before spawning; a receiver obtained after `trigger`
    /// never sees the signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
