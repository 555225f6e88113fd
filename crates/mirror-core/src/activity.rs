//! Active/inactive gate for outbound requests.

use std::sync::Arc;

use tokio::sync::watch;

/// Gate awaited before every outbound fetch.
///
/// While inactive, fetches stall; transport failures observed while inactive
/// are retried once activation resumes.
#[derive(Clone)]
pub struct ActivityGate {
    sender: Arc<watch::Sender<bool>>,
}

impl ActivityGate {
    pub fn new(active: bool) -> Self {
        let (sender, _receiver) = watch::channel(active);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.sender.send_replace(active);
    }

    pub fn is_active(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the gate is (or becomes) active.
    pub async fn wait_for_activation(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
