//! "Feed now" toggle.
//!
//! Turning the switch on dispenses a portion; on success it reports `on`
//! and turns itself off after `reset_after`. The reset is a task tied to a
//! `CancellationToken` handed back to the caller as an [`AutoReset`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::FeedError;
use crate::models::DeviceAddress;

/// Reset en attente ; `cancel()` laisse l'interrupteur allumé.
#[derive(Debug, Clone)]
pub struct AutoReset {
    token: CancellationToken,
}

impl AutoReset {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Default)]
struct SwitchState {
    on: AtomicBool,
    pending: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct FeedSwitch {
    coordinator: Coordinator,
    address: DeviceAddress,
    reset_after: Duration,
    state: Arc<SwitchState>,
}

impl FeedSwitch {
    pub fn new(coordinator: Coordinator, address: DeviceAddress, reset_after: Duration) -> Self {
        Self {
            coordinator,
            address,
            reset_after,
            state: Arc::new(SwitchState::default()),
        }
    }

    pub fn is_on(&self) -> bool {
        self.state.on.load(Ordering::SeqCst)
    }

    /// Distribue `amount` grammes. `Ok(None)` si la commande n'est pas partie.
    pub async fn trigger(&self, amount: i64) -> Result<Option<AutoReset>, FeedError> {
        if !self.coordinator.feed_device(self.address, amount).await? {
            return Ok(None);
        }
        self.state.on.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        if let Some(previous) = self.state.pending.lock().replace(token.clone()) {
            previous.cancel();
        }

        let state = self.state.clone();
        let reset_token = token.clone();
        let delay = self.reset_after;
        let address = self.address;
        tokio::spawn(async move {
            tokio::select! {
                _ = reset_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut pending = state.pending.lock();
                    // un trigger plus récent a pris la main
                    if reset_token.is_cancelled() {
                        return;
                    }
                    pending.take();
                    state.on.store(false, Ordering::SeqCst);
                    debug!(address = %address, "feed switch auto-reset");
                }
            }
        });
        Ok(Some(AutoReset { token }))
    }

    /// Éteint immédiatement et annule tout reset en attente.
    pub fn turn_off(&self) {
        if let Some(pending) = self.state.pending.lock().take() {
            pending.cancel();
        }
        self.state.on.store(false, Ordering::SeqCst);
    }
}
