//! BLE point-to-point link.
//!
//! At most one live handle per address: a reservation is taken before the
//! radio connect and released when the handle is dropped (including when
//! the future holding it is cancelled) or force-released at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::radio::{Radio, RadioLink, FEED_CHAR_UUID, STATUS_CHAR_UUID};
use super::{bounded, Transport};
use crate::codec::{self, CommandFrame};
use crate::error::{ConnectionError, TransportError};
use crate::models::{DeviceAddress, StatusSnapshot};

type Reservations = Arc<Mutex<HashMap<DeviceAddress, u64>>>;

struct Reservation {
    held: Reservations,
    address: DeviceAddress,
    id: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        if held.get(&self.address) == Some(&self.id) {
            held.remove(&self.address);
        }
    }
}

/// Handle exclusif sur un lien BLE établi
pub struct LocalHandle {
    address: DeviceAddress,
    link: Box<dyn RadioLink>,
    _reservation: Reservation,
}

impl LocalHandle {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

impl std::fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandle")
            .field("address", &self.address)
            .field("connected", &self.link.is_connected())
            .finish()
    }
}

pub struct LocalLink {
    radio: Arc<dyn Radio>,
    held: Reservations,
    next_id: AtomicU64,
    disconnect_timeout: Duration,
}

impl LocalLink {
    pub fn new(radio: Arc<dyn Radio>, disconnect_timeout: Duration) -> Self {
        Self {
            radio,
            held: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            disconnect_timeout,
        }
    }

    pub fn is_held(&self, address: &DeviceAddress) -> bool {
        self.held.lock().contains_key(address)
    }

    /// Libère la réservation sans attendre le détenteur du handle
    pub fn release(&self, address: &DeviceAddress) {
        if self.held.lock().remove(address).is_some() {
            warn!(address = %address, "local link force-released");
        }
    }

    fn reserve(&self, address: &DeviceAddress) -> Result<Reservation, ConnectionError> {
        let mut held = self.held.lock();
        if held.contains_key(address) {
            return Err(ConnectionError::Busy(*address));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.insert(*address, id);
        Ok(Reservation {
            held: self.held.clone(),
            address: *address,
            id,
        })
    }
}

#[async_trait]
impl Transport for LocalLink {
    type Handle = LocalHandle;

    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<LocalHandle, ConnectionError> {
        let reservation = self.reserve(address)?;
        let link = bounded("connect", timeout, async {
            self.radio
                .connect(address)
                .await
                .map_err(|source| ConnectionError::Failed {
                    address: *address,
                    source,
                })
        })
        .await?;
        debug!(address = %address, "local link connected");
        Ok(LocalHandle {
            address: *address,
            link,
            _reservation: reservation,
        })
    }

    async fn disconnect(&self, handle: LocalHandle) {
        if !handle.link.is_connected() {
            return;
        }
        let limit = self.disconnect_timeout;
        match tokio::time::timeout(limit, handle.link.disconnect()).await {
            Ok(Ok(())) => debug!(address = %handle.address, "local link closed"),
            Ok(Err(e)) => warn!(address = %handle.address, error = %e, "disconnect failed, dropping link"),
            Err(_) => warn!(address = %handle.address, "disconnect timed out after {}ms, dropping link", limit.as_millis()),
        }
    }

    async fn read_status(
        &self,
        handle: &LocalHandle,
        timeout: Duration,
    ) -> Result<StatusSnapshot, TransportError> {
        let bytes = bounded("read", timeout, async {
            handle
                .link
                .read(STATUS_CHAR_UUID)
                .await
                .map_err(TransportError::from)
        })
        .await?;
        Ok(codec::decode_status(&bytes, OffsetDateTime::now_utc())?)
    }

    async fn write_command(
        &self,
        handle: &LocalHandle,
        frame: &CommandFrame,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        bounded("write", timeout, async {
            handle
                .link
                .write(FEED_CHAR_UUID, frame.as_bytes())
                .await
                .map_err(TransportError::from)
        })
        .await?;
        debug!(address = %handle.address, frame = %frame.to_hex(), "frame written");
        Ok(())
    }
}
