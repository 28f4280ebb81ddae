/**
 * SESSION APPAREIL - Machine d'état de connexion + repli LocalLink -> BusLink
 *
 * RÔLE :
 * Une session par distributeur. Elle possède l'état de connexion et le handle
 * LocalLink vivant ; toute opération LocalLink (poll, distribution, commande
 * venue du bus) passe par son verrou.
 *
 * FONCTIONNEMENT :
 * - Lecture : LocalLink (reconnexion unique si le lien tombe), puis cache BusLink
 * - Distribution : LocalLink connect + write, puis une seule publication bus
 * - Arrêt : effectif une seule fois, libère le lien même si la déconnexion échoue
 *
 * UTILITÉ :
 * Les erreurs transport ne sortent jamais d'ici : une lecture rend toujours
 * un snapshot, une distribution rend un `FeedDelivery` ou un `FeedError`.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, CommandFrame};
use crate::error::{ConnectionError, FeedError, TransportError};
use crate::models::{
    Acquisition, ConnectionState, DeviceAddress, DeviceDescriptor, FeedDelivery, Source,
    StatusSnapshot,
};
use crate::transport::{BusLink, LocalHandle, LocalLink, Transport};

/// Délais par opération appliqués par une session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
    pub disconnect: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(8000),
            read: Duration::from_millis(4000),
            write: Duration::from_millis(4000),
            disconnect: Duration::from_millis(2000),
        }
    }
}

/// Why a link attempt produced nothing.
#[derive(Debug, thiserror::Error)]
enum LinkFailure {
    #[error(transparent)]
    Connect(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LinkFailure {
    /// Snapshot reported when no path produced data.
    /// A hung link or a garbled frame is a fault; a refused link is just absent.
    fn into_snapshot(self) -> StatusSnapshot {
        match &self {
            LinkFailure::Connect(e) if e.is_timeout() => StatusSnapshot::error(self.to_string()),
            LinkFailure::Transport(e) if e.is_timeout() => StatusSnapshot::error(self.to_string()),
            LinkFailure::Transport(TransportError::Corrupt(_)) => {
                StatusSnapshot::error(self.to_string())
            }
            _ => StatusSnapshot::offline(),
        }
    }
}

/// `Connecting` en cours : échec ou abandon du future (deadline, arrêt) -> `Failed`
struct ConnectAttempt<'a> {
    session: &'a DeviceSession,
    armed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.set_state(ConnectionState::Failed);
        }
    }
}

struct LinkSlot {
    handle: Option<LocalHandle>,
}

pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    local: Arc<LocalLink>,
    bus: Arc<BusLink>,
    timeouts: SessionTimeouts,
    /// verrou par appareil : sérialise toute opération LocalLink
    link: tokio::sync::Mutex<LinkSlot>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
}

impl DeviceSession {
    pub fn new(
        descriptor: DeviceDescriptor,
        local: Arc<LocalLink>,
        bus: Arc<BusLink>,
        timeouts: SessionTimeouts,
    ) -> Self {
        bus.register(&descriptor);
        Self {
            descriptor,
            local,
            bus,
            timeouts,
            link: tokio::sync::Mutex::new(LinkSlot { handle: None }),
            state: Mutex::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> DeviceAddress {
        self.descriptor.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(address = %self.descriptor.address, from = ?*state, to = ?next, "connection state");
            *state = next;
        }
    }

    /// Snapshot courant, jamais en échec.
    pub async fn get_status(&self) -> StatusSnapshot {
        self.acquire().await.snapshot
    }

    /// Comme `get_status`, avec la provenance du snapshot.
    pub async fn acquire(&self) -> Acquisition {
        if self.is_closed() {
            return Acquisition {
                snapshot: StatusSnapshot::offline(),
                source: Source::None,
            };
        }
        let address = self.descriptor.address;
        let mut slot = self.link.lock().await;

        let local_failure = match self.read_local(&mut slot).await {
            Ok(snapshot) => {
                return Acquisition {
                    snapshot,
                    source: Source::Local,
                }
            }
            Err(e) => e,
        };
        drop(slot);
        debug!(
            address = %address,
            from = self.local.name(),
            to = self.bus.name(),
            error = %local_failure,
            "status read falling back"
        );

        match self.read_bus().await {
            Ok(snapshot) => Acquisition {
                snapshot,
                source: Source::Bus,
            },
            Err(bus_failure) => {
                debug!(address = %address, error = %bus_failure, "no bus data");
                Acquisition {
                    snapshot: local_failure.into_snapshot(),
                    source: Source::None,
                }
            }
        }
    }

    async fn read_local(&self, slot: &mut LinkSlot) -> Result<StatusSnapshot, LinkFailure> {
        if let Some(handle) = slot.handle.as_ref() {
            match self.local.read_status(handle, self.timeouts.read).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!(address = %self.descriptor.address, error = %e, "local read failed, reconnecting once");
                    self.drop_link(slot).await;
                }
            }
        }

        self.ensure_connected(slot).await?;
        let Some(handle) = slot.handle.as_ref() else {
            return Err(ConnectionError::Busy(self.descriptor.address).into());
        };
        match self.local.read_status(handle, self.timeouts.read).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.drop_link(slot).await;
                Err(e.into())
            }
        }
    }

    async fn read_bus(&self) -> Result<StatusSnapshot, LinkFailure> {
        let handle = self
            .bus
            .connect(&self.descriptor.address, self.timeouts.connect)
            .await?;
        Ok(self.bus.read_status(&handle, self.timeouts.read).await?)
    }

    async fn ensure_connected(&self, slot: &mut LinkSlot) -> Result<(), ConnectionError> {
        if slot.handle.is_some() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        let mut attempt = ConnectAttempt {
            session: self,
            armed: true,
        };
        let handle = self
            .local
            .connect(&self.descriptor.address, self.timeouts.connect)
            .await?;
        attempt.armed = false;
        slot.handle = Some(handle);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn drop_link(&self, slot: &mut LinkSlot) {
        if let Some(handle) = slot.handle.take() {
            self.local.disconnect(handle).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Distribue `amount` grammes : LocalLink d'abord, puis une publication bus.
    pub async fn feed(&self, amount: u16) -> Result<FeedDelivery, FeedError> {
        let frame = codec::encode_feed(amount)
            .map_err(|_| FeedError::InvalidAmount(i64::from(amount)))?;
        let address = self.descriptor.address;
        if self.is_closed() {
            return Err(FeedError::SessionClosed(address));
        }

        let mut slot = self.link.lock().await;
        let local_failure = match self.write_local(&mut slot, &frame).await {
            Ok(()) => {
                info!(address = %address, amount, "feed delivered over local link");
                return Ok(FeedDelivery::Local);
            }
            Err(e) => e,
        };
        warn!(
            address = %address,
            from = self.local.name(),
            to = self.bus.name(),
            error = %local_failure,
            "feed falling back"
        );

        match self.write_bus(&frame).await {
            Ok(()) => {
                info!(address = %address, amount, "feed sent over bus");
                Ok(FeedDelivery::Bus)
            }
            Err(bus_failure) => Err(FeedError::Undelivered {
                address,
                local: local_failure.to_string(),
                bus: bus_failure.to_string(),
            }),
        }
    }

    async fn write_local(&self, slot: &mut LinkSlot, frame: &CommandFrame) -> Result<(), LinkFailure> {
        self.ensure_connected(slot).await?;
        let Some(handle) = slot.handle.as_ref() else {
            return Err(ConnectionError::Busy(self.descriptor.address).into());
        };
        match self
            .local
            .write_command(handle, frame, self.timeouts.write)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_link(slot).await;
                Err(e.into())
            }
        }
    }

    async fn write_bus(&self, frame: &CommandFrame) -> Result<(), LinkFailure> {
        let handle = self
            .bus
            .connect(&self.descriptor.address, self.timeouts.connect)
            .await?;
        Ok(self
            .bus
            .write_command(&handle, frame, self.timeouts.write)
            .await?)
    }

    /// Ferme le lien local ; la session reste utilisable.
    pub async fn disconnect(&self) {
        let mut slot = self.link.lock().await;
        self.drop_link(&mut slot).await;
    }

    /// Arrêt définitif, effectif une seule fois.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let address = self.descriptor.address;
        {
            let mut slot = self.link.lock().await;
            self.drop_link(&mut slot).await;
        }
        self.bus.release(&address, self.timeouts.disconnect).await;
        info!(address = %address, "session closed");
    }

    /// Libère le lien local sans attendre le verrou de session.
    pub fn force_release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.link.try_lock() {
            slot.handle.take();
        }
        self.local.release(&self.descriptor.address);
        self.set_state(ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.descriptor.address)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceStatus;
    use crate::testing::RecordingBus;
    use crate::transport::{SimBehavior, SimFeeder, SimRadio};

    struct Fixture {
        radio: SimRadio,
        feeder: Arc<SimFeeder>,
        bus_client: Arc<RecordingBus>,
        bus: Arc<BusLink>,
        local: Arc<LocalLink>,
        session: DeviceSession,
    }

    fn fixture() -> Fixture {
        let radio = SimRadio::new();
        let address: DeviceAddress = "AA:BB:CC:DD:EE:10".parse().unwrap();
        let feeder = radio.add_feeder(address);
        let bus_client = Arc::new(RecordingBus::default());
        let bus = Arc::new(BusLink::new(bus_client.clone()));
        let local = Arc::new(LocalLink::new(Arc::new(radio.clone()), Duration::from_secs(1)));
        let descriptor = DeviceDescriptor::new(address, "Cuisine", None);
        let session = DeviceSession::new(descriptor, local.clone(), bus.clone(), SessionTimeouts::default());
        Fixture {
            radio,
            feeder,
            bus_client,
            bus,
            local,
            session,
        }
    }

    fn state_topic(f: &Fixture) -> String {
        f.session.descriptor().device_state_topic()
    }

    #[tokio::test]
    async fn test_local_read_keeps_link() {
        let f = fixture();
        f.feeder.set_levels(88, 42);

        let acq = f.session.acquire().await;
        assert_eq!(acq.source, Source::Local);
        assert_eq!(acq.snapshot.battery, Some(88));
        assert_eq!(f.session.state(), ConnectionState::Connected);

        f.session.acquire().await;
        assert_eq!(f.feeder.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_reconnects_once() {
        let f = fixture();
        f.session.acquire().await;
        f.feeder.set_read(SimBehavior::Fail);

        let acq = f.session.acquire().await;
        // first read fails, one reconnect, second read fails too
        assert_eq!(f.feeder.connect_count(), 2);
        assert_eq!(acq.source, Source::None);
        assert_eq!(acq.snapshot.status, DeviceStatus::Offline);
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_falls_back_to_bus_state() {
        let f = fixture();
        f.feeder.set_connect(SimBehavior::Fail);
        f.bus
            .ingest_state(&state_topic(&f), br#"{"battery":50,"food_level":20}"#);

        let acq = f.session.acquire().await;
        assert_eq!(acq.source, Source::Bus);
        assert_eq!(acq.snapshot.food_level, Some(20));
        assert_eq!(f.session.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_connect_leaves_failed_state() {
        let f = fixture();
        f.feeder.set_latency(Duration::from_secs(5));

        let abandoned = tokio::time::timeout(Duration::from_secs(1), f.session.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(f.session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_failed_is_retried_next_cycle() {
        let f = fixture();
        f.feeder.set_connect(SimBehavior::Fail);
        f.session.acquire().await;
        assert_eq!(f.session.state(), ConnectionState::Failed);

        f.feeder.set_connect(SimBehavior::Normal);
        let acq = f.session.acquire().await;
        assert_eq!(acq.source, Source::Local);
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.feeder.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_and_poll_never_overlap_on_the_radio() {
        let f = fixture();
        f.feeder.set_write_latency(Duration::from_secs(3));

        let (delivery, acq) = tokio::join!(f.session.feed(20), async {
            // la distribution tient déjà le lien
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.session.acquire().await
        });

        assert_eq!(delivery.unwrap(), FeedDelivery::Local);
        assert_eq!(f.feeder.peak_concurrency(), 1);
        assert_eq!(f.feeder.connect_count(), 1);
        assert_eq!(f.feeder.feeds(), vec![20]);
        // lecture faite après la distribution
        assert_eq!(acq.source, Source::Local);
        assert_eq!(acq.snapshot.food_level, Some(78));
    }

    #[tokio::test]
    async fn test_unreachable_without_bus_data_is_offline() {
        let f = fixture();
        f.radio.remove_feeder(&f.session.address());

        let snap = f.session.get_status().await;
        assert_eq!(snap.status, DeviceStatus::Offline);
        assert_eq!(snap.battery, None);
        assert_eq!(snap.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_without_bus_data_is_error() {
        let f = fixture();
        f.feeder.set_connect(SimBehavior::Hang);

        let snap = f.session.get_status().await;
        assert_eq!(snap.status, DeviceStatus::Error);
        assert!(snap.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_error() {
        let f = fixture();
        f.feeder.set_corrupt_status(true);

        let snap = f.session.get_status().await;
        assert_eq!(snap.status, DeviceStatus::Error);
        assert!(snap.error.unwrap().contains("checksum"));
    }

    #[tokio::test]
    async fn test_feed_over_local_link() {
        let f = fixture();
        let delivery = f.session.feed(12).await.unwrap();
        assert_eq!(delivery, FeedDelivery::Local);
        assert_eq!(f.feeder.feeds(), vec![12]);
        assert!(f.bus_client.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_feed_falls_back_to_bus_once() {
        let f = fixture();
        f.feeder.set_write(SimBehavior::Fail);

        let delivery = f.session.feed(30).await.unwrap();
        assert_eq!(delivery, FeedDelivery::Bus);
        assert!(f.feeder.feeds().is_empty());
        let sent = f
            .bus_client
            .published_on(&f.session.descriptor().device_command_topic());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["amount"], 30);
    }

    #[tokio::test]
    async fn test_feed_undelivered_when_both_fail() {
        let f = fixture();
        f.feeder.set_connect(SimBehavior::Fail);
        f.bus_client.set_failing(true);

        let err = f.session.feed(30).await.unwrap_err();
        assert!(matches!(err, FeedError::Undelivered { .. }));
        assert!(!err.is_caller_error());
    }

    #[tokio::test]
    async fn test_feed_rejects_invalid_amount_without_io() {
        let f = fixture();
        let err = f.session.feed(501).await.unwrap_err();
        assert!(matches!(err, FeedError::InvalidAmount(501)));
        assert_eq!(f.feeder.io_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_effective_once() {
        let f = fixture();
        f.session.acquire().await;

        f.session.shutdown().await;
        f.session.shutdown().await;

        assert_eq!(f.feeder.disconnect_count(), 1);
        assert_eq!(f.bus_client.unsubscribed.lock().len(), 1);
        assert!(!f.local.is_held(&f.session.address()));
        assert!(matches!(
            f.session.feed(10).await,
            Err(FeedError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_even_if_disconnect_fails() {
        let f = fixture();
        f.session.acquire().await;
        f.feeder.set_disconnect(SimBehavior::Fail);

        f.session.shutdown().await;
        assert!(!f.local.is_held(&f.session.address()));
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_force_release_frees_link() {
        let f = fixture();
        f.session.acquire().await;

        f.session.force_release();
        assert!(!f.local.is_held(&f.session.address()));
        assert!(f.session.is_closed());
    }
}
