/**
 * COORDINATEUR - Poll périodique isolé par appareil + point d'entrée distribution
 *
 * RÔLE :
 * Possède les sessions (une par adresse) et le dernier agrégat de snapshots.
 * Point d'entrée unique pour : poll_once, feed_device, start, shutdown.
 *
 * FONCTIONNEMENT :
 * - Chaque cycle lance un task par appareil, borné par un sémaphore et par
 *   `device_poll_timeout` ; un task en panique ou en retard donne `error`
 *   pour cet appareil seulement
 * - L'agrégat est remplacé en bloc dans un `watch` : un lecteur voit toujours
 *   un cycle complet, jamais un mélange
 * - Les cycles ne se chevauchent pas : le dernier publié est le plus récent
 * - Une distribution réussie réveille le scheduler (ou lance un poll ponctuel)
 * - Arrêt : annulation du scheduler, puis fermeture des sessions en parallèle
 *   sous `shutdown_timeout`, libération forcée au-delà
 *
 * UTILITÉ :
 * Un appareil défaillant n'affecte jamais la surveillance des autres.
 */

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FeederConfig;
use crate::error::{ConfigError, FeedError};
use crate::models::{Aggregate, DeviceAddress, DeviceDescriptor, FeedRequest, Source, StatusSnapshot};
use crate::mqtt::BusClient;
use crate::publish::PublishSink;
use crate::session::{DeviceSession, SessionTimeouts};
use crate::transport::{BusLink, LocalLink, Radio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub device_poll_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent_polls: usize,
    pub timeouts: SessionTimeouts,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            device_poll_timeout: Duration::from_millis(20_000),
            shutdown_timeout: Duration::from_millis(10_000),
            max_concurrent_polls: 4,
            timeouts: SessionTimeouts::default(),
        }
    }
}

struct Inner {
    sessions: BTreeMap<DeviceAddress, Arc<DeviceSession>>,
    bus: Arc<BusLink>,
    sink: PublishSink,
    settings: CoordinatorSettings,
    aggregate: watch::Sender<Aggregate>,
    limiter: Arc<Semaphore>,
    /// un seul cycle à la fois
    cycle: tokio::sync::Mutex<()>,
    refresh: Notify,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle clonable vers le coordinateur
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        devices: Vec<DeviceDescriptor>,
        radio: Arc<dyn Radio>,
        client: Arc<dyn BusClient>,
    ) -> Result<Self, ConfigError> {
        if settings.max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_polls",
                reason: "must be at least 1".into(),
            });
        }
        let local = Arc::new(LocalLink::new(radio, settings.timeouts.disconnect));
        let bus = Arc::new(BusLink::new(client.clone()));

        let mut sessions = BTreeMap::new();
        for descriptor in &devices {
            if sessions.contains_key(&descriptor.address) {
                return Err(ConfigError::DuplicateDevice(descriptor.address));
            }
            let session = DeviceSession::new(
                descriptor.clone(),
                local.clone(),
                bus.clone(),
                settings.timeouts,
            );
            sessions.insert(descriptor.address, Arc::new(session));
        }
        let sink = PublishSink::new(client, bus.clone(), &devices, settings.timeouts.write);
        let (aggregate, _) = watch::channel(Aggregate::default());

        info!(devices = sessions.len(), "coordinator ready");
        Ok(Self {
            inner: Arc::new(Inner {
                sessions,
                bus,
                sink,
                settings,
                aggregate,
                limiter: Arc::new(Semaphore::new(settings.max_concurrent_polls)),
                cycle: tokio::sync::Mutex::new(()),
                refresh: Notify::new(),
                cancel: CancellationToken::new(),
                scheduler: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn from_config(
        config: &FeederConfig,
        radio: Arc<dyn Radio>,
        client: Arc<dyn BusClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(config.coordinator_settings(), config.descriptors()?, radio, client)
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .sessions
            .values()
            .map(|s| s.descriptor().clone())
            .collect()
    }

    pub fn session(&self, address: &DeviceAddress) -> Option<Arc<DeviceSession>> {
        self.inner.sessions.get(address).cloned()
    }

    pub fn snapshot(&self) -> Aggregate {
        self.inner.aggregate.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Aggregate> {
        self.inner.aggregate.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.lock().is_some()
    }

    /// Un cycle complet : exactement une entrée par appareil enregistré.
    pub async fn poll_once(&self) -> Aggregate {
        let inner = &self.inner;
        let deadline = inner.settings.device_poll_timeout;
        let _cycle = tokio::select! {
            _ = inner.cancel.cancelled() => return self.snapshot(),
            guard = inner.cycle.lock() => guard,
        };

        let (addresses, tasks): (Vec<_>, Vec<_>) = inner
            .sessions
            .iter()
            .map(|(address, session)| {
                let session = session.clone();
                let limiter = inner.limiter.clone();
                let cancel = inner.cancel.clone();
                let task = tokio::spawn(async move {
                    let _permit = limiter.acquire_owned().await.ok()?;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        polled = tokio::time::timeout(deadline, session.acquire()) => Some(polled),
                    }
                });
                (*address, task)
            })
            .unzip();

        let results = join_all(tasks).await;
        if inner.cancel.is_cancelled() {
            return self.snapshot();
        }

        let mut entries = HashMap::with_capacity(addresses.len());
        let mut republish = Vec::new();
        for (address, result) in addresses.into_iter().zip(results) {
            let snapshot = match result {
                Ok(Some(Ok(acquired))) => {
                    if acquired.source == Source::Local {
                        republish.push((address, acquired.snapshot.clone()));
                    }
                    acquired.snapshot
                }
                Ok(Some(Err(_))) => {
                    warn!(address = %address, "device poll exceeded {}ms", deadline.as_millis());
                    StatusSnapshot::error(format!(
                        "poll timed out after {}ms",
                        deadline.as_millis()
                    ))
                }
                Ok(None) => StatusSnapshot::error("poll cancelled"),
                Err(e) => {
                    error!(address = %address, error = %e, "device poll task failed");
                    StatusSnapshot::error(format!("poll task failed: {e}"))
                }
            };
            entries.insert(address, snapshot);
        }

        let aggregate: Aggregate = Arc::new(entries);
        inner.aggregate.send_replace(aggregate.clone());
        debug!(devices = aggregate.len(), "poll cycle complete");

        let publishes = republish
            .iter()
            .map(|(address, snapshot)| inner.sink.publish_status(address, snapshot));
        for ((address, _), result) in republish.iter().zip(join_all(publishes).await) {
            if let Err(e) = result {
                warn!(address = %address, error = %e, "status republish failed");
            }
        }
        aggregate
    }

    /// Distribue sur un appareil enregistré puis demande un rafraîchissement.
    /// `Ok(false)` : la commande n'est partie par aucun chemin.
    pub async fn feed_device(&self, address: DeviceAddress, amount: i64) -> Result<bool, FeedError> {
        let session = self
            .inner
            .sessions
            .get(&address)
            .cloned()
            .ok_or(FeedError::UnknownDevice(address))?;
        let request =
            FeedRequest::new(address, amount).map_err(|_| FeedError::InvalidAmount(amount))?;

        match session.feed(request.amount).await {
            Ok(delivery) => {
                info!(address = %address, amount = request.amount, via = ?delivery, "feed accepted");
                self.request_refresh();
                Ok(true)
            }
            Err(e) if e.is_caller_error() => Err(e),
            Err(e) => {
                warn!(address = %address, error = %e, "feed failed");
                Ok(false)
            }
        }
    }

    /// Rafraîchissement hors calendrier
    pub fn request_refresh(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            self.inner.refresh.notify_one();
        } else {
            let this = self.clone();
            tokio::spawn(async move {
                this.poll_once().await;
            });
        }
    }

    /// Route un message entrant du bus. Une demande de distribution est
    /// traitée dans son propre task ; son handle est retourné.
    pub fn handle_bus_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Option<JoinHandle<Result<bool, FeedError>>> {
        if self.inner.bus.ingest_state(topic, payload) {
            return None;
        }
        let Some(request) = self.inner.sink.parse_command(topic, payload) else {
            if !self.inner.sink.is_command_topic(topic) {
                debug!(topic = %topic, "ignoring unrelated bus message");
            }
            return None;
        };
        let this = self.clone();
        Some(tokio::spawn(async move {
            let result = this.feed_device(request.address, request.amount).await;
            if let Err(e) = &result {
                warn!(address = %request.address, error = %e, "bus feed request rejected");
            }
            result
        }))
    }

    pub async fn subscribe_all(&self) -> Result<(), crate::error::BusError> {
        self.inner.sink.subscribe_all().await
    }

    /// Lance le scheduler ; premier cycle immédiat. Sans effet s'il tourne déjà.
    pub fn start(&self) {
        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let period = self.inner.settings.poll_interval;
        *scheduler = Some(tokio::spawn(async move {
            let cancel = this.inner.cancel.clone();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = this.inner.refresh.notified() => debug!("refresh requested"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = this.poll_once() => {}
                }
            }
            info!("scheduler stopped");
        }));
    }

    /// Arrêt borné par `shutdown_timeout`, même si une déconnexion ne rend jamais la main.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.cancel.cancel();
        let scheduler = inner.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }

        let limit = inner.settings.shutdown_timeout;
        let closing = join_all(inner.sessions.values().map(|s| s.shutdown()));
        match tokio::time::timeout(limit, closing).await {
            Ok(_) => info!(devices = inner.sessions.len(), "all sessions closed"),
            Err(_) => {
                warn!("session shutdown exceeded {}ms, forcing release", limit.as_millis());
                for session in inner.sessions.values() {
                    session.force_release();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionState, DeviceStatus};
    use crate::testing::RecordingBus;
    use crate::transport::{SimBehavior, SimRadio};

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, n])
    }

    fn fleet(n: u8, settings: CoordinatorSettings) -> (SimRadio, Arc<RecordingBus>, Coordinator) {
        let radio = SimRadio::new();
        let devices = (1..=n)
            .map(|i| {
                radio.add_feeder(addr(i));
                DeviceDescriptor::new(addr(i), format!("Feeder {i}"), None)
            })
            .collect();
        let client = Arc::new(RecordingBus::default());
        let coordinator =
            Coordinator::new(settings, devices, Arc::new(radio.clone()), client.clone()).unwrap();
        (radio, client, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_device_is_isolated() {
        let (radio, _, coordinator) = fleet(3, CoordinatorSettings::default());
        radio.feeder(&addr(2)).unwrap().set_connect(SimBehavior::Hang);

        let aggregate = coordinator.poll_once().await;
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[&addr(1)].status, DeviceStatus::Online);
        assert_eq!(aggregate[&addr(2)].status, DeviceStatus::Error);
        assert_eq!(aggregate[&addr(3)].status, DeviceStatus::Online);
        assert_eq!(*coordinator.snapshot(), *aggregate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_poll_hits_device_deadline() {
        let settings = CoordinatorSettings {
            device_poll_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (radio, _, coordinator) = fleet(2, settings);
        radio.feeder(&addr(1)).unwrap().set_latency(Duration::from_secs(5));

        let aggregate = coordinator.poll_once().await;
        let entry = &aggregate[&addr(1)];
        assert_eq!(entry.status, DeviceStatus::Error);
        assert!(entry.error.as_deref().unwrap().contains("poll timed out"));
        assert!(aggregate[&addr(2)].is_online());
        // connexion abandonnée en cours de route
        let session = coordinator.session(&addr(1)).unwrap();
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_broker_does_not_stall_polling() {
        let (radio, client, coordinator) = fleet(1, CoordinatorSettings::default());
        client.set_stalled(true);

        let aggregate = tokio::time::timeout(Duration::from_secs(60), coordinator.poll_once())
            .await
            .unwrap();
        assert!(aggregate[&addr(1)].is_online());

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(radio.feeder(&addr(1)).unwrap().io_count() >= 5);
        assert!(client.published.lock().is_empty());

        let started = tokio::time::Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycles_publish_in_order() {
        let (radio, _, coordinator) = fleet(2, CoordinatorSettings::default());
        let fast = radio.feeder(&addr(1)).unwrap();
        radio.feeder(&addr(2)).unwrap().set_latency(Duration::from_secs(2));

        let (first, second) = tokio::join!(coordinator.poll_once(), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            fast.set_levels(50, 33);
            coordinator.poll_once().await
        });

        assert_eq!(first[&addr(1)].food_level, Some(80));
        assert_eq!(second[&addr(1)].food_level, Some(33));
        assert!(Arc::ptr_eq(&coordinator.snapshot(), &second));
    }

    #[tokio::test]
    async fn test_local_snapshots_are_republished() {
        let (_, client, coordinator) = fleet(1, CoordinatorSettings::default());
        coordinator.poll_once().await;

        let topic = format!("petkit/w5/{}/status", addr(1).compact());
        let msgs = client.published_on(&topic);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["status"], "online");
    }

    #[tokio::test]
    async fn test_bus_sourced_snapshots_not_republished() {
        let (radio, client, coordinator) = fleet(1, CoordinatorSettings::default());
        radio.remove_feeder(&addr(1));
        let desc = coordinator.devices().remove(0);
        coordinator.handle_bus_message(
            &desc.device_state_topic(),
            br#"{"battery":40,"food_level":60}"#,
        );

        let aggregate = coordinator.poll_once().await;
        assert_eq!(aggregate[&addr(1)].battery, Some(40));
        assert!(client.published_on(&desc.status_topic()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_no_io() {
        let (radio, _, coordinator) = fleet(1, CoordinatorSettings::default());
        let err = coordinator.feed_device(addr(9), 10).await.unwrap_err();
        assert!(matches!(err, FeedError::UnknownDevice(_)));
        assert_eq!(radio.feeder(&addr(1)).unwrap().io_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_amount_surfaces() {
        let (_, _, coordinator) = fleet(1, CoordinatorSettings::default());
        assert!(matches!(
            coordinator.feed_device(addr(1), 0).await,
            Err(FeedError::InvalidAmount(0))
        ));
        assert!(matches!(
            coordinator.feed_device(addr(1), 501).await,
            Err(FeedError::InvalidAmount(501))
        ));
        assert!(matches!(
            coordinator.feed_device(addr(1), -3).await,
            Err(FeedError::InvalidAmount(-3))
        ));
    }

    #[tokio::test]
    async fn test_feed_refreshes_aggregate() {
        let (radio, _, coordinator) = fleet(1, CoordinatorSettings::default());
        coordinator.poll_once().await;
        let before = coordinator.snapshot()[&addr(1)].food_level;

        let mut rx = coordinator.subscribe();
        rx.borrow_and_update();
        assert!(coordinator.feed_device(addr(1), 50).await.unwrap());

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let after = rx.borrow()[&addr(1)].food_level;
        assert_eq!(before, Some(80));
        assert_eq!(after, Some(75));
        assert_eq!(radio.feeder(&addr(1)).unwrap().feeds(), vec![50]);
    }

    #[tokio::test]
    async fn test_undelivered_feed_returns_false() {
        let (radio, client, coordinator) = fleet(1, CoordinatorSettings::default());
        radio.feeder(&addr(1)).unwrap().set_connect(SimBehavior::Fail);
        client.set_failing(true);
        assert!(!coordinator.feed_device(addr(1), 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_inbound_command_triggers_feed() {
        let (radio, _, coordinator) = fleet(1, CoordinatorSettings::default());
        let desc = coordinator.devices().remove(0);

        let task = coordinator
            .handle_bus_message(&desc.command_topic(), br#"{"feed":20}"#)
            .unwrap();
        assert!(task.await.unwrap().unwrap());
        assert_eq!(radio.feeder(&addr(1)).unwrap().feeds(), vec![20]);

        assert!(coordinator
            .handle_bus_message(&desc.command_topic(), b"{oops")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_polls_and_stops() {
        let settings = CoordinatorSettings {
            poll_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let (radio, _, coordinator) = fleet(1, settings);
        let mut rx = coordinator.subscribe();

        coordinator.start();
        assert!(coordinator.is_running());
        rx.changed().await.unwrap();
        assert!(coordinator.snapshot()[&addr(1)].is_online());

        tokio::time::sleep(Duration::from_secs(61)).await;
        rx.changed().await.unwrap();
        assert!(radio.feeder(&addr(1)).unwrap().io_count() >= 3);

        coordinator.shutdown().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_bounded_with_hanging_disconnect() {
        let settings = CoordinatorSettings {
            shutdown_timeout: Duration::from_secs(3),
            timeouts: SessionTimeouts {
                disconnect: Duration::from_secs(3600),
                ..Default::default()
            },
            ..Default::default()
        };
        let (radio, _, coordinator) = fleet(2, settings);
        coordinator.poll_once().await;
        radio.feeder(&addr(1)).unwrap().set_disconnect(SimBehavior::Hang);

        let started = tokio::time::Instant::now();
        coordinator.shutdown().await;
        assert!(started.elapsed() <= Duration::from_secs(4));

        for i in 1..=2 {
            assert!(coordinator.session(&addr(i)).unwrap().is_closed());
        }
        // idempotent
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_devices_rejected() {
        let d = DeviceDescriptor::new(addr(1), "A", None);
        let result = Coordinator::new(
            CoordinatorSettings::default(),
            vec![d.clone(), d],
            Arc::new(SimRadio::new()),
            Arc::new(RecordingBus::default()),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateDevice(_))));
    }
}
