//! In-process simulated feeders.
//!
//! A `SimRadio` holds a set of `SimFeeder`s keyed by address. Each feeder
//! answers status reads with real encoded status frames, validates feed
//! frames written to it and can be told to refuse, hang or corrupt any
//! operation. Used by the tests and by `simulate: true` mode. Hanging
//! operations never complete; callers rely on their own timeouts, and with
//! tokio's paused clock those fire instantly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::radio::{Radio, RadioLink, FEED_CHAR_UUID, STATUS_CHAR_UUID};
use crate::codec::{self, FRAME_LEN, OP_FEED};
use crate::error::RadioError;
use crate::models::DeviceAddress;

/// How a simulated operation behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBehavior {
    #[default]
    Normal,
    /// Fails immediately.
    Fail,
    /// Never completes.
    Hang,
}

#[derive(Debug)]
struct SimFeederState {
    battery: u8,
    food_level: u8,
    connect: SimBehavior,
    read: SimBehavior,
    write: SimBehavior,
    disconnect: SimBehavior,
    corrupt_status: bool,
    latency: Duration,
    write_latency: Duration,
    feeds: Vec<u16>,
}

/// One simulated feeder.
#[derive(Debug)]
pub struct SimFeeder {
    address: DeviceAddress,
    state: Mutex<SimFeederState>,
    connects: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    disconnects: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Compte une opération radio en cours sur un distributeur.
struct InFlight<'a>(&'a SimFeeder);

impl<'a> InFlight<'a> {
    fn enter(feeder: &'a SimFeeder) -> Self {
        let now = feeder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        feeder.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(feeder)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimFeeder {
    fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            state: Mutex::new(SimFeederState {
                battery: 95,
                food_level: 80,
                connect: SimBehavior::Normal,
                read: SimBehavior::Normal,
                write: SimBehavior::Normal,
                disconnect: SimBehavior::Normal,
                corrupt_status: false,
                latency: Duration::ZERO,
                write_latency: Duration::ZERO,
                feeds: Vec::new(),
            }),
            connects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn set_levels(&self, battery: u8, food_level: u8) {
        let mut st = self.state.lock();
        st.battery = battery;
        st.food_level = food_level;
    }

    pub fn levels(&self) -> (u8, u8) {
        let st = self.state.lock();
        (st.battery, st.food_level)
    }

    pub fn set_connect(&self, behavior: SimBehavior) {
        self.state.lock().connect = behavior;
    }

    pub fn set_read(&self, behavior: SimBehavior) {
        self.state.lock().read = behavior;
    }

    pub fn set_write(&self, behavior: SimBehavior) {
        self.state.lock().write = behavior;
    }

    pub fn set_disconnect(&self, behavior: SimBehavior) {
        self.state.lock().disconnect = behavior;
    }

    /// Status frames are sent with a broken checksum.
    pub fn set_corrupt_status(&self, corrupt: bool) {
        self.state.lock().corrupt_status = corrupt;
    }

    /// Delay applied before every connect.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Delay applied before every write is answered.
    pub fn set_write_latency(&self, latency: Duration) {
        self.state.lock().write_latency = latency;
    }

    /// Highest number of radio operations ever running at once on this feeder.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Amounts (grams) accepted by this feeder, oldest first.
    pub fn feeds(&self) -> Vec<u16> {
        self.state.lock().feeds.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Total radio operations seen (connects, reads, writes).
    pub fn io_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
            + self.reads.load(Ordering::SeqCst)
            + self.writes.load(Ordering::SeqCst)
    }

    fn status_frame(&self) -> Vec<u8> {
        let st = self.state.lock();
        let mut bytes = codec::encode_status(st.battery, st.food_level).as_bytes().to_vec();
        if st.corrupt_status {
            bytes[FRAME_LEN - 1] = bytes[FRAME_LEN - 1].wrapping_add(1);
        }
        bytes
    }

    fn accept_feed(&self, data: &[u8]) -> Result<(), RadioError> {
        if data.len() != FRAME_LEN
            || data[FRAME_LEN - 1] != codec::checksum(&data[..FRAME_LEN - 1])
            || data[1] != OP_FEED
        {
            return Err(RadioError::Io("feeder rejected malformed frame".into()));
        }
        let amount = u16::from_le_bytes([data[2], data[3]]);
        let mut st = self.state.lock();
        st.feeds.push(amount);
        // 10 g de croquettes ~ 1 % de la trémie
        let used = u8::try_from((amount / 10).max(1)).unwrap_or(u8::MAX);
        st.food_level = st.food_level.saturating_sub(used);
        Ok(())
    }
}

/// Simulated BLE central.
#[derive(Debug, Default, Clone)]
pub struct SimRadio {
    feeders: Arc<Mutex<HashMap<DeviceAddress, Arc<SimFeeder>>>>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feeder in range; returns its control handle.
    pub fn add_feeder(&self, address: DeviceAddress) -> Arc<SimFeeder> {
        self.feeders
            .lock()
            .entry(address)
            .or_insert_with(|| Arc::new(SimFeeder::new(address)))
            .clone()
    }

    pub fn feeder(&self, address: &DeviceAddress) -> Option<Arc<SimFeeder>> {
        self.feeders.lock().get(address).cloned()
    }

    /// Take a feeder out of range.
    pub fn remove_feeder(&self, address: &DeviceAddress) {
        self.feeders.lock().remove(address);
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn connect(&self, address: &DeviceAddress) -> Result<Box<dyn RadioLink>, RadioError> {
        let feeder = self
            .feeder(address)
            .ok_or(RadioError::Unreachable(*address))?;
        feeder.connects.fetch_add(1, Ordering::SeqCst);
        let _busy = InFlight::enter(&feeder);

        let (behavior, latency) = {
            let st = feeder.state.lock();
            (st.connect, st.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match behavior {
            SimBehavior::Normal => Ok(Box::new(SimLink {
                feeder: feeder.clone(),
                connected: AtomicBool::new(true),
            })),
            SimBehavior::Fail => Err(RadioError::Unreachable(*address)),
            SimBehavior::Hang => std::future::pending().await,
        }
    }
}

struct SimLink {
    feeder: Arc<SimFeeder>,
    connected: AtomicBool,
}

impl SimLink {
    fn ensure_connected(&self) -> Result<(), RadioError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RadioError::Disconnected)
        }
    }
}

#[async_trait]
impl RadioLink for SimLink {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, RadioError> {
        self.ensure_connected()?;
        self.feeder.reads.fetch_add(1, Ordering::SeqCst);
        let _busy = InFlight::enter(&self.feeder);
        if characteristic != STATUS_CHAR_UUID {
            return Err(RadioError::MissingCharacteristic(characteristic));
        }
        let behavior = self.feeder.state.lock().read;
        match behavior {
            SimBehavior::Normal => Ok(self.feeder.status_frame()),
            SimBehavior::Fail => {
                // Une lecture ratée coupe le lien, comme sur le vrai matériel
                self.connected.store(false, Ordering::SeqCst);
                Err(RadioError::Io("GATT read failed".into()))
            }
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), RadioError> {
        self.ensure_connected()?;
        self.feeder.writes.fetch_add(1, Ordering::SeqCst);
        let _busy = InFlight::enter(&self.feeder);
        if characteristic != FEED_CHAR_UUID {
            return Err(RadioError::MissingCharacteristic(characteristic));
        }
        let (behavior, latency) = {
            let st = self.feeder.state.lock();
            (st.write, st.write_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match behavior {
            SimBehavior::Normal => self.feeder.accept_feed(data),
            SimBehavior::Fail => {
                self.connected.store(false, Ordering::SeqCst);
                Err(RadioError::Io("GATT write failed".into()))
            }
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.feeder.disconnects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.feeder.state.lock().disconnect;
        self.connected.store(false, Ordering::SeqCst);
        match behavior {
            SimBehavior::Normal => Ok(()),
            SimBehavior::Fail => Err(RadioError::Io("disconnect failed".into())),
            SimBehavior::Hang => std::future::pending().await,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
