// src/io/mod.rs
//
// Transport abstraction for CommWatch wire sources.
// Provides a common adapter/handle interface for the supported transports
// (UART, CAN, Ethernet UDP/TCP, simulated SPI and I²C) so the session
// pipeline sees one timestamped byte-chunk stream regardless of the wire.

pub mod error;
pub mod sim;

pub mod can;
pub mod ethernet;
pub mod i2c;
pub mod spi;
pub mod uart;

pub use error::IoError;
pub use sim::{SimAction, SimMode, SimulatorConfig, SimulatorEvent, SimulatorScript};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ============================================================================
// Time
// ============================================================================

/// Current wall-clock time in nanoseconds since UNIX epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Per-handle clock whose readings never decrease.
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp in nanoseconds, clamped to be non-decreasing.
    pub fn next(&self) -> u64 {
        let now = now_ns();
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Transport family of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Uart,
    Spi,
    I2c,
    Can,
    Ethernet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Uart => "uart",
            DeviceType::Spi => "spi",
            DeviceType::I2c => "i2c",
            DeviceType::Can => "can",
            DeviceType::Ethernet => "ethernet",
        }
    }
}

/// Stable identity of a discovered wire endpoint. Immutable once enumerated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique within one enumeration
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// OS-specific locator (serial port path, CAN interface name, ...)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, String>,
}

impl DeviceInfo {
    /// Minimal entry with a generated id.
    pub fn new(name: &str, device_type: DeviceType, path: Option<String>) -> Self {
        DeviceInfo {
            id: format!("{}-{}", device_type.as_str(), uuid::Uuid::new_v4()),
            name: name.to_string(),
            device_type,
            path,
            vendor: None,
            product: None,
            manufacturer: None,
            serial_number: None,
            metadata: HashMap::new(),
        }
    }

    /// The simulator entry every adapter exposes.
    pub fn simulator(device_type: DeviceType) -> Self {
        let mut info = DeviceInfo::new(
            &format!("{} simulator", device_type.as_str()),
            device_type,
            None,
        );
        info.id = format!("{}-sim", device_type.as_str());
        info.metadata
            .insert("simulated".to_string(), "true".to_string());
        info
    }

    pub fn is_simulator(&self) -> bool {
        self.metadata.get("simulated").map(|v| v.as_str()) == Some("true")
    }

    /// Label used in error messages and logs, e.g. "uart(/dev/ttyUSB0)".
    pub fn label(&self) -> String {
        match &self.path {
            Some(path) => format!("{}({})", self.device_type.as_str(), path),
            None => format!("{}({})", self.device_type.as_str(), self.id),
        }
    }
}

// ============================================================================
// Open Options
// ============================================================================

/// Parity setting for UART lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Stop bit count. Serialized as the JSON number 1, 1.5 or 2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl Serialize for StopBits {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StopBits::One => serializer.serialize_u8(1),
            StopBits::OnePointFive => serializer.serialize_f64(1.5),
            StopBits::Two => serializer.serialize_u8(2),
        }
    }
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if value == 1.0 {
            Ok(StopBits::One)
        } else if value == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if value == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid stop bits: {} (expected 1, 1.5 or 2)",
                value
            )))
        }
    }
}

/// Flow-control line selection for UART.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlLine {
    Rts,
    Cts,
    Dtr,
    Dsr,
    #[serde(rename = "xon-xoff")]
    XonXoff,
}

/// SPI bit transmission order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitOrder {
    #[default]
    Msb,
    Lsb,
}

/// Ethernet transport selection. Raw link-layer capture is accepted on
/// input for config compatibility but refused at open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EthProtocol {
    #[default]
    Udp,
    Tcp,
    Raw,
}

/// One CAN acceptance filter rule.
/// A message passes when `(msg.id & mask) == (id & mask)` and `extended` is
/// unset or equals the message's extended flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilterRule {
    pub id: u32,
    pub mask: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extended: Option<bool>,
}

impl CanFilterRule {
    pub fn matches(&self, msg_id: u32, msg_ext: bool) -> bool {
        (msg_id & self.mask) == (self.id & self.mask)
            && self.extended.map(|e| e == msg_ext).unwrap_or(true)
    }
}

/// Superset options record covering every transport. Each transport reads
/// only the fields relevant to it and ignores the rest; every field is
/// optional so the same record works for `open` and partial `set_options`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterOpenOptions {
    // UART
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_bits: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<StopBits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parity: Option<Parity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_control: Option<Vec<FlowControlLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,

    // SPI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spi_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_speed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_order: Option<BitOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cs_polarity: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cs_hold_time: Option<u32>,

    // I²C
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c_bus_speed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c_address_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c_slave_address: Option<u16>,

    // CAN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_bitrate: Option<u32>,
    #[serde(rename = "canFD", skip_serializing_if = "Option::is_none")]
    pub can_fd: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_listen_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_filters: Option<Vec<CanFilterRule>>,

    // Ethernet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_protocol: Option<EthProtocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_multicast: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_bpf_filter: Option<String>,
}

impl AdapterOpenOptions {
    pub const DEFAULT_BAUD: u32 = 115_200;
    pub const DEFAULT_DATA_BITS: u8 = 8;
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;
}

// ============================================================================
// Stats and Rx Metadata
// ============================================================================

/// Per-handle counters. Monotonic except `uptime_ms`, computed on read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub messages_rx: u64,
    pub messages_tx: u64,
    pub errors: u64,
    pub uptime_ms: u64,
}

/// Chunk direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

/// Transport-specific metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportValue {
    U32(u32),
    Bool(bool),
    Str(String),
}

/// Per-chunk metadata attached by the adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RxMeta {
    /// Nanosecond timestamp, non-decreasing within one handle
    pub timestamp_ns: u64,
    pub direction: Direction,
    /// Chunk length in bytes
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transport_specific: Option<HashMap<String, TransportValue>>,
}

// ============================================================================
// Subscribers
// ============================================================================

/// Callback invoked once per received chunk.
pub type RxCallback = Box<dyn Fn(&[u8], &RxMeta) + Send + Sync>;

/// Token returned by `read`; passes to `unsubscribe` to cancel the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Ordered set of rx subscribers for one handle.
///
/// Dispatch is serialized: callbacks run in registration order on the
/// handle's source task. A panicking callback is caught and logged so it
/// cannot block the remaining subscribers.
pub struct SubscriberSet {
    subscribers: Mutex<Vec<(u64, RxCallback)>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub fn new() -> Self {
        SubscriberSet {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: RxCallback) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push((id, callback));
        }
        SubscriptionToken(id)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|(id, _)| *id != token.0);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber in registration order.
    pub fn dispatch(&self, bytes: &[u8], meta: &RxMeta) {
        if let Ok(subs) = self.subscribers.lock() {
            for (id, callback) in subs.iter() {
                if catch_unwind(AssertUnwindSafe(|| callback(bytes, meta))).is_err() {
                    tlog!("[io] rx subscriber {} panicked; continuing", id);
                }
            }
        }
    }
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Handle Core
// ============================================================================

#[derive(Default)]
struct Counters {
    bytes_rx: u64,
    bytes_tx: u64,
    messages_rx: u64,
    messages_tx: u64,
    errors: u64,
}

/// State shared by every handle implementation: identity, counters,
/// subscriber set, close flag and the per-handle monotonic clock.
pub struct HandleCore {
    device: DeviceInfo,
    opened_at: Instant,
    closed: AtomicBool,
    subscribers: SubscriberSet,
    clock: MonotonicClock,
    counters: Mutex<Counters>,
}

impl HandleCore {
    pub fn new(device: DeviceInfo) -> Self {
        HandleCore {
            device,
            opened_at: Instant::now(),
            closed: AtomicBool::new(false),
            subscribers: SubscriberSet::new(),
            clock: MonotonicClock::new(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Err(Closed) once `mark_closed` has run.
    pub fn ensure_open(&self) -> Result<(), IoError> {
        if self.is_closed() {
            Err(IoError::closed(&self.device.label()))
        } else {
            Ok(())
        }
    }

    /// Flip the closed flag and drop all subscribers.
    /// Returns false when the handle was already closed (idempotent close).
    pub fn mark_closed(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        if was_open {
            self.subscribers.clear();
        }
        was_open
    }

    pub fn subscribe(&self, callback: RxCallback) -> SubscriptionToken {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscribers.unsubscribe(token);
    }

    /// Deliver one rx chunk: stamp it, count it, fan out to subscribers.
    pub fn deliver_rx(
        &self,
        bytes: &[u8],
        transport_specific: Option<HashMap<String, TransportValue>>,
        error: Option<String>,
    ) {
        if self.is_closed() {
            return;
        }
        let meta = RxMeta {
            timestamp_ns: self.clock.next(),
            direction: Direction::Rx,
            length: bytes.len(),
            error,
            transport_specific,
        };
        if let Ok(mut counters) = self.counters.lock() {
            counters.bytes_rx += bytes.len() as u64;
            counters.messages_rx += 1;
        }
        self.subscribers.dispatch(bytes, &meta);
    }

    /// Count one successful transmit.
    pub fn record_tx(&self, len: usize) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.bytes_tx += len as u64;
            counters.messages_tx += 1;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.errors += 1;
        }
    }

    /// Snapshot of the counters with uptime computed from the open instant.
    pub fn stats(&self) -> AdapterStats {
        let counters = self.counters.lock();
        let uptime_ms = self.opened_at.elapsed().as_millis() as u64;
        match counters {
            Ok(c) => AdapterStats {
                bytes_rx: c.bytes_rx,
                bytes_tx: c.bytes_tx,
                messages_rx: c.messages_rx,
                messages_tx: c.messages_tx,
                errors: c.errors,
                uptime_ms,
            },
            Err(_) => AdapterStats {
                uptime_ms,
                ..AdapterStats::default()
            },
        }
    }
}

// ============================================================================
// Adapter and Handle Traits
// ============================================================================

/// One open wire (or simulator) endpoint.
#[async_trait]
pub trait AdapterHandle: Send + Sync {
    /// The device this handle was opened on.
    fn device(&self) -> &DeviceInfo;

    /// Transmit the bytes as one logical frame.
    async fn write(&self, bytes: &[u8]) -> Result<(), IoError>;

    /// Register a subscriber invoked once per received chunk.
    /// Subscribers run in registration order; a panicking subscriber is
    /// caught and logged without blocking the others.
    fn read(&self, callback: RxCallback) -> SubscriptionToken;

    /// Cancel a subscription. No further callbacks after this returns.
    fn unsubscribe(&self, token: SubscriptionToken);

    /// Apply a subset of the original options to the live handle.
    async fn set_options(&self, options: &AdapterOpenOptions) -> Result<(), IoError>;

    /// Release resources, cancel internal timers, clear subscribers.
    /// Idempotent; all later calls on the handle fail with `Closed`.
    async fn close(&self) -> Result<(), IoError>;

    /// Snapshot of the counters.
    fn stats(&self) -> AdapterStats;
}

/// Factory for one transport family.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn transport(&self) -> DeviceType;

    /// Enumerate currently visible endpoints. Where enumeration is not
    /// supported, returns a single simulator entry.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError>;

    /// Acquire the wire.
    async fn open(
        &self,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError>;

    fn supports_simulation(&self) -> bool {
        true
    }

    /// Build a handle indistinguishable from a real one for read/write.
    async fn create_simulator(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<dyn AdapterHandle>, IoError>;
}

/// Look up the adapter implementation for a device type.
pub fn adapter_for(device_type: DeviceType) -> Arc<dyn TransportAdapter> {
    match device_type {
        DeviceType::Uart => Arc::new(uart::UartAdapter::new()),
        DeviceType::Can => Arc::new(can::CanAdapter::new()),
        DeviceType::Ethernet => Arc::new(ethernet::EthernetAdapter::new()),
        DeviceType::Spi => Arc::new(spi::SpiAdapter::new()),
        DeviceType::I2c => Arc::new(i2c::I2cAdapter::new()),
    }
}

// ============================================================================
// Tests
// ============================================================================
