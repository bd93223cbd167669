// src/io/sim.rs
//
// Simulator engine shared by every transport adapter.
//
// A SimulatorHandle satisfies the same read/write contract as a real handle:
// loopback echoes writes back to subscribers, scripted mode walks an event
// timeline, burst mode synthesizes deterministic traffic, and error-inject
// drops synthesized chunks with a configured probability. SPI/I²C plug their
// memory models in as write responders.

use super::{
    AdapterHandle, AdapterOpenOptions, AdapterStats, DeviceInfo, DeviceType, HandleCore, IoError,
    RxCallback, SubscriptionToken, TransportValue,
};
use crate::codec::{EfuseCodec, FieldValue, ProtocolDecoder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Simulator operating mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimMode {
    #[default]
    Loopback,
    Scripted,
    Burst,
    #[serde(rename = "error-inject")]
    ErrorInject,
}

/// Scripted timeline action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimAction {
    Send,
    Receive,
    Error,
    Disconnect,
}

/// One step of a scripted timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorEvent {
    pub delay_ms: u64,
    pub action: SimAction,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Vec<u8>>,
}

/// Ordered event list, optionally looping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorScript {
    pub events: Vec<SimulatorEvent>,
    #[serde(rename = "loop", default)]
    pub looped: bool,
}

/// Simulator configuration shared by all transports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    pub mode: SimMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<SimulatorScript>,
    /// Per-chunk drop probability in [0, 1]
    pub error_rate: f64,
    pub burst_size: u32,
    pub burst_interval_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            mode: SimMode::Loopback,
            script: None,
            error_rate: 0.0,
            burst_size: 1,
            burst_interval_ms: 100,
        }
    }
}

impl SimulatorConfig {
    pub fn loopback() -> Self {
        SimulatorConfig::default()
    }

    pub fn burst(burst_size: u32, burst_interval_ms: u64) -> Self {
        SimulatorConfig {
            mode: SimMode::Burst,
            burst_size,
            burst_interval_ms,
            ..SimulatorConfig::default()
        }
    }

    pub fn scripted(script: SimulatorScript) -> Self {
        SimulatorConfig {
            mode: SimMode::Scripted,
            script: Some(script),
            ..SimulatorConfig::default()
        }
    }
}

// ============================================================================
// Write Responders
// ============================================================================

/// Reply synthesized for one write.
pub struct SimReply {
    pub data: Vec<u8>,
    pub transport_specific: Option<HashMap<String, TransportValue>>,
    pub error: Option<String>,
}

impl SimReply {
    pub fn bytes(data: Vec<u8>) -> Self {
        SimReply {
            data,
            transport_specific: None,
            error: None,
        }
    }
}

/// Maps a written frame to the chunk delivered back to subscribers.
/// The SPI and I²C memory models implement this.
pub trait SimResponder: Send + Sync {
    fn respond(&self, write: &[u8]) -> Option<SimReply>;
}

// ============================================================================
// Burst Synthesis
// ============================================================================

/// Per-transport flavour of synthesized burst traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurstProfile {
    /// EFuse ADC frames with a sinusoidal 12-bit sample (UART and the
    /// byte-stream transports)
    EfuseAdc,
    /// Rotating synthetic CAN traffic in the normalized CAN chunk layout
    CanTraffic,
}

impl BurstProfile {
    pub fn for_transport(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Can => BurstProfile::CanTraffic,
            _ => BurstProfile::EfuseAdc,
        }
    }
}

/// 12-bit ADC sample centred on 2048 with amplitude 500.
fn sine_sample(counter: u64) -> u16 {
    let angle = counter as f64 * 0.1;
    (2048.0 + 500.0 * angle.sin()).round() as u16
}

/// Synthesize the `counter`-th burst chunk for the profile.
pub fn synthesize_burst(
    profile: BurstProfile,
    counter: u64,
) -> (Vec<u8>, Option<HashMap<String, TransportValue>>) {
    match profile {
        BurstProfile::EfuseAdc => {
            let sample = sine_sample(counter);
            let mut fields = HashMap::new();
            fields.insert("type".to_string(), FieldValue::U8(0x01));
            fields.insert(
                "payload".to_string(),
                FieldValue::Bytes(sample.to_be_bytes().to_vec()),
            );
            // Encoding a two-byte payload cannot fail
            let bytes = EfuseCodec.encode(&fields).unwrap_or_default();
            (bytes, None)
        }
        BurstProfile::CanTraffic => {
            let (id, data): (u32, [u8; 8]) = if counter % 10 == 9 {
                // OBD-II mode 01 PID 0x0C request every tenth tick
                (0x7E0, [0x02, 0x01, 0x0C, 0, 0, 0, 0, 0])
            } else {
                match counter % 3 {
                    0 => {
                        // Engine RPM
                        let rpm = 800 + (counter % 100) as u16 * 25;
                        let [hi, lo] = rpm.to_be_bytes();
                        (0x100, [hi, lo, 0, 0, 0, 0, 0, 0])
                    }
                    1 => {
                        // Vehicle speed in km/h
                        let speed = (counter % 120) as u8;
                        (0x200, [speed, 0, 0, 0, 0, 0, 0, 0])
                    }
                    _ => {
                        // Coolant temperature
                        let temp = 70 + (counter % 30) as u8;
                        (0x300, [temp, 0, 0, 0, 0, 0, 0, 0])
                    }
                }
            };
            let bytes = super::can::encode_normalized(id, &data);
            let meta = super::can::transport_meta(id, false, false, data.len() as u8);
            (bytes, Some(meta))
        }
    }
}

// ============================================================================
// Simulator Handle
// ============================================================================

/// A handle that synthesizes rx traffic and/or loops back tx traffic without
/// any wire I/O. Indistinguishable from a real handle for read/write.
pub struct SimulatorHandle {
    core: Arc<HandleCore>,
    config: SimulatorConfig,
    /// Loopback/responder reply latency
    latency: Duration,
    responder: Option<Arc<dyn SimResponder>>,
    stop: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Writes currently waiting on their loopback delivery
    pending_replies: Arc<AtomicU64>,
}

impl SimulatorHandle {
    /// Default loopback latency for byte-stream transports.
    pub const DEFAULT_LATENCY_MS: u64 = 10;

    /// Build and start the simulator for one transport.
    pub fn spawn(
        device_type: DeviceType,
        config: SimulatorConfig,
        latency_ms: u64,
        responder: Option<Arc<dyn SimResponder>>,
    ) -> Arc<Self> {
        let device = DeviceInfo::simulator(device_type);
        let handle = Arc::new(SimulatorHandle {
            core: Arc::new(HandleCore::new(device)),
            config: config.clone(),
            latency: Duration::from_millis(latency_ms),
            responder,
            stop: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            pending_replies: Arc::new(AtomicU64::new(0)),
        });

        match config.mode {
            SimMode::Scripted => handle.spawn_script_task(),
            SimMode::Burst => handle.spawn_burst_task(device_type),
            SimMode::Loopback | SimMode::ErrorInject => {}
        }

        tlog!(
            "[sim] {} simulator started (mode: {:?}, errorRate: {})",
            device_type.as_str(),
            config.mode,
            config.error_rate
        );

        handle
    }

    /// Roll the error-inject dice for one synthesized chunk.
    /// True means the chunk is discarded and `errors` incremented instead.
    fn should_drop(config: &SimulatorConfig, core: &HandleCore) -> bool {
        if config.error_rate > 0.0 && rand::random::<f64>() < config.error_rate {
            core.record_error();
            return true;
        }
        false
    }

    fn spawn_script_task(self: &Arc<Self>) {
        let script = match self.config.script.clone() {
            Some(s) if !s.events.is_empty() => s,
            _ => return,
        };
        let core = self.core.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            loop {
                for event in &script.events {
                    tokio::time::sleep(Duration::from_millis(event.delay_ms)).await;
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    match event.action {
                        SimAction::Send | SimAction::Receive => {
                            let data = event.data.clone().unwrap_or_default();
                            if !Self::should_drop(&config, &core) {
                                core.deliver_rx(&data, None, None);
                            }
                        }
                        SimAction::Error => {
                            core.record_error();
                        }
                        SimAction::Disconnect => {
                            tlog!("[sim] scripted disconnect");
                            return;
                        }
                    }
                }
                if !script.looped {
                    return;
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    fn spawn_burst_task(self: &Arc<Self>, device_type: DeviceType) {
        let profile = BurstProfile::for_transport(device_type);
        let core = self.core.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();
        let interval = Duration::from_millis(self.config.burst_interval_ms.max(1));
        let burst_size = self.config.burst_size.max(1);

        let task = tokio::spawn(async move {
            let mut counter: u64 = 0;
            loop {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                for _ in 0..burst_size {
                    let (bytes, meta) = synthesize_burst(profile, counter);
                    counter += 1;
                    if !Self::should_drop(&config, &core) {
                        core.deliver_rx(&bytes, meta, None);
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Schedule the delayed reply for one write.
    fn spawn_reply(&self, reply: SimReply) {
        let core = self.core.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();
        let latency = self.latency;
        let pending = self.pending_replies.clone();

        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if !stop.load(Ordering::SeqCst) && !Self::should_drop(&config, &core) {
                core.deliver_rx(&reply.data, reply.transport_specific, reply.error);
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl AdapterHandle for SimulatorHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.core.ensure_open()?;
        self.core.record_tx(bytes.len());

        if let Some(responder) = &self.responder {
            if let Some(reply) = responder.respond(bytes) {
                self.spawn_reply(reply);
            }
        } else if matches!(self.config.mode, SimMode::Loopback | SimMode::ErrorInject) {
            self.spawn_reply(SimReply::bytes(bytes.to_vec()));
        }

        Ok(())
    }

    fn read(&self, callback: RxCallback) -> SubscriptionToken {
        self.core.subscribe(callback)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.core.unsubscribe(token);
    }

    async fn set_options(&self, _options: &AdapterOpenOptions) -> Result<(), IoError> {
        self.core.ensure_open()
    }

    async fn close(&self) -> Result<(), IoError> {
        if self.core.mark_closed() {
            self.stop.store(true, Ordering::SeqCst);
            if let Ok(mut tasks) = self.tasks.lock() {
                for task in tasks.drain(..) {
                    task.abort();
                }
            }
            tlog!("[sim] {} closed", self.core.device().label());
        }
        Ok(())
    }

    fn stats(&self) -> AdapterStats {
        self.core.stats()
    }
}

// ============================================================================
// Tests
// ============================================================================
