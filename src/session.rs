// src/session.rs
//
// Session pipeline: owns the single live handle, assigns monotonic frame
// ids, timestamps incoming chunks, runs decode + validate, appends to the
// session log and fans out events on the bus.

use crate::bus::{Event, EventBus};
use crate::codec::{CodecRegistry, DecodedFrame, FrameError, ProtocolDecoder};
use crate::io::{
    now_ns, AdapterHandle, AdapterOpenOptions, AdapterStats, DeviceInfo, Direction, IoError,
    RxMeta, SubscriptionToken, TransportAdapter,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Protocol Frames
// ============================================================================

/// The observed unit in a session: raw chunk plus decode/validate results.
/// Created by the pipeline, appended to the session log, immutable after.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolFrame {
    /// Unique within the session, strictly monotonic in insertion order
    pub id: u64,
    pub timestamp_ns: u64,
    pub direction: Direction,
    pub raw: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub decoded: Option<DecodedFrame>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<FrameError>,
}

// ============================================================================
// Pipeline
// ============================================================================

struct LiveHandle {
    handle: Arc<dyn AdapterHandle>,
    token: SubscriptionToken,
}

/// Shared ingest state captured by the rx subscriber closure.
struct Ingest {
    log: Mutex<Vec<ProtocolFrame>>,
    next_id: AtomicU64,
    decoder: Mutex<Arc<dyn ProtocolDecoder>>,
    bus: Arc<EventBus>,
}

impl Ingest {
    /// Process one chunk: id, timestamp, decode, validate, append, publish.
    fn ingest(&self, bytes: &[u8], meta: &RxMeta) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp_ns = if meta.timestamp_ns != 0 {
            meta.timestamp_ns
        } else {
            now_ns()
        };

        let decoder = self
            .decoder
            .lock()
            .expect("decoder lock poisoned")
            .clone();
        let decoded = decoder.decode(bytes);
        let error = decoder.validate(bytes);

        let frame = Arc::new(ProtocolFrame {
            id,
            timestamp_ns,
            direction: meta.direction,
            raw: bytes.to_vec(),
            decoded,
            error: error.clone(),
        });

        if let Ok(mut log) = self.log.lock() {
            log.push((*frame).clone());
        }

        self.bus.publish(&Event::FrameReceived(frame));
        if let Some(error) = error {
            self.bus.publish(&Event::FrameError {
                frame_id: id,
                error,
            });
        }
    }

    /// Record an outbound frame that was successfully written.
    fn record_tx(&self, bytes: &[u8], timestamp_ns: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let decoder = self
            .decoder
            .lock()
            .expect("decoder lock poisoned")
            .clone();

        let frame = Arc::new(ProtocolFrame {
            id,
            timestamp_ns,
            direction: Direction::Tx,
            raw: bytes.to_vec(),
            decoded: decoder.decode(bytes),
            error: decoder.validate(bytes),
        });

        if let Ok(mut log) = self.log.lock() {
            log.push((*frame).clone());
        }
        self.bus.publish(&Event::FrameSent(frame));
        id
    }
}

/// The transport-agnostic decode pipeline for one connection.
pub struct SessionPipeline {
    bus: Arc<EventBus>,
    registry: CodecRegistry,
    ingest: Arc<Ingest>,
    live: Mutex<Option<LiveHandle>>,
}

impl SessionPipeline {
    /// Pipeline with the default decoder (EFuse).
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = CodecRegistry::with_defaults();
        let decoder = registry.get("efuse").expect("default codec missing");
        SessionPipeline {
            ingest: Arc::new(Ingest {
                log: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                decoder: Mutex::new(decoder),
                bus: bus.clone(),
            }),
            bus,
            registry,
            live: Mutex::new(None),
        }
    }

    /// Pipeline configured for a specific protocol.
    /// Unknown protocol ids are a synchronous configuration error.
    pub fn with_protocol(protocol: &str) -> Result<Self, IoError> {
        let pipeline = SessionPipeline::new();
        pipeline.set_protocol(protocol)?;
        Ok(pipeline)
    }

    /// Switch the session decoder.
    pub fn set_protocol(&self, protocol: &str) -> Result<(), IoError> {
        let decoder = self
            .registry
            .get(protocol)
            .ok_or_else(|| IoError::config(format!("unknown protocol: {}", protocol)))?;
        if let Ok(mut slot) = self.ingest.decoder.lock() {
            *slot = decoder;
        }
        Ok(())
    }

    /// The protocol currently decoding this session.
    pub fn protocol(&self) -> &'static str {
        self.ingest
            .decoder
            .lock()
            .map(|d| d.protocol())
            .unwrap_or("efuse")
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.live.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    /// Open a device through its adapter and start ingesting its chunks.
    pub async fn connect(
        &self,
        adapter: &dyn TransportAdapter,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<(), IoError> {
        if self.is_connected() {
            return Err(IoError::config("session already has a live handle"));
        }
        let handle = adapter.open(device, options).await?;
        self.attach(handle);
        Ok(())
    }

    /// Start ingesting from a simulator handle.
    pub async fn connect_simulator(
        &self,
        adapter: &dyn TransportAdapter,
        config: &crate::io::SimulatorConfig,
    ) -> Result<(), IoError> {
        if self.is_connected() {
            return Err(IoError::config("session already has a live handle"));
        }
        let handle = adapter.create_simulator(config).await?;
        self.attach(handle);
        Ok(())
    }

    /// Subscribe the pipeline to an already-open handle.
    pub fn attach(&self, handle: Arc<dyn AdapterHandle>) {
        let ingest = self.ingest.clone();
        let token = handle.read(Box::new(move |bytes, meta| {
            ingest.ingest(bytes, meta);
        }));

        let device = handle.device().clone();
        if let Ok(mut live) = self.live.lock() {
            *live = Some(LiveHandle { handle, token });
        }
        tlog!("[session] connected to {}", device.label());
        self.bus.publish(&Event::DeviceConnected { device });
    }

    /// Record a tx frame and write it to the wire. The frame's timestamp is
    /// captured before the write; a failed write records nothing.
    pub async fn send(&self, bytes: &[u8]) -> Result<u64, IoError> {
        let handle = {
            let live = self
                .live
                .lock()
                .map_err(|_| IoError::config("session lock poisoned"))?;
            live.as_ref()
                .map(|l| l.handle.clone())
                .ok_or_else(|| IoError::config("no live handle"))?
        };

        let timestamp_ns = now_ns();
        match handle.write(bytes).await {
            Ok(()) => Ok(self.ingest.record_tx(bytes, timestamp_ns)),
            Err(e) => {
                self.bus.publish(&Event::DeviceError {
                    device: Some(handle.device().clone()),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Unsubscribe, close the handle and announce the disconnect.
    pub async fn disconnect(&self) -> Result<(), IoError> {
        let live = {
            let mut guard = self
                .live
                .lock()
                .map_err(|_| IoError::config("session lock poisoned"))?;
            guard.take()
        };

        if let Some(live) = live {
            live.handle.unsubscribe(live.token);
            let device = live.handle.device().clone();
            live.handle.close().await?;
            tlog!("[session] disconnected from {}", device.label());
            self.bus.publish(&Event::DeviceDisconnected { device });
        }
        Ok(())
    }

    /// Stats snapshot of the live handle, if any.
    pub fn stats(&self) -> Option<AdapterStats> {
        self.live
            .lock()
            .ok()
            .and_then(|l| l.as_ref().map(|l| l.handle.stats()))
    }

    /// Publish the current stats snapshot on the bus.
    pub fn publish_stats(&self) {
        if let Some(stats) = self.stats() {
            self.bus.publish(&Event::StatsUpdate(stats));
        }
    }

    /// Snapshot of the session log.
    pub fn frames(&self) -> Vec<ProtocolFrame> {
        self.ingest.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn frame_count(&self) -> usize {
        self.ingest.log.lock().map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for SessionPipeline {
    fn default() -> Self {
        SessionPipeline::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::codec::{EfuseCodec, FieldValue};
    use crate::io::uart::UartAdapter;
    use crate::io::SimulatorConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn adc_frame() -> Vec<u8> {
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), FieldValue::U8(0x01));
        fields.insert(
            "payload".to_string(),
            FieldValue::Bytes(vec![0x08, 0x00]),
        );
        EfuseCodec.encode(&fields).unwrap()
    }

    #[tokio::test]
    async fn test_loopback_session_decodes_frames() {
        let pipeline = SessionPipeline::new();
        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .unwrap();

        pipeline.send(&adc_frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        pipeline.disconnect().await.unwrap();

        let frames = pipeline.frames();
        assert_eq!(frames.len(), 2);

        // First recorded frame is the tx, then the loopback rx
        assert_eq!(frames[0].direction, Direction::Tx);
        assert_eq!(frames[1].direction, Direction::Rx);
        assert_eq!(frames[1].raw, adc_frame());

        let decoded = frames[1].decoded.as_ref().unwrap();
        assert_eq!(decoded.field("adc_raw").unwrap().value, FieldValue::U16(2048));
        assert!(decoded.checksum.as_ref().unwrap().valid);
        assert!(frames[1].error.is_none());
    }

    #[tokio::test]
    async fn test_frame_ids_strictly_monotonic() {
        let pipeline = SessionPipeline::new();
        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::burst(2, 30))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.disconnect().await.unwrap();

        let frames = pipeline.frames();
        assert!(frames.len() >= 4);
        for pair in frames.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp_ns <= pair[1].timestamp_ns);
        }
    }

    #[tokio::test]
    async fn test_validation_error_is_attached_not_fatal() {
        let pipeline = SessionPipeline::new();
        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .unwrap();

        // ADC frame with the CRC zeroed
        let mut bad = adc_frame();
        let len = bad.len();
        bad[len - 3] = 0x00;
        bad[len - 2] = 0x00;

        pipeline.send(&bad).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        pipeline.disconnect().await.unwrap();

        let frames = pipeline.frames();
        let rx = frames
            .iter()
            .find(|f| f.direction == Direction::Rx)
            .unwrap();
        assert_eq!(rx.error.as_ref().unwrap().code, "CRC_MISMATCH");
        // Decode still produced a frame, with the mismatch reported
        assert!(!rx.decoded.as_ref().unwrap().checksum.as_ref().unwrap().valid);
    }

    #[tokio::test]
    async fn test_bus_events_for_rx_and_tx() {
        let pipeline = SessionPipeline::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pipeline.bus().subscribe_all(Box::new(move |event| {
            sink.lock().unwrap().push(event.kind());
        }));

        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .unwrap();
        pipeline.send(&adc_frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        pipeline.disconnect().await.unwrap();

        let seen = events.lock().unwrap();
        assert_eq!(seen[0], EventKind::DeviceConnected);
        assert!(seen.contains(&EventKind::FrameSent));
        assert!(seen.contains(&EventKind::FrameReceived));
        assert_eq!(*seen.last().unwrap(), EventKind::DeviceDisconnected);
    }

    #[tokio::test]
    async fn test_send_without_handle_fails_and_records_nothing() {
        let pipeline = SessionPipeline::new();
        assert!(pipeline.send(&[1, 2, 3]).await.is_err());
        assert_eq!(pipeline.frame_count(), 0);
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let pipeline = SessionPipeline::new();
        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .unwrap();
        assert!(pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .is_err());
        pipeline.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        assert!(SessionPipeline::with_protocol("nope").is_err());
        let pipeline = SessionPipeline::with_protocol("slip").unwrap();
        assert_eq!(pipeline.protocol(), "slip");
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let pipeline = SessionPipeline::new();
        pipeline.disconnect().await.unwrap();

        let adapter = UartAdapter::new();
        pipeline
            .connect_simulator(&adapter, &SimulatorConfig::loopback())
            .await
            .unwrap();
        pipeline.disconnect().await.unwrap();
        pipeline.disconnect().await.unwrap();
        assert!(!pipeline.is_connected());
    }
}
