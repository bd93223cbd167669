// src/io/can.rs
//
// CAN adapter.
//
// Real hardware goes through SocketCAN and is therefore Linux-only; other
// platforms (and setups without a CAN interface) get the simulator entry.
//
// Every received message is normalized into the adapter-wide chunk layout
//   [id:u32-BE][dlc:u8][data[dlc]]
// with the CAN-specific fields mirrored into rx transportSpecific metadata.
// Writes parse the same layout back; the extended flag is derived from the
// id exceeding the 11-bit range.

use super::sim::{SimulatorConfig, SimulatorHandle};
use super::{
    AdapterHandle, AdapterOpenOptions, CanFilterRule, DeviceInfo, DeviceType, IoError,
    TransportAdapter, TransportValue,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Largest standard (11-bit) CAN id.
pub const CAN_SFF_MAX: u32 = 0x7FF;
/// Normalized chunk header: id (4) + dlc (1).
pub const NORMALIZED_HEADER_LEN: usize = 5;

// ============================================================================
// Normalized Chunk Layout
// ============================================================================

/// A CAN message parsed out of (or destined for) the normalized layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedCanFrame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

/// Build the normalized chunk for one CAN message.
pub fn encode_normalized(id: u32, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(NORMALIZED_HEADER_LEN + data.len());
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(data);
    bytes
}

/// Parse a normalized chunk for transmission.
/// Rejects frames shorter than the header and DLC values beyond classic CAN.
pub fn parse_normalized(bytes: &[u8], device: &str) -> Result<NormalizedCanFrame, IoError> {
    if bytes.len() < NORMALIZED_HEADER_LEN {
        return Err(IoError::protocol(
            device,
            format!(
                "frame too short: {} bytes, need at least {}",
                bytes.len(),
                NORMALIZED_HEADER_LEN
            ),
        ));
    }

    let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let dlc = bytes[4] as usize;
    if dlc > 8 {
        return Err(IoError::protocol(
            device,
            format!("invalid DLC: {} (max 8)", dlc),
        ));
    }
    if bytes.len() < NORMALIZED_HEADER_LEN + dlc {
        return Err(IoError::protocol(
            device,
            format!(
                "truncated frame: DLC {} but only {} data bytes",
                dlc,
                bytes.len() - NORMALIZED_HEADER_LEN
            ),
        ));
    }

    Ok(NormalizedCanFrame {
        id,
        extended: id > CAN_SFF_MAX,
        data: bytes[NORMALIZED_HEADER_LEN..NORMALIZED_HEADER_LEN + dlc].to_vec(),
    })
}

/// CAN-specific rx metadata.
pub fn transport_meta(
    id: u32,
    ext: bool,
    rtr: bool,
    dlc: u8,
) -> HashMap<String, TransportValue> {
    let mut meta = HashMap::new();
    meta.insert("canId".to_string(), TransportValue::U32(id));
    meta.insert("canExt".to_string(), TransportValue::Bool(ext));
    meta.insert("canRtr".to_string(), TransportValue::Bool(rtr));
    meta.insert("canDlc".to_string(), TransportValue::U32(dlc as u32));
    meta
}

/// A message passes when the filter set is empty or ANY rule matches.
pub fn passes_filters(filters: &[CanFilterRule], id: u32, ext: bool) -> bool {
    filters.is_empty() || filters.iter().any(|rule| rule.matches(id, ext))
}

// ============================================================================
// Adapter
// ============================================================================

/// CAN transport adapter.
pub struct CanAdapter;

impl CanAdapter {
    pub fn new() -> Self {
        CanAdapter
    }
}

impl Default for CanAdapter {
    fn default() -> Self {
        CanAdapter::new()
    }
}

#[async_trait]
impl TransportAdapter for CanAdapter {
    fn transport(&self) -> DeviceType {
        DeviceType::Can
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError> {
        let mut devices = linux_impl::enumerate_interfaces();
        if devices.is_empty() {
            devices.push(DeviceInfo::simulator(DeviceType::Can));
        }
        Ok(devices)
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        if device.is_simulator() {
            return Ok(SimulatorHandle::spawn(
                DeviceType::Can,
                SimulatorConfig::loopback(),
                SimulatorHandle::DEFAULT_LATENCY_MS,
                None,
            ));
        }

        let interface = device
            .path
            .clone()
            .ok_or_else(|| IoError::device_path_missing(&device.label()))?;
        linux_impl::open_socket(device.clone(), &interface, options)
    }

    async fn create_simulator(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        Ok(SimulatorHandle::spawn(
            DeviceType::Can,
            config.clone(),
            SimulatorHandle::DEFAULT_LATENCY_MS,
            None,
        ))
    }
}

// ============================================================================
// SocketCAN (Linux)
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::io::{AdapterStats, HandleCore, RxCallback, SubscriptionToken};
    use socketcan::{
        CanAnyFrame, CanDataFrame, CanFdSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket,
        StandardId,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// ARP hardware type for CAN interfaces in sysfs.
    const ARPHRD_CAN: &str = "280";

    /// Enumerate CAN network interfaces via sysfs.
    pub fn enumerate_interfaces() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        let entries = match std::fs::read_dir("/sys/class/net") {
            Ok(entries) => entries,
            Err(_) => return devices,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let type_path = entry.path().join("type");
            let iface_type = std::fs::read_to_string(&type_path).unwrap_or_default();
            if iface_type.trim() == ARPHRD_CAN {
                devices.push(DeviceInfo::new(&name, DeviceType::Can, Some(name.clone())));
            }
        }
        devices
    }

    /// SocketCAN-backed handle.
    pub struct CanHandle {
        core: Arc<HandleCore>,
        socket: Arc<CanFdSocket>,
        filters: Arc<Mutex<Vec<CanFilterRule>>>,
        listen_only: bool,
        stop: Arc<AtomicBool>,
    }

    pub fn open_socket(
        device: DeviceInfo,
        interface: &str,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        let label = device.label();
        let socket = CanFdSocket::open(interface)
            .map_err(|e| IoError::connection(&label, e.to_string()))?;
        socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(|e| IoError::protocol(&label, format!("set read timeout: {}", e)))?;

        let handle = Arc::new(CanHandle {
            core: Arc::new(HandleCore::new(device)),
            socket: Arc::new(socket),
            filters: Arc::new(Mutex::new(
                options.can_filters.clone().unwrap_or_default(),
            )),
            listen_only: options.can_listen_only.unwrap_or(false),
            stop: Arc::new(AtomicBool::new(false)),
        });

        spawn_read_loop(&handle);
        tlog!("[can] opened {} (listen_only: {})", label, handle.listen_only);
        Ok(handle)
    }

    /// Blocking read loop forwarding each message as one normalized rx chunk.
    fn spawn_read_loop(handle: &Arc<CanHandle>) {
        let core = handle.core.clone();
        let socket = handle.socket.clone();
        let filters = handle.filters.clone();
        let stop = handle.stop.clone();

        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(frame) => {
                        let (id, ext, rtr, data) = match frame {
                            CanAnyFrame::Normal(f) => (
                                f.raw_id() & 0x1FFF_FFFF,
                                f.is_extended(),
                                false,
                                f.data().to_vec(),
                            ),
                            CanAnyFrame::Fd(f) => (
                                f.raw_id() & 0x1FFF_FFFF,
                                f.is_extended(),
                                false,
                                f.data().to_vec(),
                            ),
                            CanAnyFrame::Remote(f) => (
                                f.raw_id() & 0x1FFF_FFFF,
                                f.is_extended(),
                                true,
                                Vec::new(),
                            ),
                            CanAnyFrame::Error(_) => {
                                core.record_error();
                                continue;
                            }
                        };

                        // Filter drop happens before any stats increment
                        let active = filters.lock().map(|f| f.clone()).unwrap_or_default();
                        if !passes_filters(&active, id, ext) {
                            continue;
                        }

                        let bytes = encode_normalized(id, &data);
                        let meta = transport_meta(id, ext, rtr, data.len() as u8);
                        core.deliver_rx(&bytes, Some(meta), None);
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        // Timeout - poll the stop flag again
                    }
                    Err(e) => {
                        if !stop.load(Ordering::SeqCst) {
                            tlog!("[can] read error on {}: {}", core.device().label(), e);
                            core.record_error();
                        }
                        return;
                    }
                }
            }
        });
    }

    #[async_trait]
    impl AdapterHandle for CanHandle {
        fn device(&self) -> &DeviceInfo {
            self.core.device()
        }

        async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
            self.core.ensure_open()?;
            let label = self.core.device().label();

            if self.listen_only {
                self.core.record_error();
                return Err(IoError::write(&label, "interface is listen-only"));
            }

            let parsed = parse_normalized(bytes, &label).map_err(|e| {
                self.core.record_error();
                e
            })?;

            let frame = if parsed.extended {
                let id = ExtendedId::new(parsed.id).ok_or_else(|| {
                    self.core.record_error();
                    IoError::protocol(&label, format!("invalid extended id 0x{:08X}", parsed.id))
                })?;
                CanDataFrame::new(Id::Extended(id), &parsed.data)
            } else {
                let id = StandardId::new(parsed.id as u16).ok_or_else(|| {
                    self.core.record_error();
                    IoError::protocol(&label, format!("invalid standard id 0x{:03X}", parsed.id))
                })?;
                CanDataFrame::new(Id::Standard(id), &parsed.data)
            }
            .ok_or_else(|| {
                self.core.record_error();
                IoError::protocol(&label, "failed to build frame")
            })?;

            match self.socket.write_frame(&frame) {
                Ok(()) => {
                    self.core.record_tx(bytes.len());
                    Ok(())
                }
                Err(e) => {
                    self.core.record_error();
                    Err(IoError::write(&label, e.to_string()))
                }
            }
        }

        fn read(&self, callback: RxCallback) -> SubscriptionToken {
            self.core.subscribe(callback)
        }

        fn unsubscribe(&self, token: SubscriptionToken) {
            self.core.unsubscribe(token);
        }

        async fn set_options(&self, options: &AdapterOpenOptions) -> Result<(), IoError> {
            self.core.ensure_open()?;
            // Hot-swappable: the software filter set
            if let Some(new_filters) = &options.can_filters {
                if let Ok(mut filters) = self.filters.lock() {
                    *filters = new_filters.clone();
                }
                tlog!(
                    "[can] {} filter set replaced ({} rules)",
                    self.core.device().label(),
                    new_filters.len()
                );
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), IoError> {
            if self.core.mark_closed() {
                self.stop.store(true, Ordering::SeqCst);
                tlog!("[can] closed {}", self.core.device().label());
            }
            Ok(())
        }

        fn stats(&self) -> AdapterStats {
            self.core.stats()
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod linux_impl {
    use super::*;

    pub fn enumerate_interfaces() -> Vec<DeviceInfo> {
        Vec::new()
    }

    pub fn open_socket(
        device: DeviceInfo,
        _interface: &str,
        _options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        Err(IoError::connection(
            &device.label(),
            "SocketCAN is only available on Linux",
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_layout() {
        // OBD request on 0x7E0 with 8 data bytes
        let data = [0x02, 0x01, 0x0C, 0, 0, 0, 0, 0];
        let bytes = encode_normalized(0x7E0, &data);
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x07, 0xE0, 0x08, 0x02, 0x01, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00]
        );

        let meta = transport_meta(0x7E0, false, false, 8);
        assert_eq!(meta.get("canId"), Some(&TransportValue::U32(0x7E0)));
        assert_eq!(meta.get("canExt"), Some(&TransportValue::Bool(false)));
        assert_eq!(meta.get("canRtr"), Some(&TransportValue::Bool(false)));
        assert_eq!(meta.get("canDlc"), Some(&TransportValue::U32(8)));
    }

    #[test]
    fn test_parse_normalized_roundtrip() {
        let bytes = encode_normalized(0x123, &[0xAA, 0xBB]);
        let parsed = parse_normalized(&bytes, "can(test)").unwrap();
        assert_eq!(parsed.id, 0x123);
        assert!(!parsed.extended);
        assert_eq!(parsed.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_derives_extended_from_id() {
        let bytes = encode_normalized(0x18DA_F110, &[0x01]);
        let parsed = parse_normalized(&bytes, "can(test)").unwrap();
        assert!(parsed.extended);

        let bytes = encode_normalized(CAN_SFF_MAX, &[]);
        assert!(!parse_normalized(&bytes, "can(test)").unwrap().extended);
    }

    #[test]
    fn test_parse_rejects_short_and_bad_dlc() {
        assert!(parse_normalized(&[0x00, 0x00, 0x01], "can(test)").is_err());

        let mut bytes = encode_normalized(0x100, &[0; 8]);
        bytes[4] = 9;
        assert!(parse_normalized(&bytes, "can(test)").is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_data() {
        // DLC claims 4 bytes, only 2 present
        let bytes = vec![0x00, 0x00, 0x01, 0x00, 0x04, 0xAA, 0xBB];
        assert!(parse_normalized(&bytes, "can(test)").is_err());
    }

    #[test]
    fn test_filter_any_rule_passes() {
        let filters = vec![
            CanFilterRule {
                id: 0x100,
                mask: 0x700,
                extended: None,
            },
            CanFilterRule {
                id: 0x7E0,
                mask: 0x7F8,
                extended: Some(false),
            },
        ];
        assert!(passes_filters(&filters, 0x123, false));
        assert!(passes_filters(&filters, 0x7E3, false));
        assert!(!passes_filters(&filters, 0x7E3, true));
        assert!(!passes_filters(&filters, 0x400, false));
    }

    #[test]
    fn test_empty_filter_set_passes_everything() {
        assert!(passes_filters(&[], 0x000, false));
        assert!(passes_filters(&[], 0x1FFF_FFFF, true));
    }

    #[tokio::test]
    async fn test_simulator_fallback_in_enumeration() {
        let adapter = CanAdapter::new();
        let devices = adapter.list_devices().await.unwrap();
        assert!(!devices.is_empty());
    }

    #[tokio::test]
    async fn test_simulator_loopback_roundtrip() {
        let adapter = CanAdapter::new();
        let handle = adapter
            .create_simulator(&SimulatorConfig::loopback())
            .await
            .unwrap();

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        handle.read(Box::new(move |bytes, _| {
            sink.lock().unwrap().push(bytes.to_vec());
        }));

        let frame = encode_normalized(0x100, &[0x11, 0x22]);
        handle.write(&frame).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        handle.close().await.unwrap();

        let chunks = received.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], frame);
    }
}
