// src/io/i2c.rs
//
// Simulated I²C adapter.
//
// The bus model holds a table of virtual devices at 7-bit addresses:
// an EEPROM at 0x50 (256 bytes of 0xAA) and a sensor at 0x68 with a fixed
// register block. The write layout is [addr<<1 | rw, length, data...]; read
// requests answer with the first `length` bytes of the target, writes update
// it. Replies arrive ~2 ms after the request.

use super::sim::{SimReply, SimResponder, SimulatorConfig, SimulatorHandle};
use super::{
    AdapterHandle, AdapterOpenOptions, DeviceInfo, DeviceType, IoError, TransportAdapter,
    TransportValue,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Simulated bus latency
pub const I2C_LATENCY_MS: u64 = 2;
/// 7-bit address of the virtual EEPROM
pub const EEPROM_ADDR: u8 = 0x50;
/// 7-bit address of the virtual sensor
pub const SENSOR_ADDR: u8 = 0x68;
/// Supported bus speeds in Hz
pub const BUS_SPEEDS: [u32; 3] = [100_000, 400_000, 1_000_000];

// ============================================================================
// Bus Model
// ============================================================================

/// Table of virtual devices keyed by 7-bit address.
pub struct I2cBus {
    devices: Mutex<HashMap<u8, Vec<u8>>>,
}

impl I2cBus {
    pub fn new() -> Self {
        let mut devices = HashMap::new();
        // EEPROM: 256 bytes of erased-flash pattern
        devices.insert(EEPROM_ADDR, vec![0xAA; 256]);
        // Sensor: fixed register block (whoami, status, sample words)
        devices.insert(
            SENSOR_ADDR,
            vec![
                0x68, 0x01, 0x27, 0x10, 0x00, 0x80, 0x19, 0x4C, 0x00, 0x00, 0x03, 0xE8, 0xFF,
                0x00, 0x55, 0xAA,
            ],
        );
        I2cBus {
            devices: Mutex::new(devices),
        }
    }

    /// Snapshot of one register (test hook).
    pub fn peek(&self, addr: u8, offset: usize) -> Option<u8> {
        self.devices
            .lock()
            .ok()
            .and_then(|d| d.get(&addr).and_then(|mem| mem.get(offset).copied()))
    }
}

impl Default for I2cBus {
    fn default() -> Self {
        I2cBus::new()
    }
}

impl SimResponder for I2cBus {
    fn respond(&self, write: &[u8]) -> Option<SimReply> {
        if write.len() < 2 {
            return Some(SimReply {
                data: Vec::new(),
                transport_specific: None,
                error: Some("short transfer: need [addr|rw, length]".to_string()),
            });
        }

        let addr = write[0] >> 1;
        let is_read = write[0] & 0x01 == 1;
        let length = write[1] as usize;

        let mut meta = HashMap::new();
        meta.insert(
            "i2cSlaveAddress".to_string(),
            TransportValue::U32(addr as u32),
        );

        let mut devices = self.devices.lock().ok()?;
        let device = match devices.get_mut(&addr) {
            Some(device) => device,
            None => {
                return Some(SimReply {
                    data: Vec::new(),
                    transport_specific: Some(meta),
                    error: Some(format!("no device at address 0x{:02X}", addr)),
                });
            }
        };

        if is_read {
            let n = length.min(device.len());
            Some(SimReply {
                data: device[..n].to_vec(),
                transport_specific: Some(meta),
                error: None,
            })
        } else {
            // Write request: data bytes follow the length field
            for (i, &byte) in write[2..].iter().take(length).enumerate() {
                if i < device.len() {
                    device[i] = byte;
                }
            }
            Some(SimReply {
                data: vec![0x00],
                transport_specific: Some(meta),
                error: None,
            })
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// I²C transport adapter (simulation only).
pub struct I2cAdapter;

impl I2cAdapter {
    pub fn new() -> Self {
        I2cAdapter
    }

    fn spawn_simulator(config: SimulatorConfig) -> Arc<dyn AdapterHandle> {
        SimulatorHandle::spawn(
            DeviceType::I2c,
            config,
            I2C_LATENCY_MS,
            Some(Arc::new(I2cBus::new())),
        )
    }
}

impl Default for I2cAdapter {
    fn default() -> Self {
        I2cAdapter::new()
    }
}

#[async_trait]
impl TransportAdapter for I2cAdapter {
    fn transport(&self) -> DeviceType {
        DeviceType::I2c
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError> {
        Ok(vec![DeviceInfo::simulator(DeviceType::I2c)])
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        if let Some(speed) = options.i2c_bus_speed {
            if !BUS_SPEEDS.contains(&speed) {
                return Err(IoError::unsupported_option(format!(
                    "i2cBusSpeed={}",
                    speed
                )));
            }
        }
        if let Some(mode) = options.i2c_address_mode {
            if mode != 7 && mode != 10 {
                return Err(IoError::unsupported_option(format!(
                    "i2cAddressMode={}",
                    mode
                )));
            }
        }
        if !device.is_simulator() {
            return Err(IoError::connection(
                &device.label(),
                "only the simulated I2C bus is available",
            ));
        }
        Ok(Self::spawn_simulator(SimulatorConfig::loopback()))
    }

    async fn create_simulator(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        Ok(Self::spawn_simulator(config.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================
