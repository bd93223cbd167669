// src/io/spi.rs
//
// Simulated SPI adapter.
//
// The simulator models a 256-byte memory device behind a chip select:
// command 0x03 reads from an address, 0x02 writes, anything else echoes.
// Replies arrive ~5 ms after the write, like a slow-ish peripheral.

use super::sim::{SimReply, SimResponder, SimulatorConfig, SimulatorHandle};
use super::{
    AdapterHandle, AdapterOpenOptions, DeviceInfo, DeviceType, IoError, TransportAdapter,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Read command byte
pub const CMD_READ: u8 = 0x03;
/// Write command byte
pub const CMD_WRITE: u8 = 0x02;
/// Simulated transfer latency
pub const SPI_LATENCY_MS: u64 = 5;
/// Size of the simulated memory
pub const MEMORY_LEN: usize = 256;

// ============================================================================
// Memory Model
// ============================================================================

/// The 256-byte memory region behind the simulated SPI device.
pub struct SpiMemory {
    memory: Mutex<[u8; MEMORY_LEN]>,
}

impl SpiMemory {
    pub fn new() -> Self {
        SpiMemory {
            memory: Mutex::new([0u8; MEMORY_LEN]),
        }
    }

    /// Snapshot of one cell (test hook).
    pub fn peek(&self, addr: u8) -> u8 {
        self.memory.lock().map(|m| m[addr as usize]).unwrap_or(0)
    }
}

impl Default for SpiMemory {
    fn default() -> Self {
        SpiMemory::new()
    }
}

impl SimResponder for SpiMemory {
    fn respond(&self, write: &[u8]) -> Option<SimReply> {
        if write.is_empty() {
            return None;
        }

        match write[0] {
            CMD_READ if write.len() >= 2 => {
                // Full-duplex read: reply length matches the transfer length,
                // data starts after the two command/address bytes
                let addr = write[1] as usize;
                let memory = self.memory.lock().ok()?;
                let mut reply = vec![0u8; write.len()];
                for (i, slot) in reply.iter_mut().enumerate().skip(2) {
                    *slot = memory[(addr + i - 2) % MEMORY_LEN];
                }
                Some(SimReply::bytes(reply))
            }
            CMD_WRITE if write.len() >= 2 => {
                let addr = write[1] as usize;
                if let Ok(mut memory) = self.memory.lock() {
                    for (i, &byte) in write[2..].iter().enumerate() {
                        memory[(addr + i) % MEMORY_LEN] = byte;
                    }
                }
                Some(SimReply::bytes(vec![0x00]))
            }
            _ => {
                // Unknown command: echo the transfer unchanged
                Some(SimReply::bytes(write.to_vec()))
            }
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// SPI transport adapter (simulation only).
pub struct SpiAdapter;

impl SpiAdapter {
    pub fn new() -> Self {
        SpiAdapter
    }

    fn spawn_simulator(config: SimulatorConfig) -> Arc<dyn AdapterHandle> {
        SimulatorHandle::spawn(
            DeviceType::Spi,
            config,
            SPI_LATENCY_MS,
            Some(Arc::new(SpiMemory::new())),
        )
    }
}

impl Default for SpiAdapter {
    fn default() -> Self {
        SpiAdapter::new()
    }
}

#[async_trait]
impl TransportAdapter for SpiAdapter {
    fn transport(&self) -> DeviceType {
        DeviceType::Spi
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError> {
        Ok(vec![DeviceInfo::simulator(DeviceType::Spi)])
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        if let Some(mode) = options.spi_mode {
            if mode > 3 {
                return Err(IoError::unsupported_option(format!("spiMode={}", mode)));
            }
        }
        if !device.is_simulator() {
            return Err(IoError::connection(
                &device.label(),
                "only the simulated SPI device is available",
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
