// src/io/uart.rs
//
// UART adapter over the serialport crate.
//
// The port is opened explicitly with the requested line parameters and a
// short read timeout; a blocking read loop forwards each OS read as one rx
// chunk. Baud rate and flow-control lines can be changed on the live port.

use super::sim::{SimulatorConfig, SimulatorHandle};
use super::{
    AdapterHandle, AdapterOpenOptions, AdapterStats, DeviceInfo, DeviceType, FlowControlLine,
    HandleCore, IoError, Parity, RxCallback, StopBits, SubscriptionToken, TransportAdapter,
};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Option Conversion
// ============================================================================

fn to_serialport_data_bits(bits: u8) -> Result<serialport::DataBits, IoError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(IoError::unsupported_option(format!("dataBits={}", other))),
    }
}

fn to_serialport_stop_bits(bits: StopBits) -> Result<serialport::StopBits, IoError> {
    match bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        // serialport cannot express 1.5 stop bits
        StopBits::OnePointFive => Err(IoError::unsupported_option("stopBits=1.5")),
    }
}

fn to_serialport_parity(parity: Parity) -> Result<serialport::Parity, IoError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Odd => Ok(serialport::Parity::Odd),
        // serialport cannot express mark/space parity
        Parity::Mark => Err(IoError::unsupported_option("parity=mark")),
        Parity::Space => Err(IoError::unsupported_option("parity=space")),
    }
}

fn to_serialport_flow_control(lines: &[FlowControlLine]) -> serialport::FlowControl {
    if lines.contains(&FlowControlLine::XonXoff) {
        serialport::FlowControl::Software
    } else if lines.contains(&FlowControlLine::Rts) || lines.contains(&FlowControlLine::Cts) {
        serialport::FlowControl::Hardware
    } else {
        serialport::FlowControl::None
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// UART transport adapter.
pub struct UartAdapter;

impl UartAdapter {
    pub fn new() -> Self {
        UartAdapter
    }
}

impl Default for UartAdapter {
    fn default() -> Self {
        UartAdapter::new()
    }
}

#[async_trait]
impl TransportAdapter for UartAdapter {
    fn transport(&self) -> DeviceType {
        DeviceType::Uart
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError> {
        let ports = serialport::available_ports()
            .map_err(|e| IoError::connection("uart", e.to_string()))?;

        let mut devices = Vec::with_capacity(ports.len() + 1);
        for port in ports {
            let mut info = DeviceInfo::new(
                &port.port_name,
                DeviceType::Uart,
                Some(port.port_name.clone()),
            );
            if let serialport::SerialPortType::UsbPort(usb) = port.port_type {
                info.vendor = Some(format!("{:04x}", usb.vid));
                info.product = usb.product.clone();
                info.manufacturer = usb.manufacturer.clone();
                info.serial_number = usb.serial_number.clone();
                info.metadata
                    .insert("pid".to_string(), format!("{:04x}", usb.pid));
            }
            devices.push(info);
        }

        if devices.is_empty() {
            devices.push(DeviceInfo::simulator(DeviceType::Uart));
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
                DeviceType::Uart,
                SimulatorConfig::loopback(),
                SimulatorHandle::DEFAULT_LATENCY_MS,
                None,
            ));
        }

        let path = device
            .path
            .clone()
            .ok_or_else(|| IoError::device_path_missing(&device.label()))?;
        let label = device.label();

        let baud = options.baud_rate.unwrap_or(AdapterOpenOptions::DEFAULT_BAUD);
        let data_bits =
            to_serialport_data_bits(options.data_bits.unwrap_or(AdapterOpenOptions::DEFAULT_DATA_BITS))?;
        let stop_bits = to_serialport_stop_bits(options.stop_bits.unwrap_or_default())?;
        let parity = to_serialport_parity(options.parity.unwrap_or_default())?;
        let flow_lines = options.flow_control.clone().unwrap_or_default();
        let timeout = Duration::from_millis(
            options
                .read_timeout_ms
                .unwrap_or(AdapterOpenOptions::DEFAULT_READ_TIMEOUT_MS),
        );

        let mut port = serialport::new(&path, baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(to_serialport_flow_control(&flow_lines))
            .timeout(timeout)
            .open()
            .map_err(|e| IoError::connection(&label, e.to_string()))?;

        // Assert the requested modem lines
        if flow_lines.contains(&FlowControlLine::Dtr) {
            port.write_data_terminal_ready(true)
                .map_err(|e| IoError::protocol(&label, format!("set DTR: {}", e)))?;
        }
        if flow_lines.contains(&FlowControlLine::Rts) {
            port.write_request_to_send(true)
                .map_err(|e| IoError::protocol(&label, format!("set RTS: {}", e)))?;
        }

        let handle = Arc::new(UartHandle {
            core: Arc::new(HandleCore::new(device.clone())),
            port: Arc::new(Mutex::new(port)),
            stop: Arc::new(AtomicBool::new(false)),
        });

        handle.spawn_read_loop();
        tlog!("[uart] opened {} (baud: {})", label, baud);
        Ok(handle)
    }

    async fn create_simulator(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        Ok(SimulatorHandle::spawn(
            DeviceType::Uart,
            config.clone(),
            SimulatorHandle::DEFAULT_LATENCY_MS,
            None,
        ))
    }
}

// ============================================================================
// Handle
// ============================================================================

/// One open serial port.
pub struct UartHandle {
    core: Arc<HandleCore>,
    /// Shared between the read loop and writers
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    stop: Arc<AtomicBool>,
}

impl UartHandle {
    fn spawn_read_loop(self: &Arc<Self>) {
        let core = self.core.clone();
        let port = self.port.clone();
        let stop = self.stop.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 256];
            while !stop.load(Ordering::SeqCst) {
                let read_result = match port.lock() {
                    Ok(mut guard) => guard.read(&mut buf),
                    Err(e) => {
                        tlog!("[uart] port mutex poisoned in read loop: {}", e);
                        core.record_error();
                        return;
                    }
                };
                match read_result {
                    Ok(n) if n > 0 => {
                        core.deliver_rx(&buf[..n], None, None);
                    }
                    Ok(_) => {
                        // EOF - port disconnected
                        if !stop.load(Ordering::SeqCst) {
                            tlog!("[uart] {} disconnected", core.device().label());
                            core.record_error();
                        }
                        return;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Timeout - poll the stop flag again
                    }
                    Err(e) => {
                        if !stop.load(Ordering::SeqCst) {
                            tlog!("[uart] read error on {}: {}", core.device().label(), e);
                            core.record_error();
                        }
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl AdapterHandle for UartHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.core.ensure_open()?;
        let label = self.core.device().label();
        let port = self.port.clone();
        let data = bytes.to_vec();

        let result = tokio::task::spawn_blocking(move || match port.lock() {
            Ok(mut guard) => guard
                .write_all(&data)
                .and_then(|_| guard.flush())
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("port mutex poisoned: {}", e)),
        })
        .await
        .map_err(|e| IoError::write(&label, format!("write task failed: {}", e)))?;

        match result {
            Ok(()) => {
                self.core.record_tx(bytes.len());
                Ok(())
            }
            Err(reason) => {
                self.core.record_error();
                Err(IoError::write(&label, reason))
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
        let label = self.core.device().label();
        let mut guard = self
            .port
            .lock()
            .map_err(|e| IoError::protocol(&label, format!("port mutex poisoned: {}", e)))?;

        if let Some(baud) = options.baud_rate {
            guard
                .set_baud_rate(baud)
                .map_err(|e| IoError::protocol(&label, format!("set baud: {}", e)))?;
            tlog!("[uart] {} baud rate changed to {}", label, baud);
        }

        if let Some(lines) = &options.flow_control {
            guard
                .set_flow_control(to_serialport_flow_control(lines))
                .map_err(|e| IoError::protocol(&label, format!("set flow control: {}", e)))?;
            if lines.contains(&FlowControlLine::Dtr) {
                guard
                    .write_data_terminal_ready(true)
                    .map_err(|e| IoError::protocol(&label, format!("set DTR: {}", e)))?;
            }
            if lines.contains(&FlowControlLine::Rts) {
                guard
                    .write_request_to_send(true)
                    .map_err(|e| IoError::protocol(&label, format!("set RTS: {}", e)))?;
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), IoError> {
        if self.core.mark_closed() {
            self.stop.store(true, Ordering::SeqCst);
            tlog!("[uart] closed {}", self.core.device().label());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_bits_conversion() {
        assert!(matches!(
            to_serialport_data_bits(5).unwrap(),
            serialport::DataBits::Five
        ));
        assert!(matches!(
            to_serialport_data_bits(8).unwrap(),
            serialport::DataBits::Eight
        ));
        assert!(to_serialport_data_bits(9).is_err());
    }

    #[test]
    fn test_stop_bits_one_point_five_unsupported() {
        assert!(to_serialport_stop_bits(StopBits::One).is_ok());
        assert!(to_serialport_stop_bits(StopBits::Two).is_ok());
        assert!(matches!(
            to_serialport_stop_bits(StopBits::OnePointFive),
            Err(IoError::UnsupportedOption { .. })
        ));
    }

    #[test]
    fn test_mark_space_parity_unsupported() {
        assert!(to_serialport_parity(Parity::None).is_ok());
        assert!(to_serialport_parity(Parity::Even).is_ok());
        assert!(to_serialport_parity(Parity::Odd).is_ok());
        assert!(to_serialport_parity(Parity::Mark).is_err());
        assert!(to_serialport_parity(Parity::Space).is_err());
    }

    #[test]
    fn test_flow_control_mapping() {
        assert!(matches!(
            to_serialport_flow_control(&[FlowControlLine::XonXoff]),
            serialport::FlowControl::Software
        ));
        assert!(matches!(
            to_serialport_flow_control(&[FlowControlLine::Rts, FlowControlLine::Cts]),
            serialport::FlowControl::Hardware
        ));
        assert!(matches!(
            to_serialport_flow_control(&[FlowControlLine::Dtr]),
            serialport::FlowControl::None
        ));
        assert!(matches!(
            to_serialport_flow_control(&[]),
            serialport::FlowControl::None
        ));
    }

    #[tokio::test]
    async fn test_open_without_path_fails() {
        let adapter = UartAdapter::new();
        let device = DeviceInfo::new("bogus", DeviceType::Uart, None);
        let result = adapter.open(&device, &AdapterOpenOptions::default()).await;
        assert!(matches!(result, Err(IoError::DevicePathMissing { .. })));
    }

    #[tokio::test]
    async fn test_simulator_open_roundtrip() {
        let adapter = UartAdapter::new();
        let device = DeviceInfo::simulator(DeviceType::Uart);
        let handle = adapter
            .open(&device, &AdapterOpenOptions::default())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        handle.read(Box::new(move |bytes, _| {
            sink.lock().unwrap().push(bytes.to_vec());
        }));

        handle.write(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.close().await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![b"hello".to_vec()]);
    }
}
