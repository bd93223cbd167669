// src/io/ethernet.rs
//
// Ethernet adapter for UDP and TCP byte streams.
//
// UDP binds a datagram socket and treats each datagram as one rx chunk, with
// the remote address in the chunk metadata. TCP connects as a client when a
// host is configured, otherwise listens and adopts the first accepted
// connection; chunks are whatever the OS delivers, with no re-framing.

use super::sim::{SimulatorConfig, SimulatorHandle};
use super::{
    AdapterHandle, AdapterOpenOptions, AdapterStats, DeviceInfo, DeviceType, EthProtocol,
    HandleCore, IoError, RxCallback, SubscriptionToken, TransportAdapter, TransportValue,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// Datagram/segment receive buffer size.
const RX_BUF_LEN: usize = 2048;

fn remote_meta(addr: SocketAddr) -> HashMap<String, TransportValue> {
    let mut meta = HashMap::new();
    meta.insert(
        "remoteAddr".to_string(),
        TransportValue::Str(addr.ip().to_string()),
    );
    meta.insert(
        "remotePort".to_string(),
        TransportValue::U32(addr.port() as u32),
    );
    meta
}

// ============================================================================
// Adapter
// ============================================================================

/// Ethernet transport adapter.
pub struct EthernetAdapter;

impl EthernetAdapter {
    pub fn new() -> Self {
        EthernetAdapter
    }
}

impl Default for EthernetAdapter {
    fn default() -> Self {
        EthernetAdapter::new()
    }
}

#[async_trait]
impl TransportAdapter for EthernetAdapter {
    fn transport(&self) -> DeviceType {
        DeviceType::Ethernet
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, IoError> {
        // Interface enumeration is not portably available; expose a generic
        // endpoint plus the simulator entry.
        let mut generic = DeviceInfo::new("ethernet endpoint", DeviceType::Ethernet, None);
        generic.id = "ethernet-any".to_string();
        Ok(vec![generic, DeviceInfo::simulator(DeviceType::Ethernet)])
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        if device.is_simulator() {
            return Ok(SimulatorHandle::spawn(
                DeviceType::Ethernet,
                SimulatorConfig::loopback(),
                SimulatorHandle::DEFAULT_LATENCY_MS,
                None,
            ));
        }

        let port = options
            .eth_port
            .ok_or_else(|| IoError::config("ethPort is required"))?;

        match options.eth_protocol.unwrap_or_default() {
            EthProtocol::Udp => UdpHandle::open(device.clone(), port, options).await,
            EthProtocol::Tcp => TcpHandle::open(device.clone(), port, options).await,
            EthProtocol::Raw => Err(IoError::unsupported_option("ethProtocol=raw")),
        }
    }

    async fn create_simulator(
        &self,
        config: &SimulatorConfig,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        Ok(SimulatorHandle::spawn(
            DeviceType::Ethernet,
            config.clone(),
            SimulatorHandle::DEFAULT_LATENCY_MS,
            None,
        ))
    }
}

// ============================================================================
// UDP
// ============================================================================

/// Open UDP socket: one datagram in, one rx chunk out.
pub struct UdpHandle {
    core: Arc<HandleCore>,
    socket: Arc<UdpSocket>,
    /// Configured destination for writes
    target: Option<SocketAddr>,
    /// Fallback write destination: whoever sent to us last
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpHandle {
    async fn open(
        device: DeviceInfo,
        port: u16,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        let label = device.label();
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| IoError::connection(&label, e.to_string()))?;

        // Join any requested multicast groups
        for group in options.eth_multicast.clone().unwrap_or_default() {
            let addr: Ipv4Addr = group
                .parse()
                .map_err(|_| IoError::config(format!("invalid multicast group: {}", group)))?;
            socket
                .join_multicast_v4(addr, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| {
                    IoError::connection(&label, format!("join multicast {}: {}", group, e))
                })?;
            tlog!("[eth] {} joined multicast group {}", label, group);
        }

        let target = match &options.eth_host {
            Some(host) => Some(
                format!("{}:{}", host, port)
                    .parse()
                    .map_err(|_| IoError::config(format!("invalid ethHost: {}", host)))?,
            ),
            None => None,
        };

        let handle = Arc::new(UdpHandle {
            core: Arc::new(HandleCore::new(device)),
            socket: Arc::new(socket),
            target,
            last_peer: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        });

        handle.spawn_recv_task();
        tlog!("[eth] UDP socket open on port {}", port);
        Ok(handle)
    }

    fn spawn_recv_task(self: &Arc<Self>) {
        let core = self.core.clone();
        let socket = self.socket.clone();
        let last_peer = self.last_peer.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; RX_BUF_LEN];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        if let Ok(mut peer) = last_peer.lock() {
                            *peer = Some(addr);
                        }
                        core.deliver_rx(&buf[..n], Some(remote_meta(addr)), None);
                    }
                    Err(e) => {
                        tlog!("[eth] UDP recv error on {}: {}", core.device().label(), e);
                        core.record_error();
                        return;
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

#[async_trait]
impl AdapterHandle for UdpHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.core.ensure_open()?;
        let label = self.core.device().label();

        let dest = self
            .target
            .or_else(|| self.last_peer.lock().ok().and_then(|p| *p))
            .ok_or_else(|| {
                IoError::config("no UDP destination: set ethHost or wait for a peer datagram")
            })?;

        match self.socket.send_to(bytes, dest).await {
            Ok(_) => {
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

    async fn set_options(&self, _options: &AdapterOpenOptions) -> Result<(), IoError> {
        self.core.ensure_open()
    }

    async fn close(&self) -> Result<(), IoError> {
        if self.core.mark_closed() {
            if let Ok(mut tasks) = self.tasks.lock() {
                for task in tasks.drain(..) {
                    task.abort();
                }
            }
            tlog!("[eth] closed {}", self.core.device().label());
        }
        Ok(())
    }

    fn stats(&self) -> AdapterStats {
        self.core.stats()
    }
}

// ============================================================================
// TCP
// ============================================================================

/// TCP handle, client or passive-listener flavoured.
pub struct TcpHandle {
    core: Arc<HandleCore>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpHandle {
    async fn open(
        device: DeviceInfo,
        port: u16,
        options: &AdapterOpenOptions,
    ) -> Result<Arc<dyn AdapterHandle>, IoError> {
        let label = device.label();
        let core = Arc::new(HandleCore::new(device));
        let writer = Arc::new(tokio::sync::Mutex::new(None));

        let handle = Arc::new(TcpHandle {
            core: core.clone(),
            writer: writer.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        match &options.eth_host {
            Some(host) => {
                // Client: connect now, fail open on error
                let stream = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    TcpStream::connect((host.as_str(), port)),
                )
                .await
                .map_err(|_| IoError::timeout(&label, "connect"))?
                .map_err(|e| IoError::connection(&label, e.to_string()))?;

                let peer = stream
                    .peer_addr()
                    .map_err(|e| IoError::connection(&label, e.to_string()))?;
                let (read_half, write_half) = stream.into_split();
                *writer.lock().await = Some(write_half);

                let task = tokio::spawn(read_stream(core, read_half, peer));
                if let Ok(mut tasks) = handle.tasks.lock() {
                    tasks.push(task);
                }
                tlog!("[eth] TCP connected to {}:{}", host, port);
            }
            None => {
                // Passive: listen and adopt the first accepted connection
                let listener = TcpListener::bind(("0.0.0.0", port))
                    .await
                    .map_err(|e| IoError::connection(&label, e.to_string()))?;
                tlog!("[eth] TCP listening on port {}", port);

                let accept_core = core.clone();
                let accept_writer = writer.clone();
                let task = tokio::spawn(async move {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            tlog!("[eth] TCP accepted connection from {}", peer);
                            let (read_half, write_half) = stream.into_split();
                            *accept_writer.lock().await = Some(write_half);
                            read_stream(accept_core, read_half, peer).await;
                        }
                        Err(e) => {
                            tlog!("[eth] TCP accept failed: {}", e);
                            accept_core.record_error();
                        }
                    }
                });
                if let Ok(mut tasks) = handle.tasks.lock() {
                    tasks.push(task);
                }
            }
        }

        Ok(handle)
    }
}

/// Forward stream segments as rx chunks until EOF or error.
async fn read_stream(
    core: Arc<HandleCore>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    peer: SocketAddr,
) {
    let mut buf = [0u8; RX_BUF_LEN];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                if !core.is_closed() {
                    tlog!("[eth] {} remote closed", core.device().label());
                }
                return;
            }
            Ok(n) => {
                core.deliver_rx(&buf[..n], Some(remote_meta(peer)), None);
            }
            Err(e) => {
                if !core.is_closed() {
                    tlog!("[eth] TCP read error on {}: {}", core.device().label(), e);
                    core.record_error();
                }
                return;
            }
        }
    }
}

#[async_trait]
impl AdapterHandle for TcpHandle {
    fn device(&self) -> &DeviceInfo {
        self.core.device()
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.core.ensure_open()?;
        let label = self.core.device().label();

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| IoError::write(&label, "no connection established"))?;

        match writer.write_all(bytes).await {
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

    async fn set_options(&self, _options: &AdapterOpenOptions) -> Result<(), IoError> {
        self.core.ensure_open()
    }

    async fn close(&self) -> Result<(), IoError> {
        if self.core.mark_closed() {
            if let Ok(mut tasks) = self.tasks.lock() {
                for task in tasks.drain(..) {
                    task.abort();
                }
            }
            *self.writer.lock().await = None;
            tlog!("[eth] closed {}", self.core.device().label());
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
    use std::time::Duration;

    fn collect(handle: &Arc<dyn AdapterHandle>) -> Arc<Mutex<Vec<(Vec<u8>, Option<String>)>>> {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        handle.read(Box::new(move |bytes, meta| {
            let addr = meta.transport_specific.as_ref().and_then(|m| {
                m.get("remoteAddr").and_then(|v| match v {
                    TransportValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
            });
            sink.lock().unwrap().push((bytes.to_vec(), addr));
        }));
        chunks
    }

    #[tokio::test]
    async fn test_udp_datagram_roundtrip() {
        let adapter = EthernetAdapter::new();
        let device = DeviceInfo::new("udp", DeviceType::Ethernet, None);
        let options = AdapterOpenOptions {
            eth_protocol: Some(EthProtocol::Udp),
            eth_port: Some(47123),
            ..AdapterOpenOptions::default()
        };
        let handle = adapter.open(&device, &options).await.unwrap();
        let chunks = collect(&handle);

        // Fire a datagram at the handle from an ephemeral socket
        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        sender
            .send_to(&[0x01, 0x02, 0x03], ("127.0.0.1", 47123))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let received = chunks.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].0, vec![0x01, 0x02, 0x03]);
            assert_eq!(received[0].1.as_deref(), Some("127.0.0.1"));
        }

        // Reply goes back to the last peer
        handle.write(&[0xAA]).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), sender.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[0xAA]);

        let stats = handle.stats();
        assert_eq!(stats.messages_rx, 1);
        assert_eq!(stats.messages_tx, 1);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_write_without_peer_fails() {
        let adapter = EthernetAdapter::new();
        let device = DeviceInfo::new("udp", DeviceType::Ethernet, None);
        let options = AdapterOpenOptions {
            eth_protocol: Some(EthProtocol::Udp),
            eth_port: Some(47124),
            ..AdapterOpenOptions::default()
        };
        let handle = adapter.open(&device, &options).await.unwrap();
        assert!(matches!(
            handle.write(&[1]).await,
            Err(IoError::Config { .. })
        ));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_client_to_listener() {
        let adapter = EthernetAdapter::new();

        // Passive side listens
        let listener_device = DeviceInfo::new("tcp-listen", DeviceType::Ethernet, None);
        let listener_options = AdapterOpenOptions {
            eth_protocol: Some(EthProtocol::Tcp),
            eth_port: Some(47125),
            ..AdapterOpenOptions::default()
        };
        let listener = adapter
            .open(&listener_device, &listener_options)
            .await
            .unwrap();
        let listener_chunks = collect(&listener);

        // Client side connects
        let client_device = DeviceInfo::new("tcp-client", DeviceType::Ethernet, None);
        let client_options = AdapterOpenOptions {
            eth_protocol: Some(EthProtocol::Tcp),
            eth_port: Some(47125),
            eth_host: Some("127.0.0.1".to_string()),
            ..AdapterOpenOptions::default()
        };
        let client = adapter.open(&client_device, &client_options).await.unwrap();
        let client_chunks = collect(&client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.write(b"ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener_chunks.lock().unwrap()[0].0, b"ping".to_vec());

        listener.write(b"pong").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client_chunks.lock().unwrap()[0].0, b"pong".to_vec());

        client.close().await.unwrap();
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_listener_write_before_accept_fails() {
        let adapter = EthernetAdapter::new();
        let device = DeviceInfo::new("tcp-listen", DeviceType::Ethernet, None);
        let options = AdapterOpenOptions {
            eth_protocol: Some(EthProtocol::Tcp),
            eth_port: Some(47126),
            ..AdapterOpenOptions::default()
        };
        let handle = adapter.open(&device, &options).await.unwrap();
        assert!(matches!(
            handle.write(&[1]).await,
            Err(IoError::Write { .. })
        ));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_requires_port() {
        let adapter = EthernetAdapter::new();
        let device = DeviceInfo::new("eth", DeviceType::Ethernet, None);
        let result = adapter.open(&device, &AdapterOpenOptions::default()).await;
        assert!(matches!(result, Err(IoError::Config { .. })));
    }

    #[tokio::test]
    async fn test_list_devices_includes_simulator() {
        let adapter = EthernetAdapter::new();
        let devices = adapter.list_devices().await.unwrap();
        assert!(devices.iter().any(|d| d.is_simulator()));
    }
}
