//! UDP transport
//!
//! Outbound: one connected socket per device plus one multicast sender, all
//! behind a single async mutex. Holding the mutex covers tid assignment, the
//! write and the pacing sleep, so at most one frame is on the wire at a time.
//!
//! Inbound: a unicast listener and (optionally) a multicast listener joined
//! on every eligible interface. Each runs its own receive task that decodes
//! frames and hands them to the matching [`DeviceObject`].

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    ANNOUNCE_PACING, DEFAULT_EXCLUDED_INTERFACES, ECHONET_PORT, EPC_INSTANCE_LIST_S,
    MAX_FRAME_SIZE, MULTICAST_GROUP,
};
use crate::device::{DeviceKind, DeviceObject};
use crate::error::{EchonetError, Result};
use crate::frame::{parse_instance_list, Frame, ObjectCode, ServiceCode};
use crate::netif;
use crate::registry::Registry;

// ============================================================================
// Configuration
// ============================================================================

fn default_group() -> Ipv4Addr {
    MULTICAST_GROUP
}

fn default_port() -> u16 {
    ECHONET_PORT
}

fn default_unicast_bind() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_true() -> bool {
    true
}

fn default_excluded() -> Vec<String> {
    DEFAULT_EXCLUDED_INTERFACES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rebind_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_group")]
    pub multicast_group: Ipv4Addr,
    /// Local port for both listeners; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub listen_port: u16,
    /// Remote port devices listen on
    #[serde(default = "default_port")]
    pub device_port: u16,
    #[serde(default = "default_unicast_bind")]
    pub unicast_bind: Ipv4Addr,
    /// Open the multicast listener and sender
    #[serde(default = "default_true")]
    pub multicast: bool,
    /// Interface name prefixes never joined to the group
    #[serde(default = "default_excluded")]
    pub exclude_interfaces: Vec<String>,
    /// Override for the per-kind pacing interval
    #[serde(default)]
    pub pacing_ms: Option<u64>,
    /// Wait before rebinding a failed listener
    #[serde(default = "default_rebind_delay_ms")]
    pub rebind_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            multicast_group: default_group(),
            listen_port: default_port(),
            device_port: default_port(),
            unicast_bind: default_unicast_bind(),
            multicast: true,
            exclude_interfaces: default_excluded(),
            pacing_ms: None,
            rebind_delay_ms: default_rebind_delay_ms(),
        }
    }
}

impl TransportConfig {
    pub fn pacing(&self, kind: DeviceKind) -> Duration {
        self.pacing_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| kind.default_pacing())
    }
}

// ============================================================================
// Sender Trait
// ============================================================================

/// Outbound half of the transport, as seen by the control loop
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Assign the device's next tid, write the frame and pace.
    /// Returns the tid used.
    async fn send(&self, device: &DeviceObject, frame: Frame) -> Result<u16>;

    /// Multicast a node instance list request
    async fn announce(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Listeners
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Unicast,
    Multicast,
}

/// Everything needed to (re)bind one listening socket
#[derive(Debug, Clone)]
struct ListenerSpec {
    kind: ListenerKind,
    bind: SocketAddrV4,
    group: Ipv4Addr,
    interfaces: Vec<netif::Interface>,
}

impl ListenerSpec {
    fn bind(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(self.bind).into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        if self.kind == ListenerKind::Multicast {
            self.join(&socket);
        }
        Ok(socket)
    }

    /// Join failures are per interface and non-fatal
    fn join(&self, socket: &UdpSocket) {
        if self.interfaces.is_empty() {
            match socket.join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED) {
                Ok(()) => debug!("join_multicast_v4({}) on UNSPECIFIED", self.group),
                Err(e) => warn!("join_multicast_v4({}) failed: {}", self.group, e),
            }
            return;
        }
        for iface in &self.interfaces {
            match socket.join_multicast_v4(self.group, iface.addr) {
                Ok(()) => debug!(
                    "join_multicast_v4({}) on {} ({})",
                    self.group, iface.name, iface.addr
                ),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => debug!(
                    "join_multicast_v4({}) on {} already joined, skipping",
                    self.group, iface.name
                ),
                Err(e) => warn!(
                    "join_multicast_v4({}) on {} failed (non-fatal): {}",
                    self.group, iface.name, e
                ),
            }
        }
    }
}

/// What a receive task did with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    Unmatched,
    Malformed,
}

/// Decode one datagram and route it to its device
pub(crate) async fn dispatch(
    registry: &Registry,
    data: &[u8],
    src: SocketAddr,
    local: SocketAddr,
) -> DispatchOutcome {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Drop {} bytes from {}: {}", data.len(), src, e);
            debug!("Raw: {}", common::hex::dump(data));
            return DispatchOutcome::Malformed;
        },
    };
    debug!("Recv: {} => {} {}", src.ip(), local, frame);

    match registry.find_by_source(src.ip(), frame.seoj) {
        Some(device) => {
            device.handle_response(&frame).await;
            DispatchOutcome::Delivered
        },
        None => {
            let advertised: Vec<ObjectCode> = frame
                .properties()
                .iter()
                .flat_map(parse_instance_list)
                .collect();
            if advertised.is_empty() {
                debug!("Drop frame from unknown device {} {}", src.ip(), frame.seoj);
            }
            for eoj in advertised {
                info!("Discovered object {} at {}", eoj, src.ip());
            }
            DispatchOutcome::Unmatched
        },
    }
}

// ============================================================================
// Socket Seams
// ============================================================================

/// Connected datagram endpoint used for device writes
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_datagram(&self, bytes: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, bytes: &[u8]) -> io::Result<usize> {
        self.send(bytes).await
    }
}

/// Bound datagram endpoint read by a receive task
#[async_trait]
pub trait DatagramSource: Send + Sync {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSource for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Write `bytes` through `current`, reopening it once if the write fails
///
/// A missing sink is opened first. The reopened sink replaces `current`
/// whether or not the retried write succeeds; if the reopen itself fails
/// the old sink is kept.
pub async fn send_or_reopen<S, F, Fut>(
    current: &mut Option<S>,
    bytes: &[u8],
    label: &str,
    reopen: F,
) -> Result<()>
where
    S: DatagramSink,
    F: FnOnce() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    if let Some(sink) = current.as_ref() {
        match sink.send_datagram(bytes).await {
            Ok(_) => return Ok(()),
            Err(e) => warn!("Send to {} failed, reopening: {}", label, e),
        }
    }

    let sink = reopen()
        .await
        .map_err(|e| EchonetError::transport(format!("reopen {}: {}", label, e)))?;
    let result = sink.send_datagram(bytes).await;
    *current = Some(sink);
    result
        .map(|_| ())
        .map_err(|e| EchonetError::transport(format!("send to {}: {}", label, e)))
}

/// Read datagrams until cancelled, dispatching each to its device
///
/// A read error is logged; after `rebind_delay` the source is replaced by
/// `rebind()`. A failed rebind keeps the old source and waits for the next
/// error.
pub async fn receive_loop<S, R>(
    label: String,
    mut source: S,
    local: SocketAddr,
    mut rebind: R,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    rebind_delay: Duration,
) where
    S: DatagramSource,
    R: FnMut() -> io::Result<S> + Send,
{
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = source.recv_datagram(&mut buf) => match received {
                Ok((len, src)) => {
                    dispatch(&registry, &buf[..len], src, local).await;
                },
                Err(e) => {
                    error!("{} listener {} read failed: {}", label, local, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(rebind_delay) => {},
                    }
                    match rebind() {
                        Ok(rebound) => {
                            info!("{} listener rebound on {}", label, local);
                            source = rebound;
                        },
                        Err(e) => warn!("{} listener rebind failed: {}", label, e),
                    }
                },
            },
        }
    }
    debug!("{} listener {} stopped", label, local);
}

// ============================================================================
// Transport
// ============================================================================

struct Outbound {
    devices: HashMap<String, UdpSocket>,
    multicast: Option<UdpSocket>,
}

pub struct Transport {
    config: TransportConfig,
    outbound: Mutex<Outbound>,
    announce_tid: AtomicU16,
    listeners: Vec<SocketAddr>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Transport {
    /// Open every socket and start the receive tasks
    ///
    /// Any bind or connect failure here is returned and should be fatal.
    pub async fn open(
        config: TransportConfig,
        registry: Arc<Registry>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut devices = HashMap::new();
        for device in registry.iter() {
            let socket = connect_device(device.addr(), config.device_port)
                .await
                .map_err(|e| {
                    EchonetError::transport(format!("connect {}: {}", device.label(), e))
                })?;
            devices.insert(device.label(), socket);
        }

        let mut specs = vec![ListenerSpec {
            kind: ListenerKind::Unicast,
            bind: SocketAddrV4::new(config.unicast_bind, config.listen_port),
            group: config.multicast_group,
            interfaces: Vec::new(),
        }];

        let mut multicast = None;
        if config.multicast {
            let interfaces = netif::eligible_interfaces(&config.exclude_interfaces)
                .unwrap_or_else(|e| {
                    warn!("Interface discovery failed: {}", e);
                    Vec::new()
                });
            info!(
                "Multicast interfaces: {:?}",
                interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
            );
            specs.push(ListenerSpec {
                kind: ListenerKind::Multicast,
                bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.listen_port),
                group: config.multicast_group,
                interfaces,
            });
            multicast = Some(
                UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                    .await
                    .map_err(|e| EchonetError::transport(format!("multicast sender: {}", e)))?,
            );
        }

        let rebind_delay = Duration::from_millis(config.rebind_delay_ms);
        let mut listeners = Vec::new();
        let mut tasks = Vec::new();
        for mut spec in specs {
            let socket = spec.bind().map_err(|e| {
                EchonetError::transport(format!("bind {:?} {}: {}", spec.kind, spec.bind, e))
            })?;
            let local = socket.local_addr()?;
            if let SocketAddr::V4(v4) = local {
                // Pin an ephemeral port so a rebind reuses it
                spec.bind = v4;
            }
            info!("{:?} listener on {}", spec.kind, local);
            listeners.push(local);
            tasks.push(tokio::spawn(receive_loop(
                format!("{:?}", spec.kind),
                socket,
                local,
                move || spec.bind(),
                Arc::clone(&registry),
                cancel.child_token(),
                rebind_delay,
            )));
        }

        Ok(Self {
            config,
            outbound: Mutex::new(Outbound { devices, multicast }),
            announce_tid: AtomicU16::new(0),
            listeners,
            tasks: parking_lot::Mutex::new(tasks),
            cancel,
        })
    }

    /// Bound listener addresses, unicast first
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.listeners
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Stop receive tasks and wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Receive task ended abnormally: {}", e);
            }
        }
        info!("Transport stopped");
    }

    async fn write_device(
        &self,
        outbound: &mut Outbound,
        device: &DeviceObject,
        bytes: &[u8],
    ) -> Result<()> {
        let label = device.label();
        let (addr, port) = (device.addr(), self.config.device_port);
        let mut current = outbound.devices.remove(&label);
        let result = send_or_reopen(&mut current, bytes, &label, || connect_device(addr, port)).await;
        if let Some(socket) = current {
            outbound.devices.insert(label, socket);
        }
        result
    }
}

#[async_trait]
impl FrameSender for Transport {
    async fn send(&self, device: &DeviceObject, mut frame: Frame) -> Result<u16> {
        let mut outbound = self.outbound.lock().await;

        let tid = device.next_tid();
        frame.tid = tid;
        let bytes = frame.encode();

        let result = self.write_device(&mut outbound, device, &bytes).await;
        match &result {
            Ok(()) => debug!("Send: {} {}", device.addr(), frame),
            Err(e) => error!("Send: {} failed: {}", device.label(), e),
        }

        tokio::time::sleep(self.config.pacing(device.kind())).await;
        result.map(|()| tid)
    }

    async fn announce(&self) -> Result<()> {
        let outbound = self.outbound.lock().await;
        let Some(socket) = outbound.multicast.as_ref() else {
            debug!("Announce skipped: multicast disabled");
            return Ok(());
        };

        let mut frame = Frame::new(
            ObjectCode::NODE_PROFILE,
            ObjectCode::NODE_PROFILE,
            ServiceCode::Get,
        );
        frame.add_property(EPC_INSTANCE_LIST_S, Vec::new())?;
        frame.tid = self.announce_tid.fetch_add(1, Ordering::Relaxed);

        let target = SocketAddrV4::new(self.config.multicast_group, self.config.device_port);
        let result = socket
            .send_to(&frame.encode(), target)
            .await
            .map(|_| ())
            .map_err(|e| EchonetError::transport(format!("announce: {}", e)));
        if result.is_ok() {
            debug!("Send: {} {}", target.ip(), frame);
        }

        tokio::time::sleep(ANNOUNCE_PACING).await;
        result
    }
}

async fn connect_device(addr: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((addr, port)).await?;
    Ok(socket)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::constants::{EPC_POWER, EDT_ON};
    use crate::device::{event_channel, DeviceConfig, DeviceEvent};
    use tracing_test::traced_test;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn light_registry(events: &crate::device::EventSender) -> Registry {
        Registry::from_configs(
            &[DeviceConfig::new(
                DeviceKind::Light,
                "hall",
                Ipv4Addr::LOCALHOST,
                ObjectCode::new(0x029001),
            )],
            events,
        )
        .unwrap()
    }

    /// Sink that fails its first `failures` writes
    struct CountingSink {
        id: u8,
        failures: AtomicU16,
        written: Arc<parking_lot::Mutex<Vec<(u8, Vec<u8>)>>>,
    }

    impl CountingSink {
        fn new(id: u8, failures: u16, written: &Arc<parking_lot::Mutex<Vec<(u8, Vec<u8>)>>>) -> Self {
            Self {
                id,
                failures: AtomicU16::new(failures),
                written: Arc::clone(written),
            }
        }
    }

    #[async_trait]
    impl DatagramSink for CountingSink {
        async fn send_datagram(&self, bytes: &[u8]) -> io::Result<usize> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            self.written.lock().push((self.id, bytes.to_vec()));
            Ok(bytes.len())
        }
    }

    #[tokio::test]
    async fn test_healthy_sink_is_not_reopened() {
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut current = Some(CountingSink::new(1, 0, &written));

        // A reopen would fail the send
        send_or_reopen(&mut current, &[1, 2], "light/hall", || async {
            Err::<CountingSink, _>(io::Error::from(io::ErrorKind::Other))
        })
        .await
        .unwrap();

        assert_eq!(*written.lock(), vec![(1, vec![1, 2])]);
        assert_eq!(current.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_missing_sink_is_opened() {
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut current: Option<CountingSink> = None;
        let fresh = CountingSink::new(2, 0, &written);

        send_or_reopen(&mut current, &[7], "light/hall", move || async move { Ok(fresh) })
            .await
            .unwrap();

        assert_eq!(*written.lock(), vec![(2, vec![7])]);
        assert_eq!(current.unwrap().id, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_reopen_keeps_old_sink() {
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut current = Some(CountingSink::new(1, 1, &written));

        let result = send_or_reopen(&mut current, &[1], "light/hall", || async {
            Err::<CountingSink, _>(io::Error::from(io::ErrorKind::AddrNotAvailable))
        })
        .await;

        assert!(matches!(result, Err(EchonetError::TransportFailure(_))));
        assert!(written.lock().is_empty());
        assert_eq!(current.unwrap().id, 1);
        assert!(logs_contain("Send to light/hall failed, reopening"));
    }

    #[tokio::test]
    async fn test_retry_failure_still_replaces_sink() {
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut current = Some(CountingSink::new(1, 1, &written));
        let fresh = CountingSink::new(2, 1, &written);

        let result =
            send_or_reopen(&mut current, &[1], "light/hall", move || async move { Ok(fresh) }).await;

        assert!(matches!(result, Err(EchonetError::TransportFailure(_))));
        assert!(written.lock().is_empty());
        assert_eq!(current.unwrap().id, 2);
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.listen_port, 3610);
        assert_eq!(config.multicast_group, Ipv4Addr::new(224, 0, 23, 0));
        assert_eq!(config.pacing(DeviceKind::Aircon), Duration::from_millis(700));
        assert_eq!(config.pacing(DeviceKind::Light), Duration::from_millis(600));

        let config = TransportConfig {
            pacing_ms: Some(5),
            ..Default::default()
        };
        assert_eq!(config.pacing(DeviceKind::Aircon), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_dispatch_delivers_to_matching_device() {
        let (tx, mut rx) = event_channel(4);
        let registry = light_registry(&tx);
        let frame = Frame::new(ObjectCode::new(0x029001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes)
            .with_property(EPC_POWER, vec![EDT_ON])
            .unwrap();

        let outcome = dispatch(
            &registry,
            &frame.encode(),
            addr("127.0.0.1:3610"),
            addr("127.0.0.1:3610"),
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Changed(_)));
    }

    #[tokio::test]
    async fn test_dispatch_requires_address_and_object_match() {
        let (tx, mut rx) = event_channel(4);
        let registry = light_registry(&tx);
        let frame = Frame::new(ObjectCode::new(0x029001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes)
            .with_property(EPC_POWER, vec![EDT_ON])
            .unwrap();

        let outcome = dispatch(
            &registry,
            &frame.encode(),
            addr("10.1.1.1:3610"),
            addr("0.0.0.0:3610"),
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Unmatched);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_drops_malformed() {
        let (tx, _rx) = event_channel(4);
        let registry = light_registry(&tx);
        let outcome = dispatch(&registry, &[0x10, 0x81], addr("127.0.0.1:1"), addr("127.0.0.1:2")).await;
        assert_eq!(outcome, DispatchOutcome::Malformed);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dispatch_logs_discovered_instances() {
        let (tx, _rx) = event_channel(4);
        let registry = light_registry(&tx);
        let frame = Frame::new(ObjectCode::NODE_PROFILE, ObjectCode::NODE_PROFILE, ServiceCode::GetRes)
            .with_property(EPC_INSTANCE_LIST_S, vec![0x01, 0x01, 0x30, 0x01])
            .unwrap();

        let outcome = dispatch(
            &registry,
            &frame.encode(),
            addr("192.168.1.20:3610"),
            addr("0.0.0.0:3610"),
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Unmatched);
        assert!(logs_contain("Discovered object 013001 at 192.168.1.20"));
    }
}
