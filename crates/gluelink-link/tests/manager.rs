use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gluelink_frame::{encode, ChecksumMode, Command, FrameError, Motion};
use gluelink_link::{
    ChannelSink, ConfigUpdate, LinkConfig, LinkError, LinkEvent, LinkManager, LinkState,
    ManagerConfig,
};
use gluelink_transport::{
    TcpConfig, Transport, TransportConfig, TransportError, TransportKind, TransportOption,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

/// In-memory endpoint; the test keeps the other end as a [`Device`].
struct Pipe {
    port: u16,
    fail_open: bool,
    open: bool,
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl Transport for Pipe {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoint(&self) -> String {
        format!("pipe:{}", self.port)
    }

    fn open(&mut self) -> gluelink_transport::Result<()> {
        if self.fail_open {
            return Err(TransportError::Connect {
                addr: self.endpoint(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> gluelink_transport::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(data) => self.pending = data,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> gluelink_transport::Result<usize> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)?;
        Ok(data.len())
    }

    fn set_option(&mut self, _option: TransportOption) -> gluelink_transport::Result<()> {
        Ok(())
    }
}

/// The far side of a [`Pipe`].
struct Device {
    to_link: Sender<Vec<u8>>,
    from_link: Receiver<Vec<u8>>,
}

impl Device {
    fn send(&self, bytes: &[u8]) {
        self.to_link.send(bytes.to_vec()).unwrap();
    }

    fn recv(&self) -> Vec<u8> {
        self.from_link.recv_timeout(WAIT).expect("device received nothing")
    }
}

/// Pipes handed out by port number; unknown ports refuse to open.
#[derive(Default, Clone)]
struct Bench {
    pipes: Arc<Mutex<HashMap<u16, Pipe>>>,
}

impl Bench {
    fn device(&self, port: u16) -> Device {
        let (to_link, rx) = crossbeam_channel::unbounded();
        let (tx, from_link) = crossbeam_channel::unbounded();
        self.pipes.lock().insert(
            port,
            Pipe {
                port,
                fail_open: false,
                open: false,
                rx,
                tx,
                pending: Vec::new(),
            },
        );
        Device { to_link, from_link }
    }

    fn manager(&self, config: ManagerConfig) -> (LinkManager, Receiver<LinkEvent>) {
        let (tx, events) = crossbeam_channel::unbounded();
        let pipes = Arc::clone(&self.pipes);
        let factory = move |config: &TransportConfig| -> Box<dyn Transport> {
            let port = match config {
                TransportConfig::Tcp(tcp) => tcp.port,
                TransportConfig::Serial(_) => 0,
            };
            match pipes.lock().remove(&port) {
                Some(pipe) => Box::new(pipe),
                None => {
                    let (_, rx) = crossbeam_channel::unbounded();
                    let (tx, _) = crossbeam_channel::unbounded();
                    Box::new(Pipe {
                        port,
                        fail_open: true,
                        open: false,
                        rx,
                        tx,
                        pending: Vec::new(),
                    })
                }
            }
        };
        let manager = LinkManager::with_factory(config, ChannelSink(tx), factory).unwrap();
        (manager, events)
    }
}

fn link_config(port: u16) -> LinkConfig {
    LinkConfig {
        reconnect_interval_ms: 20,
        enable_heartbeat: false,
        ..LinkConfig::tcp(TcpConfig::new("bench", port))
    }
}

/// Wait for the first event matching `pred`.
fn wait_for(events: &Receiver<LinkEvent>, pred: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        match events.recv_deadline(deadline) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

fn wait_connected(events: &Receiver<LinkEvent>, name: &str) {
    wait_for(events, |e| matches!(e, LinkEvent::Connected { name: n } if n == name));
}

#[test]
fn generated_names_fill_the_smallest_gap() {
    let (manager, _events) = Bench::default().manager(ManagerConfig::default());
    assert_eq!(manager.create(TransportKind::Tcp, None).unwrap(), "TCP_1");
    assert_eq!(manager.create(TransportKind::Tcp, Some("")).unwrap(), "TCP_2");
    assert_eq!(manager.create(TransportKind::Serial, None).unwrap(), "Serial_1");

    manager.remove("TCP_1").unwrap();
    assert_eq!(manager.create(TransportKind::Tcp, None).unwrap(), "TCP_1");

    assert_eq!(manager.create(TransportKind::Tcp, Some("press")).unwrap(), "press");
    assert!(matches!(
        manager.create(TransportKind::Tcp, Some("press")),
        Err(LinkError::Duplicate(name)) if name == "press"
    ));
    assert_eq!(manager.connection_count(), 4);
    assert!(matches!(manager.remove("nope"), Err(LinkError::NotFound(_))));
}

#[test]
fn connection_limit_is_enforced() {
    let config = ManagerConfig {
        max_connections: 2,
        ..ManagerConfig::default()
    };
    let (manager, _events) = Bench::default().manager(config);
    manager.create(TransportKind::Tcp, None).unwrap();
    manager.create(TransportKind::Tcp, None).unwrap();
    assert!(matches!(
        manager.create(TransportKind::Tcp, None),
        Err(LinkError::TooManyLinks(2))
    ));
}

#[test]
fn frames_flow_both_ways() {
    let bench = Bench::default();
    let device = bench.device(7001);
    let (manager, events) = bench.manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, None).unwrap();
    manager.connect(&name, Some(link_config(7001))).unwrap();
    wait_connected(&events, &name);
    assert_eq!(manager.state(&name).unwrap(), LinkState::Connected);

    let status = encode(Command::DeviceStatus, b"\x02", ChecksumMode::Crc16Modbus).unwrap();
    device.send(&status);
    let event = wait_for(&events, |e| matches!(e, LinkEvent::FrameReceived { .. }));
    let LinkEvent::FrameReceived { name: from, frame } = event else {
        unreachable!()
    };
    assert_eq!(from, name);
    assert_eq!(frame.command(), Some(Command::DeviceStatus));
    assert_eq!(frame.payload.as_ref(), b"\x02");

    let motion = Motion::new(10.0, 20.0, 5.0, 100.0).encode();
    manager
        .send_frame(&name, Command::MoveToPosition, motion.clone())
        .unwrap();
    let expected = encode(Command::MoveToPosition, &motion, ChecksumMode::Crc16Modbus).unwrap();
    assert_eq!(device.recv(), expected.as_ref());
    wait_for(&events, |e| matches!(e, LinkEvent::DataSent { data, .. } if data.len() == 23));

    let snapshot = manager.snapshot(&name).unwrap();
    assert_eq!(snapshot.stats.frames_in, 1);
    assert_eq!(snapshot.stats.frames_out, 1);
    assert_eq!(snapshot.endpoint, "pipe:7001");
}

#[test]
fn one_link_delivers_frames_in_wire_order() {
    let bench = Bench::default();
    let device = bench.device(7003);
    let (manager, events) = bench.manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, None).unwrap();
    manager.connect(&name, Some(link_config(7003))).unwrap();
    wait_connected(&events, &name);

    // Alternate a motion query with a status report, all in one read.
    let mut burst = Vec::new();
    let mut sent = Vec::new();
    for seq in 0..16u8 {
        let command = if seq % 2 == 0 {
            Command::GetPosition
        } else {
            Command::DeviceStatus
        };
        burst.extend_from_slice(&encode(command, &[seq], ChecksumMode::Crc16Modbus).unwrap());
        sent.push((command, seq));
    }
    device.send(&burst);

    let received: Vec<(Command, u8)> = (0..sent.len())
        .map(|_| {
            let event = wait_for(&events, |e| matches!(e, LinkEvent::FrameReceived { .. }));
            let LinkEvent::FrameReceived { frame, .. } = event else {
                unreachable!()
            };
            (frame.command().unwrap(), frame.payload[0])
        })
        .collect();
    assert_eq!(received, sent);
}

#[test]
fn long_read_timeout_does_not_stall_other_links() {
    let bench = Bench::default();
    let _quiet = bench.device(7004);
    let chatty = bench.device(7005);
    let (manager, events) = bench.manager(ManagerConfig::default());

    let slow = manager.create(TransportKind::Tcp, Some("slow")).unwrap();
    let mut config = link_config(7004);
    if let TransportConfig::Tcp(tcp) = &mut config.transport {
        tcp.read_timeout_ms = 60_000;
    }
    manager.connect(&slow, Some(config)).unwrap();
    wait_connected(&events, &slow);
    let fast = manager.create(TransportKind::Tcp, Some("fast")).unwrap();
    manager.connect(&fast, Some(link_config(7005))).unwrap();
    wait_connected(&events, &fast);

    let started = Instant::now();
    chatty.send(&encode(Command::DeviceStatus, b"\x01", ChecksumMode::Crc16Modbus).unwrap());
    wait_for(&events, |e| matches!(e, LinkEvent::FrameReceived { name, .. } if name == "fast"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn send_is_validated_before_queueing() {
    let bench = Bench::default();
    let device = bench.device(7002);
    let (manager, events) = bench.manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, None).unwrap();

    assert!(matches!(
        manager.send("ghost", vec![1u8]),
        Err(LinkError::NotFound(_))
    ));
    assert!(matches!(
        manager.send(&name, vec![1u8]),
        Err(LinkError::NotConnected(_))
    ));

    manager.connect(&name, Some(link_config(7002))).unwrap();
    wait_connected(&events, &name);
    assert!(matches!(
        manager.send_frame(&name, Command::UpgradeData, vec![0u8; 256]),
        Err(LinkError::Frame(FrameError::PayloadTooLarge { size: 256, .. }))
    ));

    manager.send(&name, vec![0xAAu8, 0x55]).unwrap();
    assert_eq!(device.recv(), vec![0xAA, 0x55]);
}

#[test]
fn primary_follows_priority_and_state() {
    let bench = Bench::default();
    let _a = bench.device(7010);
    let _b = bench.device(7011);
    let (manager, events) = bench.manager(ManagerConfig::default());
    let first = manager.create(TransportKind::Tcp, None).unwrap();
    let second = manager.create(TransportKind::Tcp, None).unwrap();
    assert_eq!(manager.get_primary(), None);

    manager.connect(&first, Some(link_config(7010))).unwrap();
    wait_connected(&events, &first);
    manager.connect(&second, Some(link_config(7011))).unwrap();
    wait_connected(&events, &second);
    // Equal priority: the earlier link wins.
    assert_eq!(manager.get_primary().as_deref(), Some(first.as_str()));

    manager.set_priority(&second, -1).unwrap();
    assert_eq!(manager.get_primary().as_deref(), Some(second.as_str()));
    wait_for(&events, |e| {
        matches!(e, LinkEvent::PrimaryChanged { name: Some(n) } if *n == second)
    });
    assert_eq!(manager.links_by_priority(), vec![second.clone(), first.clone()]);

    manager.disconnect(&second).unwrap();
    wait_for(&events, |e| {
        matches!(e, LinkEvent::PrimaryChanged { name: Some(n) } if *n == first)
    });
    assert_eq!(manager.active_connection_count(), 1);
}

#[test]
fn broadcast_reaches_every_connected_link() {
    let bench = Bench::default();
    let a = bench.device(7020);
    let b = bench.device(7021);
    let (manager, events) = bench.manager(ManagerConfig::default());
    for port in [7020, 7021] {
        let name = manager.create(TransportKind::Tcp, None).unwrap();
        manager.connect(&name, Some(link_config(port))).unwrap();
        wait_connected(&events, &name);
    }
    // Never connected, so left out.
    manager.create(TransportKind::Tcp, Some("spare")).unwrap();

    let results = manager.broadcast(Command::EmergencyStop, Vec::new());
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let expected = encode(Command::EmergencyStop, &[], ChecksumMode::Crc16Modbus).unwrap();
    assert_eq!(a.recv(), expected.as_ref());
    assert_eq!(b.recv(), expected.as_ref());
}

#[test]
fn failed_connects_retry_then_stop() {
    let (manager, events) = Bench::default().manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, None).unwrap();
    manager.connect(&name, Some(link_config(7999))).unwrap();

    let mut attempts = Vec::new();
    loop {
        match wait_for(&events, |e| {
            matches!(
                e,
                LinkEvent::ReconnectAttempt { .. }
                    | LinkEvent::StateChanged {
                        state: LinkState::Disconnected,
                        ..
                    }
            )
        }) {
            LinkEvent::ReconnectAttempt { attempt, .. } => attempts.push(attempt),
            _ => break,
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    let snapshot = manager.snapshot(&name).unwrap();
    assert_eq!(snapshot.state, LinkState::Disconnected);
    assert!(snapshot.last_error.is_some());
}

#[test]
fn config_updates_are_checked_against_the_medium() {
    let (manager, _events) = Bench::default().manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, None).unwrap();

    let err = manager
        .update_config(&name, ConfigUpdate::BaudRate(115_200))
        .unwrap_err();
    assert!(matches!(err, LinkError::Config(e) if e.field == "baud_rate"));

    manager
        .update_config(&name, ConfigUpdate::KeepAlive(false))
        .unwrap();
    manager
        .update_config(&name, ConfigUpdate::HeartbeatInterval(Duration::from_secs(1)))
        .unwrap();

    let err = manager
        .connect(
            &name,
            Some(LinkConfig::serial(gluelink_transport::SerialConfig::new("/dev/ttyUSB0"))),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::KindMismatch {
            expected: TransportKind::Tcp,
            got: TransportKind::Serial,
            ..
        }
    ));
}

#[test]
fn monitoring_publishes_aggregate_stats() {
    let config = ManagerConfig {
        monitoring_interval_ms: 20,
        ..ManagerConfig::default()
    };
    let (manager, events) = Bench::default().manager(config);
    manager.create(TransportKind::Tcp, None).unwrap();
    manager.create(TransportKind::Serial, None).unwrap();
    let event = wait_for(&events, |e| {
        matches!(e, LinkEvent::StatsUpdated(agg) if agg.links == 2)
    });
    let LinkEvent::StatsUpdated(agg) = event else {
        unreachable!()
    };
    assert_eq!(agg.connected, 0);
}

#[test]
fn health_check_flags_quiet_links() {
    let bench = Bench::default();
    let _device = bench.device(7030);
    let config = ManagerConfig {
        health_check_interval_ms: 20,
        ..ManagerConfig::default()
    };
    let (manager, events) = bench.manager(config);
    let name = manager.create(TransportKind::Tcp, None).unwrap();
    let link = LinkConfig {
        heartbeat_interval_ms: 30,
        ..link_config(7030)
    };
    manager.connect(&name, Some(link)).unwrap();
    wait_connected(&events, &name);

    wait_for(&events, |e| matches!(e, LinkEvent::LinkInactive { .. }));
    let snapshot = manager.snapshot(&name).unwrap();
    assert!(snapshot.inactive);
    // Flagged only; the state machine is left alone.
    assert_eq!(snapshot.state, LinkState::Connected);
}

#[test]
fn remove_and_diagnostics() {
    let bench = Bench::default();
    let _device = bench.device(7040);
    let (manager, events) = bench.manager(ManagerConfig::default());
    let name = manager.create(TransportKind::Tcp, Some("dispenser")).unwrap();
    manager.connect(&name, Some(link_config(7040))).unwrap();
    wait_connected(&events, &name);

    let json = manager.diagnostic_json().unwrap();
    let report: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(report["primary"], "dispenser");
    assert_eq!(report["links"][0]["state"], "connected");
    assert_eq!(report["aggregate"]["links"], 1);

    manager.remove(&name).unwrap();
    wait_for(&events, |e| matches!(e, LinkEvent::PrimaryChanged { name: None }));
    wait_for(&events, |e| matches!(e, LinkEvent::Removed { name: n } if n == "dispenser"));
    assert!(manager.names().is_empty());
    assert_eq!(manager.get_primary(), None);
}

#[test]
fn idle_disconnected_links_are_reaped() {
    let bench = Bench::default();
    let _device = bench.device(7050);
    let config = ManagerConfig {
        cleanup_interval_ms: 20,
        idle_reap_secs: 0,
        ..ManagerConfig::default()
    };
    let (manager, events) = bench.manager(config);
    let live = manager.create(TransportKind::Tcp, Some("live")).unwrap();
    manager.connect(&live, Some(link_config(7050))).unwrap();
    wait_connected(&events, &live);
    let idle = manager.create(TransportKind::Tcp, Some("idle")).unwrap();

    wait_for(&events, |e| matches!(e, LinkEvent::Removed { name } if *name == idle));
    assert!(!manager.contains(&idle));
    assert!(matches!(manager.snapshot(&idle), Err(LinkError::NotFound(_))));

    // Several more sweeps go by; a connected link is never a candidate.
    std::thread::sleep(Duration::from_millis(100));
    assert!(manager.contains(&live));
    assert_eq!(manager.state(&live).unwrap(), LinkState::Connected);
    assert_eq!(manager.names(), vec![live]);
}

#[test]
fn shutdown_is_idempotent() {
    let (mut manager, _events) = Bench::default().manager(ManagerConfig::default());
    manager.create(TransportKind::Tcp, None).unwrap();
    manager.shutdown();
    manager.shutdown();
    assert!(matches!(
        manager.create(TransportKind::Tcp, None),
        Err(LinkError::ShutDown)
    ));
}

#[test]
fn tcp_loopback_device() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let frame = encode(Command::GetVersionInfo, b"1.2.0", ChecksumMode::Crc16Modbus).unwrap();
    let wire = frame.to_vec();
    let device = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(&wire).unwrap();
        let mut buf = [0u8; 7];
        sock.read_exact(&mut buf).unwrap();
        buf
    });

    let (manager, events) = LinkManager::channel(ManagerConfig::default()).unwrap();
    let name = manager.create(TransportKind::Tcp, None).unwrap();
    let config = LinkConfig {
        enable_heartbeat: false,
        ..LinkConfig::tcp(TcpConfig::new("127.0.0.1", port))
    };
    manager.connect(&name, Some(config)).unwrap();
    wait_connected(&events, &name);

    let event = wait_for(&events, |e| matches!(e, LinkEvent::FrameReceived { .. }));
    let LinkEvent::FrameReceived { frame, .. } = event else {
        unreachable!()
    };
    assert_eq!(frame.command(), Some(Command::GetVersionInfo));
    assert_eq!(frame.payload.as_ref(), b"1.2.0");

    manager.send_frame(&name, Command::DeviceStop, Vec::new()).unwrap();
    let got = device.join().unwrap();
    let expected = encode(Command::DeviceStop, &[], ChecksumMode::Crc16Modbus).unwrap();
    assert_eq!(&got[..], expected.as_ref());
}
