use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use gluelink_link::{LinkConfig, LinkEvent, LinkManager, ManagerConfig};
use gluelink_transport::{SerialConfig, TcpConfig};
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, MonitorArgs};
use crate::exit::{link_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT, TRANSPORT_ERROR};
use crate::output::{print_snapshot, OutputFormat};

const LINK_NAME: &str = "monitor";
const TICK: Duration = Duration::from_millis(50);

pub fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let config = link_config(&args)?;
    let duration = parse_duration("duration", &args.duration)?;
    let connect_timeout = config.connect_timeout();

    let (mut manager, events) = LinkManager::channel(ManagerConfig::default())
        .map_err(|err| link_error("manager start failed", err))?;
    manager
        .create(config.kind(), Some(LINK_NAME))
        .map_err(|err| link_error("create failed", err))?;
    manager
        .connect(LINK_NAME, Some(config))
        .map_err(|err| link_error("connect failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let started = Instant::now();
    let mut connected_at: Option<Instant> = None;

    while running.load(Ordering::SeqCst) {
        if let Some(at) = connected_at {
            if at.elapsed() >= duration {
                break;
            }
        } else if started.elapsed() >= connect_timeout + TICK * 4 {
            manager.shutdown();
            return Err(CliError::new(TIMEOUT, "timed out waiting for connection"));
        }

        let event = match events.recv_timeout(TICK) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if event.link().is_some_and(|name| name != LINK_NAME) {
            continue;
        }

        match &event {
            LinkEvent::Connected { .. } => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "{event}");
                connected_at = Some(Instant::now());
            }
            LinkEvent::Error { message, .. } if connected_at.is_none() => {
                manager.shutdown();
                return Err(CliError::new(TRANSPORT_ERROR, message.clone()));
            }
            LinkEvent::Error { .. } | LinkEvent::Disconnected { .. } => {
                warn!("{event}");
                break;
            }
            LinkEvent::DataReceived { .. }
            | LinkEvent::DataSent { .. }
            | LinkEvent::StatsUpdated(_)
            | LinkEvent::Pool(_) => debug!("{event}"),
            _ => info!("{event}"),
        }
    }

    let snapshot = manager
        .snapshot(LINK_NAME)
        .map_err(|err| link_error("snapshot failed", err))?;
    print_snapshot(&snapshot, format);
    manager.shutdown();
    Ok(SUCCESS)
}

fn link_config(args: &MonitorArgs) -> CliResult<LinkConfig> {
    let mut config = match (&args.tcp, &args.serial) {
        (Some(addr), _) => {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| CliError::usage(format!("expected host:port, got {addr}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| CliError::usage(format!("invalid port: {port}")))?;
            LinkConfig::tcp(TcpConfig::new(host, port))
        }
        (None, Some(port)) => {
            let mut serial = SerialConfig::new(port.as_str());
            serial.baud_rate = args.baud;
            LinkConfig::serial(serial)
        }
        (None, None) => return Err(CliError::usage("a --tcp or --serial target is required")),
    };

    config.auto_reconnect = false;
    config.heartbeat_interval_ms = parse_duration("heartbeat", &args.heartbeat)?.as_millis() as u64;
    config.connect_timeout_ms =
        parse_duration("connect timeout", &args.connect_timeout)?.as_millis() as u64;
    config.checksum = args.checksum;
    config
        .validate()
        .map_err(|err| CliError::usage(err.to_string()))?;
    Ok(config)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gluelink_frame::ChecksumMode;
    use gluelink_transport::TransportKind;

    fn args(tcp: Option<&str>, serial: Option<&str>) -> MonitorArgs {
        MonitorArgs {
            tcp: tcp.map(str::to_string),
            serial: serial.map(str::to_string),
            baud: 115_200,
            duration: "1s".into(),
            heartbeat: "250ms".into(),
            connect_timeout: "2s".into(),
            checksum: ChecksumMode::Additive,
        }
    }

    #[test]
    fn tcp_target_is_split() {
        let config = link_config(&args(Some("10.0.0.5:502"), None)).unwrap();
        assert_eq!(config.kind(), TransportKind::Tcp);
        assert!(!config.auto_reconnect);
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.connect_timeout_ms, 2000);
        assert_eq!(config.checksum, ChecksumMode::Additive);
    }

    #[test]
    fn serial_target_takes_baud() {
        let config = link_config(&args(None, Some("/dev/ttyUSB0"))).unwrap();
        match config.transport {
            gluelink_transport::TransportConfig::Serial(serial) => {
                assert_eq!(serial.port_name, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 115_200);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn malformed_address_is_usage_error() {
        let err = link_config(&args(Some("nohost"), None)).unwrap_err();
        assert_eq!(err.code, crate::exit::USAGE);
        let err = link_config(&args(Some("host:99999"), None)).unwrap_err();
        assert_eq!(err.code, crate::exit::USAGE);
    }
}
