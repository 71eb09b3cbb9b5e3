//! Connection management for dispenser controllers.
//!
//! This is the link layer of gluelink. A [`Link`] drives one transport
//! through `Disconnected → Connecting → Connected`, with bounded automatic
//! reconnects, heartbeat liveness checks and inbound frame validation.
//! A [`LinkManager`] hosts many named links on a single I/O thread and
//! hands decoded frames to a frame worker through a bounded
//! [`DispatchQueue`].
//!
//! # Example
//!
//! ```no_run
//! use gluelink_link::{LinkConfig, LinkManager, ManagerConfig};
//! use gluelink_frame::Command;
//! use gluelink_transport::{TcpConfig, TransportKind};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (manager, events) = LinkManager::channel(ManagerConfig::default())?;
//! let name = manager.create(TransportKind::Tcp, None)?;
//! manager.connect(&name, Some(LinkConfig::tcp(TcpConfig::new("10.0.0.5", 502))))?;
//!
//! for event in events.iter() {
//!     println!("{event}");
//!     if event.kind() == "connected" {
//!         manager.send_frame(&name, Command::DeviceStatus, Vec::new())?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod link;
pub mod manager;
pub mod state;
pub mod timer;

pub use config::{ConfigUpdate, LinkConfig, ManagerConfig};
pub use dispatch::{run_frame_worker, Admission, DispatchQueue, QueueMetrics, WorkItem, PRIORITY_BANDS};
pub use error::{LinkError, Result};
pub use event::{ChannelSink, EventSink, LinkEvent, NullSink};
pub use heartbeat::HeartbeatTracker;
pub use link::{Link, Outbox, READ_CHUNK};
pub use manager::{DefaultTransportFactory, DiagnosticReport, LinkManager, TransportFactory};
pub use state::{AggregateStats, LinkSnapshot, LinkState, LinkStats, LinkStatus};
pub use timer::{LinkId, TimerId, TimerKind, TimerWheel};
