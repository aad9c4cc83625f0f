//! Monitor per-cell voltages of a battery management system over a
//! serial-style or BLE diagnostic adapter.
//!
//! The BMS broadcasts one telemetry frame per six-cell module, addressed
//! by a fixed offset scheme. This crate decodes those frames (ASCII-hex
//! lines on stream transports, 13-byte packets on BLE), keeps a live view
//! of every module with min/max/spread statistics, and can issue verified
//! diagnostic exchanges such as clearing stored fault codes.
//!
//! What you get:
//!
//! - Per-cell voltages (V), with physically impossible readings flagged
//! - Pack-wide max/min voltage and cell spread
//! - Connection lifecycle with adapter auto-configuration
//! - A single-flight diagnostic command channel with response matching,
//!   timeout, and explicit retry
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() {
//!     let config = cellwatch::MonitorConfig::default();
//!     let mut monitor = cellwatch::BmsMonitor::new(config);
//!     let mut snapshots = monitor.subscribe_snapshots();
//!
//!     let adapter = cellwatch::TcpAdapter;
//!     monitor.connect(&adapter, "192.168.0.10:35000").await.unwrap();
//!
//!     while snapshots.changed().await.is_ok() {
//!         let snapshot = snapshots.borrow_and_update().clone();
//!         if let Some(stats) = &snapshot.stats {
//!             println!(
//!                 "{} modules, {:.3} V .. {:.3} V (spread {:.3} V)",
//!                 snapshot.modules.len(),
//!                 stats.min_voltage,
//!                 stats.max_voltage,
//!                 stats.voltage_diff,
//!             );
//!         }
//!     }
//! # }
//! ```

mod aggregate;
mod config;
mod error;
mod frame;
mod monitor;
mod session;
mod state;
mod transport;

pub use aggregate::VoltageAggregator;
pub use config::{ClearFaultConfig, MonitorConfig};
pub use error::{Error, Result};
pub use frame::{Codec, Decoded, FrameParser};
pub use monitor::BmsMonitor;
pub use session::{CommandSession, DiagnosticRequest};
pub use state::{Cell, ConnectionState, Module, MonitorEvent, PackSnapshot, VoltageStats};
pub use transport::ble::BleAdapter;
pub use transport::stream::{StreamLink, TcpAdapter};
pub use transport::{Adapter, Link};
