#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # demag-ble 🧲
//!
//! A Rust library for driving transformer demagnetization devices over
//! Bluetooth Low Energy.
//!
//! The device exposes one GATT service with seven characteristics: PID
//! configuration, starting current, a start/stop command, and live state,
//! cycle and current notifications plus a per-cycle statistics table. This
//! crate covers the client side of that protocol:
//!
//! - **Codec**: fixed-layout little-endian payloads ([`protocol`])
//! - **Session**: connect/disconnect, request/response operations and live
//!   subscriptions that survive reconnects ([`DeviceSession`])
//! - **Auto-reconnect**: linear backoff driven by connection state
//!   transitions ([`ReconnectSupervisor`])
//! - **Run tracking**: per-cycle peak current and duration, finalized when the
//!   device reports completion ([`CycleAggregator`], [`RunController`])
//! - **Discovery**: a time-windowed list of advertising devices ([`Discovery`])
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: the device drives large currents through transformer
//! windings. Make sure the circuit is assembled as the device instructs before
//! sending the start command, and keep a way to stop the run at hand.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use demag_ble::{
//!     calc_start_current, BleManager, Conf, DeviceSession, LinkFactory, RunController,
//!     SessionConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::default();
//!     let manager = BleManager::new(config.clone()).await?;
//!     let session = Arc::new(DeviceSession::new(manager.open("AA:BB:CC:DD:EE:FF"), config));
//!
//!     session.connect().await?;
//!     session.set_config(Conf::new(1.0, 0.1, 0.0)).await?;
//!     session.set_start_current(calc_start_current(381.7, 0.45)).await?;
//!
//!     let controller = RunController::spawn(session);
//!     controller.start().await?;
//!
//!     let mut snapshot = controller.subscribe();
//!     let done = snapshot.wait_for(|s| s.summary.is_some()).await?.clone();
//!     println!("{:#?}", done.summary);
//!
//!     controller.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// btleplug implementation of the transport
pub mod ble;
/// Run controller publishing UI-facing snapshots
pub mod controller;
/// Advertisement registry and scanning
pub mod discovery;
/// Error types and handling
pub mod error;
/// GATT characteristics and payload codec
pub mod protocol;
/// Auto-reconnect supervisor
pub mod reconnect;
/// Cycle aggregation and run state machine
pub mod run;
/// Device session and device selection
pub mod session;
/// Persisted settings
pub mod settings;
/// Transport abstraction over BLE
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use ble::{BleLink, BleManager, BleScanner};
pub use controller::{RunController, RunSnapshot};
pub use discovery::{DeviceRegistry, Discovery};
pub use error::{DemagError, Result};
pub use protocol::{Characteristic, Command, DeviceEvent, Payload, SERVICE_UUID};
pub use reconnect::{Backoff, ReconnectSupervisor};
pub use run::{CycleAggregator, RunPhase};
pub use session::{DeviceSession, SessionSlot};
pub use settings::{JsonFileStore, KeyValueStore, MemoryStore, Settings};
pub use transport::{AdvertisementSource, LinkFactory, PeripheralLink};
pub use types::{
    calc_start_current, Advertisement, Conf, ConnectionState, Cycle, CycleStat,
    DeviceCycleStat, DeviceInfo, DeviceState, DiscoveryConfig, RunSummary, SessionConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
