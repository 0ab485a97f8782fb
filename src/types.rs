use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::DemagError;

/// PID controller coefficients stored on the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Conf {
    /// Proportional gain
    pub kp: f32,
    /// Integral gain
    pub ki: f32,
    /// Derivative gain
    pub kd: f32,
}

impl Conf {
    /// Create a new configuration
    #[must_use]
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }
}

/// One polarity/current phase of the demagnetization sequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    /// Cycle number, starting at 1
    pub num: u32,
    /// Current the device is trying to reach in this cycle
    pub target_current: f32,
    /// Polarity of the applied current
    pub polarity: bool,
}

impl Default for Cycle {
    fn default() -> Self {
        Self {
            num: 1,
            target_current: 0.0,
            polarity: false,
        }
    }
}

/// Per-cycle record as reported by the device's statistics characteristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceCycleStat {
    /// Cycle number
    pub num: u32,
    /// Target current of the cycle
    pub target_current: f32,
    /// Current measured by the device
    pub measured_current: f32,
    /// Cycle duration in device units
    pub duration: u64,
}

/// Statistics for one closed cycle, accumulated on the client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleStat {
    /// Snapshot of the cycle as it was announced
    pub cycle: Cycle,
    /// Highest current observed while the cycle was open
    pub peak_current: f32,
    /// Time between this cycle's announcement and the next one
    pub duration_ms: u64,
}

/// Finalized result of a completed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Closed cycles in announcement order
    pub results: Vec<CycleStat>,
    /// Sum of all recorded cycle durations
    pub total_duration_ms: u64,
}

impl RunSummary {
    /// Build a summary from closed cycles
    #[must_use]
    pub fn from_results(results: Vec<CycleStat>) -> Self {
        let total_duration_ms = results.iter().map(|stat| stat.duration_ms).sum();
        Self {
            results,
            total_duration_ms,
        }
    }
}

/// Device state reported over the state characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceState {
    /// ADC voltage offset is not set
    NoVoltageOffset = 0,
    /// Waiting for the demagnetization circuit to be assembled
    MakeSchema = 1,
    /// Required current could not be reached
    CantSetCurrent = 2,
    /// All cycles completed
    CyclesEnded = 3,
    /// Cycles stopped by the operator
    CyclesStopped = 4,
    /// Test phase running
    InTest = 5,
    /// Main demagnetization running
    InMain = 6,
    /// Cycles aborted by an ADC error
    CyclesAbortedAdcError = 7,
}

impl DeviceState {
    /// Every state in ordinal order
    pub const ALL: [Self; 8] = [
        Self::NoVoltageOffset,
        Self::MakeSchema,
        Self::CantSetCurrent,
        Self::CyclesEnded,
        Self::CyclesStopped,
        Self::InTest,
        Self::InMain,
        Self::CyclesAbortedAdcError,
    ];

    /// Device is running a cycle sequence
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::InTest | Self::InMain)
    }

    /// Device is not running a cycle sequence
    #[must_use]
    pub const fn is_idle(self) -> bool {
        !self.is_active()
    }

    /// Wire ordinal
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DeviceState {
    type Error = DemagError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(DemagError::InvalidState(value))
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoVoltageOffset => write!(f, "ADC voltage offset is not set"),
            Self::MakeSchema => write!(f, "Assemble the demagnetization circuit"),
            Self::CantSetCurrent => write!(
                f,
                "Failed to set the required current, load resistance may be too high"
            ),
            Self::CyclesEnded => write!(f, "Demagnetization completed"),
            Self::CyclesStopped => write!(f, "Demagnetization stopped"),
            Self::InTest => write!(f, "Testing in progress"),
            Self::InMain => write!(f, "Demagnetization in progress"),
            Self::CyclesAbortedAdcError => write!(f, "Demagnetization aborted (ADC error)"),
        }
    }
}

/// Transport lifecycle of a peripheral link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Link establishment in progress
    Connecting,
    /// Link up and services discovered
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Link down, with the transport's reason when known
    Disconnected(Option<String>),
}

impl ConnectionState {
    /// Link is usable for requests
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected(None)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected(None) => write!(f, "Disconnected"),
            Self::Disconnected(Some(reason)) => write!(f, "Disconnected ({reason})"),
        }
    }
}

/// Raw advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Stable peripheral address
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: i16,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// Device entry shown in a device picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Peripheral address
    pub address: String,
    /// Advertised name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl From<&Advertisement> for DeviceInfo {
    fn from(advertisement: &Advertisement) -> Self {
        Self {
            address: advertisement.address.clone(),
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
        }
    }
}

/// Session timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for a disconnect in milliseconds
    pub disconnect_timeout_ms: u64,
    /// Amount added to the reconnect delay after every disconnect
    pub reconnect_step_ms: u64,
    /// How long to scan for a peripheral the adapter has not seen yet
    pub locate_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            disconnect_timeout_ms: 5_000,
            reconnect_step_ms: 2_000,
            locate_timeout_ms: 10_000,
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Advertisements older than this are dropped from the visible set
    pub advertisement_ttl_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertisement_ttl_ms: 5_000,
        }
    }
}

/// Starting demagnetization current for a transformer winding
///
/// `nominal_current` is the rated current in amperes and `no_load_percent`
/// the no-load current as a percentage of it.
#[must_use]
pub fn calc_start_current(nominal_current: f32, no_load_percent: f32) -> f32 {
    (no_load_percent * nominal_current) / 100.0 * 2.0
}
