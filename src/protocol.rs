use crate::{
    error::{DemagError, Result},
    types::{Conf, Cycle, DeviceCycleStat, DeviceState},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Demagnetizer GATT service UUID
///
/// Sibling characteristics share this prefix and differ in the last byte.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xABAE_BF19_EDE9_497D_A91D_0EF8_B66A_9904);

/// Size of the configuration payload
pub const CONF_SIZE: usize = 12;

/// Size of the cycle payload
pub const CYCLE_SIZE: usize = 9;

/// Size of a float scalar payload (start current, current)
pub const CURRENT_SIZE: usize = 4;

/// Size of the state payload
pub const STATE_SIZE: usize = 1;

/// Stride of one record in the statistics payload
pub const CYCLE_STAT_RECORD_SIZE: usize = 20;

/// Trailing bytes after the statistics records
///
/// Only counted when computing the record count; carries nothing we decode.
pub const CYCLE_STAT_TRAILER_SIZE: usize = 8;

/// Characteristics exposed by the demagnetizer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Characteristic {
    /// PID coefficients, read/write
    Config,
    /// Starting current, read/write
    StartCurrent,
    /// Start/stop commands, write
    Command,
    /// Device state, read/notify
    State,
    /// Current cycle, read/notify
    Cycle,
    /// Measured current, read/notify
    Current,
    /// Per-cycle statistics, read
    CyclesStat,
}

impl Characteristic {
    /// Every characteristic of the service
    pub const ALL: [Self; 7] = [
        Self::Config,
        Self::StartCurrent,
        Self::Command,
        Self::State,
        Self::Cycle,
        Self::Current,
        Self::CyclesStat,
    ];

    /// Characteristics the device pushes notifications on
    pub const NOTIFYING: [Self; 3] = [Self::State, Self::Cycle, Self::Current];

    const fn suffix(self) -> u8 {
        match self {
            Self::Config => 0x14,
            Self::StartCurrent => 0x24,
            Self::Command => 0x34,
            Self::State => 0x44,
            Self::Cycle => 0x54,
            Self::Current => 0x64,
            Self::CyclesStat => 0x74,
        }
    }

    /// Full 128-bit UUID of the characteristic
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        let base = SERVICE_UUID.as_u128() & !0xFF;
        Uuid::from_u128(base | self.suffix() as u128)
    }

    /// Look up a characteristic by UUID
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

/// Single-byte commands written to the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Begin the cycle sequence
    Start = 1,
    /// Stop the cycle sequence
    Stop = 2,
}

/// Fixed-layout little-endian payload carried by a characteristic
pub trait Payload: Sized {
    /// Name used in decode errors
    const WHAT: &'static str;

    /// Serialize to wire bytes
    fn encode(&self) -> Bytes;

    /// Parse wire bytes, requiring the exact layout
    ///
    /// # Errors
    ///
    /// Returns [`DemagError::Decode`] for a malformed payload.
    fn decode(raw: &[u8]) -> Result<Self>;

    /// Value a device reports before the characteristic is initialized
    ///
    /// # Errors
    ///
    /// Returns an error for payloads that must never be empty.
    fn empty() -> Result<Self>;

    /// Parse the response of a read request
    ///
    /// An empty payload is a valid "uninitialized" answer and maps to
    /// [`Payload::empty`].
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed payloads.
    fn decode_read(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            Self::empty()
        } else {
            Self::decode(raw)
        }
    }
}

fn expect_len(what: &'static str, raw: &[u8], expected: usize) -> Result<()> {
    if raw.len() == expected {
        Ok(())
    } else {
        Err(DemagError::decode(
            what,
            format!("expected {expected} bytes, got {}", raw.len()),
        ))
    }
}

impl Payload for Conf {
    const WHAT: &'static str = "config";

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONF_SIZE);
        buf.put_f32_le(self.kp);
        buf.put_f32_le(self.ki);
        buf.put_f32_le(self.kd);
        buf.freeze()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        expect_len(Self::WHAT, raw, CONF_SIZE)?;
        let mut buf = raw;
        Ok(Self {
            kp: buf.get_f32_le(),
            ki: buf.get_f32_le(),
            kd: buf.get_f32_le(),
        })
    }

    fn empty() -> Result<Self> {
        Ok(Self::default())
    }
}

impl Payload for Cycle {
    const WHAT: &'static str = "cycle";

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CYCLE_SIZE);
        buf.put_u32_le(self.num);
        buf.put_f32_le(self.target_current);
        buf.put_u8(u8::from(self.polarity));
        buf.freeze()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        expect_len(Self::WHAT, raw, CYCLE_SIZE)?;
        let mut buf = raw;
        Ok(Self {
            num: buf.get_u32_le(),
            target_current: buf.get_f32_le(),
            polarity: buf.get_u8() != 0,
        })
    }

    fn empty() -> Result<Self> {
        Ok(Self::default())
    }
}

impl Payload for f32 {
    const WHAT: &'static str = "current";

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.to_le_bytes())
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        expect_len(Self::WHAT, raw, CURRENT_SIZE)?;
        let mut buf = raw;
        Ok(buf.get_f32_le())
    }

    fn empty() -> Result<Self> {
        Ok(0.0)
    }
}

impl Payload for DeviceState {
    const WHAT: &'static str = "state";

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.ordinal()])
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(DemagError::EmptyState);
        }
        expect_len(Self::WHAT, raw, STATE_SIZE)?;
        Self::try_from(raw[0])
    }

    fn empty() -> Result<Self> {
        Err(DemagError::EmptyState)
    }
}

impl Payload for Command {
    const WHAT: &'static str = "command";

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[*self as u8])
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        expect_len(Self::WHAT, raw, 1)?;
        match raw[0] {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            other => Err(DemagError::decode(
                Self::WHAT,
                format!("unknown command code {other}"),
            )),
        }
    }

    fn empty() -> Result<Self> {
        Err(DemagError::decode(Self::WHAT, "empty payload"))
    }
}

/// Statistics list: `count = (len - 8) / 20` records followed by an 8-byte trailer
impl Payload for Vec<DeviceCycleStat> {
    const WHAT: &'static str = "cycles stat";

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.len() * CYCLE_STAT_RECORD_SIZE + CYCLE_STAT_TRAILER_SIZE,
        );
        for stat in self {
            buf.put_u32_le(stat.num);
            buf.put_f32_le(stat.target_current);
            buf.put_f32_le(stat.measured_current);
            buf.put_u64_le(stat.duration);
        }
        buf.put_bytes(0, CYCLE_STAT_TRAILER_SIZE);
        buf.freeze()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        // floored; a partial record or a payload shorter than the trailer is ignored
        let count = raw.len().saturating_sub(CYCLE_STAT_TRAILER_SIZE) / CYCLE_STAT_RECORD_SIZE;

        let mut buf = &raw[..count * CYCLE_STAT_RECORD_SIZE];
        let mut stats = Vec::with_capacity(count);
        while buf.has_remaining() {
            stats.push(DeviceCycleStat {
                num: buf.get_u32_le(),
                target_current: buf.get_f32_le(),
                measured_current: buf.get_f32_le(),
                duration: buf.get_u64_le(),
            });
        }
        Ok(stats)
    }

    fn empty() -> Result<Self> {
        Ok(Vec::new())
    }
}

/// Decoded notification from one of the notifying characteristics
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceEvent {
    /// State changed
    State(DeviceState),
    /// New cycle began
    Cycle(Cycle),
    /// Current measurement
    Current(f32),
}

impl DeviceEvent {
    /// Decode a raw notification coming from `characteristic`
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed payloads or characteristics that
    /// never notify.
    pub fn decode(characteristic: Characteristic, raw: &[u8]) -> Result<Self> {
        match characteristic {
            Characteristic::State => DeviceState::decode(raw).map(Self::State),
            Characteristic::Cycle => Cycle::decode(raw).map(Self::Cycle),
            Characteristic::Current => f32::decode(raw).map(Self::Current),
            other => Err(DemagError::decode(
                "notification",
                format!("{other:?} does not notify"),
            )),
        }
    }

    /// Characteristic this event originates from
    #[must_use]
    pub const fn characteristic(&self) -> Characteristic {
        match self {
            Self::State(_) => Characteristic::State,
            Self::Cycle(_) => Characteristic::Cycle,
            Self::Current(_) => Characteristic::Current,
        }
    }
}
