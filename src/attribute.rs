// GATT attribute model: characteristic identities, the handle table filled in
// at registration, and the wire encodings of each characteristic value

use std::fmt::{self, Write};

use log::debug;

use crate::link::AttrHandle;
use crate::sensor_cache::SensorReading;

// 16-bit assigned numbers
pub const ENVIRONMENTAL_SENSING_SERVICE_UUID: u16 = 0x181A;
pub const BATTERY_SERVICE_UUID: u16 = 0x180F;
pub const TEMPERATURE_CHAR_UUID: u16 = 0x2A6E;
pub const HUMIDITY_CHAR_UUID: u16 = 0x2A6F;
pub const BATTERY_PERCENTAGE_CHAR_UUID: u16 = 0x2A1B;
pub const CLIENT_CONFIG_DESCR_UUID: u16 = 0x2902;

/// Longest encoded value of any characteristic ("255%" fits with room to spare).
pub const MAX_VALUE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    EnvironmentalSensing,
    Battery,
}

impl ServiceId {
    pub const ALL: [ServiceId; 2] = [ServiceId::EnvironmentalSensing, ServiceId::Battery];

    pub fn uuid16(self) -> u16 {
        match self {
            ServiceId::EnvironmentalSensing => ENVIRONMENTAL_SENSING_SERVICE_UUID,
            ServiceId::Battery => BATTERY_SERVICE_UUID,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.uuid16() == uuid)
    }

    pub fn characteristics(self) -> impl Iterator<Item = CharacteristicId> {
        CharacteristicId::ALL
            .into_iter()
            .filter(move |c| c.service() == self)
    }
}

/// The three read/indicate characteristics exposed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    Temperature,
    Humidity,
    BatteryPercentage,
}

impl CharacteristicId {
    pub const COUNT: usize = 3;
    pub const ALL: [CharacteristicId; Self::COUNT] = [
        CharacteristicId::Temperature,
        CharacteristicId::Humidity,
        CharacteristicId::BatteryPercentage,
    ];

    pub fn index(self) -> usize {
        match self {
            CharacteristicId::Temperature => 0,
            CharacteristicId::Humidity => 1,
            CharacteristicId::BatteryPercentage => 2,
        }
    }

    pub fn uuid16(self) -> u16 {
        match self {
            CharacteristicId::Temperature => TEMPERATURE_CHAR_UUID,
            CharacteristicId::Humidity => HUMIDITY_CHAR_UUID,
            CharacteristicId::BatteryPercentage => BATTERY_PERCENTAGE_CHAR_UUID,
        }
    }

    pub fn from_uuid16(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid16() == uuid)
    }

    pub fn service(self) -> ServiceId {
        match self {
            CharacteristicId::Temperature | CharacteristicId::Humidity => {
                ServiceId::EnvironmentalSensing
            }
            CharacteristicId::BatteryPercentage => ServiceId::Battery,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CharacteristicId::Temperature => "temperature",
            CharacteristicId::Humidity => "humidity",
            CharacteristicId::BatteryPercentage => "battery",
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute handles handed out by the stack at registration time.
/// Empty until the services are registered; immutable in practice afterwards.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    handles: [Option<AttrHandle>; CharacteristicId::COUNT],
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, characteristic: CharacteristicId, handle: AttrHandle) {
        debug!("Registered {} value handle {}", characteristic, handle);
        self.handles[characteristic.index()] = Some(handle);
    }

    pub fn handle(&self, characteristic: CharacteristicId) -> Option<AttrHandle> {
        self.handles[characteristic.index()]
    }

    pub fn characteristic(&self, handle: AttrHandle) -> Option<CharacteristicId> {
        CharacteristicId::ALL
            .into_iter()
            .find(|c| self.handles[c.index()] == Some(handle))
    }

    pub fn is_complete(&self) -> bool {
        self.handles.iter().all(Option::is_some)
    }
}

/// An encoded characteristic value, at most `MAX_VALUE_LEN` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeValue {
    bytes: [u8; MAX_VALUE_LEN],
    len: usize,
}

impl AttributeValue {
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(MAX_VALUE_LEN);
        let mut bytes = [0u8; MAX_VALUE_LEN];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { bytes, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy into a caller-supplied response buffer.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        if buf.len() < self.len {
            return Err(EncodeError::BufferTooSmall {
                needed: self.len,
                available: buf.len(),
            });
        }
        buf[..self.len].copy_from_slice(self.as_bytes());
        Ok(self.len)
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x?}", self.as_bytes())
    }
}

// Text sink for the battery encoding, fails instead of truncating
impl Write for AttributeValue {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > MAX_VALUE_LEN {
            return Err(fmt::Error);
        }
        self.bytes[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeError {
    /// The scaled value does not fit the wire type. `saturated` holds the
    /// value clamped to the representable range.
    OutOfRange {
        characteristic: CharacteristicId,
        value: f32,
        saturated: AttributeValue,
    },
    BufferTooSmall {
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::OutOfRange {
                characteristic,
                value,
                ..
            } => write!(f, "{} value {} out of encodable range", characteristic, value),
            EncodeError::BufferTooSmall { needed, available } => write!(
                f,
                "response buffer too small: need {} bytes, have {}",
                needed, available
            ),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Scale by 100, round, and encode as little-endian i16.
/// Err carries the saturated encoding when the scaled value overflows i16 (or is NaN).
pub fn encode_centi(value: f32) -> Result<[u8; 2], [u8; 2]> {
    let scaled = (value * 100.0).round();
    // `as` saturates at the i16 bounds and maps NaN to 0
    let clamped = (scaled as i16).to_le_bytes();
    if scaled.is_nan() || scaled < i16::MIN as f32 || scaled > i16::MAX as f32 {
        Err(clamped)
    } else {
        Ok(clamped)
    }
}

pub fn decode_centi(bytes: [u8; 2]) -> f32 {
    i16::from_le_bytes(bytes) as f32 / 100.0
}

/// ASCII decimal followed by '%', no padding: 7 -> "7%", 100 -> "100%".
pub fn encode_battery_level(level: u8) -> AttributeValue {
    let mut value = AttributeValue::default();
    // At most "255%", always fits
    let _ = write!(value, "{}%", level);
    value
}

/// Encode the current value of `characteristic` from a cache snapshot.
pub fn encode(
    characteristic: CharacteristicId,
    reading: &SensorReading,
) -> Result<AttributeValue, EncodeError> {
    let value = match characteristic {
        CharacteristicId::Temperature => reading.temperature,
        CharacteristicId::Humidity => reading.humidity,
        CharacteristicId::BatteryPercentage => {
            // Truncates toward zero, saturates into 0..=255
            return Ok(encode_battery_level(reading.battery_percentage as u8));
        }
    };

    encode_centi(value)
        .map(|bytes| AttributeValue::from_slice(&bytes))
        .map_err(|bytes| EncodeError::OutOfRange {
            characteristic,
            value,
            saturated: AttributeValue::from_slice(&bytes),
        })
}
