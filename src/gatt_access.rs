// Attribute access dispatch: reads are answered from the sensor cache,
// client configuration writes land in the subscription registry.

use std::fmt;

use log::{debug, warn};

use crate::attribute::{encode, AttributeTable, AttributeValue, EncodeError};
use crate::link::{AttrHandle, ConnHandle, SubscribeEvent};
use crate::sensor_cache::SensorReading;
use crate::subscription::SubscriptionRegistry;

// ATT error codes
pub const ATT_ERR_UNLIKELY: u8 = 0x0E;
pub const ATT_ERR_INSUFFICIENT_RESOURCES: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResponse {
    Value(AttributeValue),
    // Attribute is not one of ours; success with an empty body
    NoContent,
}

impl AccessResponse {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AccessResponse::Value(value) => value.as_bytes(),
            AccessResponse::NoContent => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    Unlikely,
    InsufficientResources,
}

impl AccessError {
    pub fn att_code(self) -> u8 {
        match self {
            AccessError::Unlikely => ATT_ERR_UNLIKELY,
            AccessError::InsufficientResources => ATT_ERR_INSUFFICIENT_RESOURCES,
        }
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Unlikely => write!(f, "unlikely error (0x{:02X})", ATT_ERR_UNLIKELY),
            AccessError::InsufficientResources => write!(
                f,
                "insufficient resources (0x{:02X})",
                ATT_ERR_INSUFFICIENT_RESOURCES
            ),
        }
    }
}

impl std::error::Error for AccessError {}

impl From<EncodeError> for AccessError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::BufferTooSmall { .. } => AccessError::InsufficientResources,
            EncodeError::OutOfRange { .. } => AccessError::Unlikely,
        }
    }
}

pub type AccessResult = Result<AccessResponse, AccessError>;

/// Answer one attribute access against a snapshot of the sensor cache.
pub fn dispatch_access(
    table: &AttributeTable,
    reading: &SensorReading,
    conn: ConnHandle,
    attr: AttrHandle,
    op: AccessOp,
) -> AccessResult {
    let Some(characteristic) = table.characteristic(attr) else {
        debug!(
            "Access {:?} on unknown attr_handle={} from conn_handle={}",
            op, attr, conn
        );
        return Ok(AccessResponse::NoContent);
    };

    match op {
        AccessOp::ReadCharacteristic => {
            let value = match encode(characteristic, reading) {
                Ok(value) => value,
                Err(EncodeError::OutOfRange {
                    value, saturated, ..
                }) => {
                    warn!(
                        "⚠️ {} value {} out of range, sending saturated {:?}",
                        characteristic, value, saturated
                    );
                    saturated
                }
                Err(e) => return Err(e.into()),
            };
            debug!(
                "📖 Read {} by conn_handle={}: {:?}",
                characteristic, conn, value
            );
            Ok(AccessResponse::Value(value))
        }
        other => {
            warn!(
                "⚠️ Unsupported {:?} on {} from conn_handle={}",
                other, characteristic, conn
            );
            Err(AccessError::Unlikely)
        }
    }
}

/// Route a subscription change to the registry. Returns false when the
/// attribute handle is not one of ours.
pub fn dispatch_subscribe(
    table: &AttributeTable,
    registry: &mut SubscriptionRegistry,
    event: &SubscribeEvent,
) -> bool {
    match table.characteristic(event.attr) {
        Some(characteristic) => {
            registry.on_subscribe(characteristic, event.conn, event.cur_indicate);
            true
        }
        None => {
            debug!(
                "Subscribe on unknown attr_handle={} from conn_handle={}, ignoring",
                event.attr, event.conn
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{encode_centi, CharacteristicId};
    use crate::subscription::DisconnectPolicy;

    fn table() -> AttributeTable {
        let mut table = AttributeTable::new();
        table.register(CharacteristicId::Temperature, 10);
        table.register(CharacteristicId::Humidity, 13);
        table.register(CharacteristicId::BatteryPercentage, 20);
        table
    }

    fn reading() -> SensorReading {
        SensorReading {
            temperature: 23.45,
            humidity: 51.2,
            battery_voltage: 3.95,
            battery_percentage: 78.6,
        }
    }

    #[test]
    fn read_returns_encoded_snapshot() {
        let t = table();
        let r = reading();
        let temp = dispatch_access(&t, &r, 1, 10, AccessOp::ReadCharacteristic).unwrap();
        assert_eq!(temp.as_bytes(), &encode_centi(23.45).unwrap());
        let battery = dispatch_access(&t, &r, 1, 20, AccessOp::ReadCharacteristic).unwrap();
        assert_eq!(battery.as_bytes(), b"78%");
    }

    #[test]
    fn non_read_operations_are_unlikely() {
        let t = table();
        let r = reading();
        for op in [
            AccessOp::WriteCharacteristic,
            AccessOp::ReadDescriptor,
            AccessOp::WriteDescriptor,
        ] {
            let err = dispatch_access(&t, &r, 1, 13, op).unwrap_err();
            assert_eq!(err, AccessError::Unlikely);
            assert_eq!(err.att_code(), 0x0E);
        }
    }

    #[test]
    fn unknown_attribute_is_empty_success() {
        let t = table();
        let r = reading();
        assert_eq!(
            dispatch_access(&t, &r, 1, 99, AccessOp::ReadCharacteristic),
            Ok(AccessResponse::NoContent)
        );
        assert_eq!(
            dispatch_access(&t, &r, 1, 99, AccessOp::WriteCharacteristic),
            Ok(AccessResponse::NoContent)
        );
    }

    #[test]
    fn out_of_range_read_sends_saturated_value() {
        let t = table();
        let r = SensorReading {
            humidity: 1.0e6,
            ..reading()
        };
        let resp = dispatch_access(&t, &r, 1, 13, AccessOp::ReadCharacteristic).unwrap();
        assert_eq!(resp.as_bytes(), &i16::MAX.to_le_bytes());
    }

    #[test]
    fn subscribe_routes_by_handle() {
        let t = table();
        let mut registry = SubscriptionRegistry::new(DisconnectPolicy::ClearMatching);
        let event = SubscribeEvent {
            conn: 4,
            attr: 13,
            prev_notify: false,
            cur_notify: false,
            prev_indicate: false,
            cur_indicate: true,
        };
        assert!(dispatch_subscribe(&t, &mut registry, &event));
        assert!(registry.is_subscribed(CharacteristicId::Humidity));
        assert_eq!(registry.target_connection(CharacteristicId::Humidity), Some(4));

        let unknown = SubscribeEvent { attr: 77, ..event };
        assert!(!dispatch_subscribe(&t, &mut registry, &unknown));
        assert!(!registry.is_subscribed(CharacteristicId::Temperature));
    }
}
