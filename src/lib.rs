//! BLE environmental sensor peripheral.
//!
//! The protocol layer (attribute encoding, subscriptions, the connection
//! state machine, indication pump) is target independent and tested on the
//! host. The `esp_*` modules bind it to Bluedroid and the board sensors and
//! only build for ESP-IDF.

pub mod advertising;
pub mod attribute;
pub mod config;
pub mod connection;
pub mod device_info;
pub mod gatt_access;
pub mod indication;
pub mod link;
pub mod peripheral;
pub mod sensor;
pub mod sensor_cache;
pub mod subscription;
pub mod tasks;

#[cfg(target_os = "espidf")]
pub mod esp_ble;
#[cfg(target_os = "espidf")]
pub mod esp_sensors;

pub use peripheral::{Peripheral, PeripheralError};
pub use sensor_cache::{SensorCache, SensorReading};
