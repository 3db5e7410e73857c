// Latest known-good sensor values shared between the sampler and the BLE layer

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use serde::Serialize;

/// One complete set of physical readings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SensorReading {
    pub temperature: f32,        // °C
    pub humidity: f32,           // %RH
    pub battery_voltage: f32,    // V
    pub battery_percentage: f32, // %
}

impl SensorReading {
    /// Power-on value seen by readers before the first successful sample.
    pub const ZERO: Self = Self {
        temperature: 0.0,
        humidity: 0.0,
        battery_voltage: 0.0,
        battery_percentage: 0.0,
    };
}

/// Single-writer / multi-reader cache. The critical section is held only for
/// the copy in or out, never across I/O.
pub struct SensorCache {
    reading: Mutex<CriticalSectionRawMutex, Cell<SensorReading>>,
}

impl SensorCache {
    pub const fn new() -> Self {
        Self {
            reading: Mutex::new(Cell::new(SensorReading::ZERO)),
        }
    }

    /// Overwrite every field at once.
    pub fn update(&self, reading: SensorReading) {
        self.reading.lock(|cell| cell.set(reading));
    }

    /// Overwrite the SHT40 fields, leaving the battery fields as they were.
    pub fn update_environment(&self, temperature: f32, humidity: f32) {
        self.reading.lock(|cell| {
            let mut reading = cell.get();
            reading.temperature = temperature;
            reading.humidity = humidity;
            cell.set(reading);
        });
    }

    /// Overwrite the battery fields, leaving temperature and humidity alone.
    pub fn update_battery(&self, voltage: f32, percentage: f32) {
        self.reading.lock(|cell| {
            let mut reading = cell.get();
            reading.battery_voltage = voltage;
            reading.battery_percentage = percentage;
            cell.set(reading);
        });
    }

    pub fn snapshot(&self) -> SensorReading {
        self.reading.lock(|cell| cell.get())
    }
}

impl Default for SensorCache {
    fn default() -> Self {
        Self::new()
    }
}
