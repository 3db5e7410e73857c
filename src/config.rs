// Compile-time configuration for the sensor peripheral
// Pins, radio timing and sampling cadence all live here so a board respin only touches one file

// BLE identity
pub const DEVICE_NAME: &str = "EnvSense"; // Complete local name in the advertising data
pub const APPEARANCE_GENERIC_TAG: u16 = 0x0200; // Assigned number: Generic Tag
pub const LE_ROLE_PERIPHERAL_ONLY: u8 = 0x00; // LE Role AD value: only peripheral role supported
pub const ADV_TX_POWER_DBM: i8 = 9; // TX power hint advertised to scanners

// URI carried in the scan response. The scheme is encoded as a single
// assigned-number byte, the rest is the literal remainder of the URI.
pub const URI_SCHEME_HTTPS: u8 = 0x17;
pub const DEVICE_URI: &str = "//espressif.com";

// Advertising interval (milliseconds, converted to 0.625 ms units on use)
pub const ADV_INTERVAL_MIN_MS: u32 = 500;
pub const ADV_INTERVAL_MAX_MS: u32 = 510;

// Connection parameter update requested right after a central connects
pub const CONN_SLAVE_LATENCY: u16 = 3; // Connection events the peripheral may skip

// Advertising restart backoff when the stack refuses to start advertising
pub const ADV_RETRY_BASE_MS: u64 = 250;
pub const ADV_RETRY_MAX_MS: u64 = 8_000;

// Task cadence
pub const SENSOR_SAMPLE_PERIOD_MS: u64 = 1_000; // SHT40 + battery polling
pub const INDICATION_PERIOD_MS: u64 = 5_000; // Indication pump when no fresh sample arrives

// SHT40 on I2C0 (SDA = GPIO4, SCL = GPIO5)
pub const I2C_FREQ_HZ: u32 = 100_000;
pub const I2C_TIMEOUT_MS: u32 = 100;
pub const SHT40_ADDR: u8 = 0x44;
pub const SHT40_MEASURE_HIGH_PRECISION: u8 = 0xFD;
pub const SHT40_MEASURE_DELAY_MS: u32 = 10;

// Battery sense on ADC1 (GPIO3) behind a 1:1 resistor divider
pub const BATTERY_DIVIDER_RATIO: f32 = 2.0;

/// LiPo discharge curve as (millivolts, percent), highest voltage first.
/// Values between two points are linearly interpolated.
pub const BATTERY_CURVE: [(u16, u8); 11] = [
    (4200, 100),
    (4100, 90),
    (4000, 80),
    (3900, 70),
    (3800, 60),
    (3700, 50),
    (3600, 40),
    (3500, 30),
    (3400, 20),
    (3300, 10),
    (3000, 0),
];

/// Convert milliseconds to BLE advertising interval units (0.625 ms).
pub const fn adv_interval_units(ms: u32) -> u16 {
    (ms * 8 / 5) as u16
}
