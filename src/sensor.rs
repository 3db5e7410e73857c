// SHT40 frame decoding, battery conversion and the sampling step that feeds
// the sensor cache. Bus access lives behind SensorBackend.

use std::fmt;

use embassy_time::{Duration, Timer};
use log::{debug, warn};

use crate::config::{BATTERY_CURVE, BATTERY_DIVIDER_RATIO};
use crate::sensor_cache::SensorCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    // I2C transaction failed with the given driver error code
    Bus { code: i32 },
    // Word 0 = temperature, 1 = humidity
    Crc { word: usize, expected: u8, actual: u8 },
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Bus { code } => write!(f, "I2C bus error {}", code),
            SensorError::Crc {
                word,
                expected,
                actual,
            } => write!(
                f,
                "CRC mismatch on word {}: expected 0x{:02X}, got 0x{:02X}",
                word, expected, actual
            ),
        }
    }
}

impl std::error::Error for SensorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcError {
    Read { code: i32 },
}

impl fmt::Display for AdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdcError::Read { code } => write!(f, "ADC read error {}", code),
        }
    }
}

impl std::error::Error for AdcError {}

/// Acquisition hardware as seen by the sampler. A temperature/humidity read
/// is two bus transactions with the conversion time awaited in between.
pub trait SensorBackend {
    /// Issue the measure command.
    fn start_measurement(&mut self) -> Result<(), SensorError>;
    /// Fetch and convert the finished measurement as (°C, %RH).
    fn read_measurement(&mut self) -> Result<(f32, f32), SensorError>;
    /// Battery sense pin in millivolts, before the divider correction.
    fn read_battery_raw(&mut self) -> Result<u16, AdcError>;
}

/// Sensirion CRC-8: polynomial 0x31, init 0xFF, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Split a 6-byte measurement frame into its raw temperature and humidity words.
pub fn decode_sht40_frame(frame: &[u8; 6]) -> Result<(u16, u16), SensorError> {
    let mut words = [0u16; 2];
    for (word, chunk) in frame.chunks_exact(3).enumerate() {
        let expected = crc8(&chunk[..2]);
        if expected != chunk[2] {
            return Err(SensorError::Crc {
                word,
                expected,
                actual: chunk[2],
            });
        }
        words[word] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok((words[0], words[1]))
}

pub fn raw_to_celsius(raw: u16) -> f32 {
    -45.0 + 175.0 * raw as f32 / 65535.0
}

/// Linear full-scale mapping; the raw word already spans 0..=100 %RH.
pub fn raw_to_relative_humidity(raw: u16) -> f32 {
    100.0 * raw as f32 / 65535.0
}

pub fn battery_voltage_from_adc_mv(adc_mv: u16) -> f32 {
    adc_mv as f32 * BATTERY_DIVIDER_RATIO / 1000.0
}

/// Piecewise-linear lookup on the discharge curve, clamped to 0..=100.
pub fn battery_percentage(voltage: f32) -> f32 {
    let mv = voltage * 1000.0;
    let (top_mv, top_pct) = BATTERY_CURVE[0];
    let (bottom_mv, bottom_pct) = BATTERY_CURVE[BATTERY_CURVE.len() - 1];
    if mv.is_nan() || mv <= bottom_mv as f32 {
        return bottom_pct as f32;
    }
    if mv >= top_mv as f32 {
        return top_pct as f32;
    }

    for pair in BATTERY_CURVE.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if mv >= lo_mv as f32 && mv <= hi_mv as f32 {
            let span = (hi_mv - lo_mv) as f32;
            let fraction = (mv - lo_mv as f32) / span;
            return lo_pct as f32 + fraction * (hi_pct - lo_pct) as f32;
        }
    }
    bottom_pct as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleOutcome {
    pub environment: Option<SensorError>,
    pub battery: Option<AdcError>,
}

impl SampleOutcome {
    /// At least one path wrote fresh values into the cache.
    pub fn updated(&self) -> bool {
        self.environment.is_none() || self.battery.is_none()
    }
}

/// Measure, yield to the executor for the conversion time, then fetch.
pub async fn read_temperature_humidity<B: SensorBackend>(
    backend: &mut B,
    conversion: Duration,
) -> Result<(f32, f32), SensorError> {
    backend.start_measurement()?;
    Timer::after(conversion).await;
    backend.read_measurement()
}

/// Read both sources and update the cache. A failing path leaves its
/// fields as they were.
pub async fn sample_into<B: SensorBackend>(
    backend: &mut B,
    cache: &SensorCache,
    conversion: Duration,
) -> SampleOutcome {
    let mut outcome = SampleOutcome::default();

    match read_temperature_humidity(backend, conversion).await {
        Ok((temperature, humidity)) => {
            debug!("🌡️ {:.2} °C, {:.2} %RH", temperature, humidity);
            cache.update_environment(temperature, humidity);
        }
        Err(e) => {
            warn!("⚠️ SHT40 read failed, keeping last value: {}", e);
            outcome.environment = Some(e);
        }
    }

    match backend.read_battery_raw() {
        Ok(adc_mv) => {
            let voltage = battery_voltage_from_adc_mv(adc_mv);
            let percentage = battery_percentage(voltage);
            debug!("🔋 {:.3} V, {:.1} %", voltage, percentage);
            cache.update_battery(voltage, percentage);
        }
        Err(e) => {
            warn!("⚠️ Battery read failed, keeping last value: {}", e);
            outcome.battery = Some(e);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor_cache::SensorReading;

    fn sample(backend: &mut ScriptedBackend, cache: &SensorCache) -> SampleOutcome {
        embassy_futures::block_on(sample_into(backend, cache, Duration::from_millis(1)))
    }

    struct ScriptedBackend {
        start: Result<(), SensorError>,
        env: Result<(f32, f32), SensorError>,
        battery: Result<u16, AdcError>,
        calls: Vec<&'static str>,
    }

    impl ScriptedBackend {
        fn new(env: Result<(f32, f32), SensorError>, battery: Result<u16, AdcError>) -> Self {
            Self {
                start: Ok(()),
                env,
                battery,
                calls: Vec::new(),
            }
        }
    }

    impl SensorBackend for ScriptedBackend {
        fn start_measurement(&mut self) -> Result<(), SensorError> {
            self.calls.push("start");
            self.start
        }

        fn read_measurement(&mut self) -> Result<(f32, f32), SensorError> {
            self.calls.push("read");
            self.env
        }

        fn read_battery_raw(&mut self) -> Result<u16, AdcError> {
            self.battery
        }
    }

    #[test]
    fn crc_matches_datasheet_example() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn frame_decodes_both_words() {
        let frame = [0x66, 0x66, crc8(&[0x66, 0x66]), 0x80, 0x00, crc8(&[0x80, 0x00])];
        let (t, rh) = decode_sht40_frame(&frame).unwrap();
        assert_eq!(t, 0x6666);
        assert_eq!(rh, 0x8000);
        assert!((raw_to_celsius(t) - 25.0).abs() < 0.01);
    }

    #[test]
    fn frame_rejects_bad_crc() {
        let good = crc8(&[0x80, 0x00]);
        let frame = [0x66, 0x66, 0x00, 0x80, 0x00, good];
        assert_eq!(
            decode_sht40_frame(&frame),
            Err(SensorError::Crc {
                word: 0,
                expected: crc8(&[0x66, 0x66]),
                actual: 0x00,
            })
        );
    }

    #[test]
    fn conversion_endpoints() {
        assert_eq!(raw_to_celsius(0), -45.0);
        assert_eq!(raw_to_celsius(u16::MAX), 130.0);
        assert_eq!(raw_to_relative_humidity(0), 0.0);
        assert_eq!(raw_to_relative_humidity(u16::MAX), 100.0);
    }

    #[test]
    fn humidity_scales_linearly_over_full_word() {
        assert!((raw_to_relative_humidity(0x8000) - 50.0).abs() < 0.01);
        assert!((raw_to_relative_humidity(0x0800) - 3.125).abs() < 0.01);
    }

    #[test]
    fn battery_curve_is_monotonic_and_clamped() {
        assert_eq!(battery_percentage(4.5), 100.0);
        assert_eq!(battery_percentage(2.5), 0.0);
        assert_eq!(battery_percentage(f32::NAN), 0.0);
        assert!((battery_percentage(3.75) - 55.0).abs() < 0.01);

        let mut last = -1.0;
        let mut mv = 2900u16;
        while mv <= 4300 {
            let pct = battery_percentage(mv as f32 / 1000.0);
            assert!((0.0..=100.0).contains(&pct));
            assert!(pct >= last, "{} mV gave {} after {}", mv, pct, last);
            last = pct;
            mv += 5;
        }
    }

    #[test]
    fn divider_ratio_applied() {
        assert!((battery_voltage_from_adc_mv(1950) - 3.9).abs() < 1e-6);
    }

    #[test]
    fn failed_path_keeps_stale_fields() {
        let cache = SensorCache::new();
        cache.update(SensorReading {
            temperature: 20.0,
            humidity: 40.0,
            battery_voltage: 3.0,
            battery_percentage: 0.0,
        });
        let mut backend = ScriptedBackend::new(Err(SensorError::Bus { code: -1 }), Ok(2200));
        let outcome = sample(&mut backend, &cache);
        assert!(outcome.updated());
        assert_eq!(outcome.environment, Some(SensorError::Bus { code: -1 }));

        let reading = cache.snapshot();
        assert_eq!(reading.temperature, 20.0);
        assert_eq!(reading.humidity, 40.0);
        assert!((reading.battery_voltage - 4.4).abs() < 1e-6);
        assert_eq!(reading.battery_percentage, 100.0);
    }

    #[test]
    fn total_failure_reports_no_update() {
        let cache = SensorCache::new();
        let mut backend = ScriptedBackend::new(
            Err(SensorError::Bus { code: 263 }),
            Err(AdcError::Read { code: 259 }),
        );
        let outcome = sample(&mut backend, &cache);
        assert!(!outcome.updated());
        assert_eq!(cache.snapshot(), SensorReading::ZERO);
    }

    #[test]
    fn measurement_is_fetched_after_command() {
        let cache = SensorCache::new();
        let mut backend = ScriptedBackend::new(Ok((21.5, 48.0)), Ok(1850));
        let outcome = sample(&mut backend, &cache);

        assert_eq!(outcome, SampleOutcome::default());
        assert_eq!(backend.calls, vec!["start", "read"]);
        assert_eq!(cache.snapshot().temperature, 21.5);
        assert_eq!(cache.snapshot().humidity, 48.0);
    }

    #[test]
    fn failed_command_skips_fetch() {
        let cache = SensorCache::new();
        let mut backend = ScriptedBackend::new(Ok((21.5, 48.0)), Ok(1850));
        backend.start = Err(SensorError::Bus { code: 263 });
        let outcome = sample(&mut backend, &cache);

        assert_eq!(outcome.environment, Some(SensorError::Bus { code: 263 }));
        assert_eq!(backend.calls, vec!["start"]);
        assert_eq!(cache.snapshot().temperature, 0.0);
    }
}
