// Board sensor backend: SHT40 on I2C, battery divider on an ADC1 oneshot channel

use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADCPin;
use esp_idf_hal::delay::TickType;
use esp_idf_hal::i2c::I2cDriver;
use log::info;

use crate::config::{I2C_TIMEOUT_MS, SHT40_ADDR, SHT40_MEASURE_HIGH_PRECISION};
use crate::sensor::{
    decode_sht40_frame, raw_to_celsius, raw_to_relative_humidity, AdcError, SensorBackend,
    SensorError,
};

pub struct BoardSensors<'d, P: ADCPin> {
    i2c: I2cDriver<'d>,
    battery: AdcChannelDriver<'d, P, AdcDriver<'d, P::Adc>>,
}

impl<'d, P: ADCPin> BoardSensors<'d, P> {
    pub fn new(
        i2c: I2cDriver<'d>,
        battery: AdcChannelDriver<'d, P, AdcDriver<'d, P::Adc>>,
    ) -> Self {
        info!("🌡️ Board sensors ready: SHT40 at 0x{:02X}", SHT40_ADDR);
        Self { i2c, battery }
    }

    fn timeout() -> u32 {
        TickType::new_millis(I2C_TIMEOUT_MS as u64).ticks()
    }
}

impl<P: ADCPin> SensorBackend for BoardSensors<'_, P> {
    fn start_measurement(&mut self) -> Result<(), SensorError> {
        self.i2c
            .write(SHT40_ADDR, &[SHT40_MEASURE_HIGH_PRECISION], Self::timeout())
            .map_err(|e| SensorError::Bus { code: e.code() })
    }

    fn read_measurement(&mut self) -> Result<(f32, f32), SensorError> {
        let mut frame = [0u8; 6];
        self.i2c
            .read(SHT40_ADDR, &mut frame, Self::timeout())
            .map_err(|e| SensorError::Bus { code: e.code() })?;

        let (raw_t, raw_rh) = decode_sht40_frame(&frame)?;
        Ok((raw_to_celsius(raw_t), raw_to_relative_humidity(raw_rh)))
    }

    fn read_battery_raw(&mut self) -> Result<u16, AdcError> {
        self.battery
            .read()
            .map_err(|e| AdcError::Read { code: e.code() })
    }
}
