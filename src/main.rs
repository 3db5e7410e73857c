#[cfg(target_os = "espidf")]
mod firmware {
    use std::sync::Arc;

    use embassy_executor::Executor;
    use embassy_time::Duration;
    use esp_idf_svc::bt::{Ble, BtDriver};
    use esp_idf_svc::hal::adc::attenuation::DB_11;
    use esp_idf_svc::hal::adc::oneshot::config::AdcChannelConfig;
    use esp_idf_svc::hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
    use esp_idf_svc::hal::gpio::Gpio3;
    use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver};
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::hal::units::Hertz;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{error, info};

    use envsense::advertising::AdvertisingConfig;
    use envsense::config;
    use envsense::connection::AdvertisingBackoff;
    use envsense::device_info::{device_serial_number, get_bluetooth_address};
    use envsense::esp_ble::BleServer;
    use envsense::esp_sensors::BoardSensors;
    use envsense::subscription::DisconnectPolicy;
    use envsense::tasks::{
        run_advertising_retry, run_indication_pump, run_sampler, ADVERTISING_RETRY_SIGNAL,
        SAMPLE_READY_SIGNAL,
    };
    use envsense::{Peripheral, SensorCache};

    #[embassy_executor::task]
    async fn sampler_task(sensors: BoardSensors<'static, Gpio3>, cache: Arc<SensorCache>) {
        run_sampler(
            sensors,
            &cache,
            &SAMPLE_READY_SIGNAL,
            Duration::from_millis(config::SENSOR_SAMPLE_PERIOD_MS),
        )
        .await
    }

    #[embassy_executor::task]
    async fn indication_task() {
        run_indication_pump(
            Duration::from_millis(config::INDICATION_PERIOD_MS),
            &SAMPLE_READY_SIGNAL,
            BleServer::send_indications,
        )
        .await
    }

    #[embassy_executor::task]
    async fn advertising_retry_task() {
        run_advertising_retry(
            &ADVERTISING_RETRY_SIGNAL,
            AdvertisingBackoff::default(),
            BleServer::retry_advertising,
        )
        .await
    }

    pub fn run() -> anyhow::Result<()> {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        // Bind the log crate to the ESP Logging facilities
        esp_idf_svc::log::EspLogger::initialize_default();

        info!("🚀 Starting {} BLE environmental sensor", config::DEVICE_NAME);

        let peripherals = Peripherals::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        let address = get_bluetooth_address()?;
        info!("🆔 Device: {} ({})", device_serial_number(&address), address);

        let cache = Arc::new(SensorCache::new());
        let peripheral = Peripheral::new(
            cache.clone(),
            AdvertisingConfig::new(address),
            DisconnectPolicy::ClearMatching,
        );

        let bt_driver = BtDriver::<Ble>::new(peripherals.modem, Some(nvs))?;
        let mut ble_server = BleServer::new(bt_driver, peripheral)?;
        ble_server.start()?;
        // Owns the BT driver; must live as long as the executor
        let _ble_server: &'static mut BleServer = Box::leak(Box::new(ble_server));

        let i2c_config = I2cConfig::new().baudrate(Hertz(config::I2C_FREQ_HZ));
        let i2c = I2cDriver::new(
            peripherals.i2c0,
            peripherals.pins.gpio4,
            peripherals.pins.gpio5,
            &i2c_config,
        )?;
        let adc = AdcDriver::new(peripherals.adc1)?;
        let adc_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let battery = AdcChannelDriver::new(adc, peripherals.pins.gpio3, &adc_config)?;
        let sensors = BoardSensors::new(i2c, battery);
        info!("✅ Peripherals initialized");

        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(move |spawner| {
            if spawner.spawn(sampler_task(sensors, cache)).is_err() {
                error!("❌ Failed to spawn sensor sampler task");
            }
            if spawner.spawn(indication_task()).is_err() {
                error!("❌ Failed to spawn indication pump task");
            }
            if spawner.spawn(advertising_retry_task()).is_err() {
                error!("❌ Failed to spawn advertising retry task");
            }
            info!("✅ All tasks spawned");
        })
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("envsense is ESP-IDF firmware; use `cargo test` to exercise the protocol layer");
}
