// Periodic producers: sensor sampling, the indication pump, and advertising
// restarts after a failed start. The loop bodies are closures so the platform
// layer decides what one step touches.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Ticker, Timer};
use log::{debug, info, warn};

use crate::config::SHT40_MEASURE_DELAY_MS;
use crate::connection::AdvertisingBackoff;
use crate::indication::TickReport;
use crate::sensor::{sample_into, SensorBackend};
use crate::sensor_cache::SensorCache;

// Raised by the sampler after a successful sample so subscribers get the new
// value without waiting for the next pump period
pub static SAMPLE_READY_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

// Raised by the link glue when advertising could not be (re)started
pub static ADVERTISING_RETRY_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

pub async fn run_sampler<B: SensorBackend>(
    mut backend: B,
    cache: &SensorCache,
    ready: &Signal<CriticalSectionRawMutex, ()>,
    period: Duration,
) {
    info!("🌡️ Sensor sampler started, period {} ms", period.as_millis());
    let conversion = Duration::from_millis(SHT40_MEASURE_DELAY_MS as u64);
    let mut ticker = Ticker::every(period);
    loop {
        let outcome = sample_into(&mut backend, cache, conversion).await;
        if outcome.updated() {
            match serde_json::to_string(&cache.snapshot()) {
                Ok(json) => debug!("📊 {}", json),
                Err(e) => warn!("⚠️ Could not render reading: {}", e),
            }
            ready.signal(());
        }
        ticker.next().await;
    }
}

/// Run `tick` every `period`, or earlier when `wake` is raised.
pub async fn run_indication_pump<F>(
    period: Duration,
    wake: &Signal<CriticalSectionRawMutex, ()>,
    mut tick: F,
) where
    F: FnMut() -> TickReport,
{
    info!("📤 Indication pump started, period {} ms", period.as_millis());
    let mut ticker = Ticker::every(period);
    loop {
        match select(ticker.next(), wake.wait()).await {
            Either::First(()) => {}
            Either::Second(()) => ticker.reset(),
        }
        let report = tick();
        if report.sent > 0 || !report.failures.is_empty() {
            debug!(
                "Indication tick: sent={}, skipped={}, failed={}",
                report.sent,
                report.skipped,
                report.failures.len()
            );
        }
    }
}

/// Wait for a retry request, then call `attempt` with growing delays until it
/// reports success.
pub async fn run_advertising_retry<F>(
    request: &Signal<CriticalSectionRawMutex, ()>,
    mut backoff: AdvertisingBackoff,
    mut attempt: F,
) where
    F: FnMut() -> bool,
{
    loop {
        request.wait().await;
        loop {
            let delay = backoff.next_delay_ms();
            warn!(
                "🔄 Retrying advertising in {} ms (attempt {})",
                delay,
                backoff.attempt()
            );
            Timer::after(Duration::from_millis(delay)).await;
            if attempt() {
                info!("✅ Advertising restarted");
                break;
            }
        }
        backoff.reset();
    }
}
