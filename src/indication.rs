// Periodic push of fresh values to subscribed centrals

use log::{debug, error, warn};

use crate::attribute::{encode, AttributeTable, CharacteristicId, EncodeError};
use crate::link::{ConnHandle, IndicationSink, LinkError};
use crate::sensor_cache::SensorReading;
use crate::subscription::SubscriptionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicationFailure {
    pub characteristic: CharacteristicId,
    pub connection: ConnHandle,
    pub error: LinkError,
}

/// What one pass over the registry did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sent: usize,
    pub skipped: usize,
    pub failures: Vec<IndicationFailure>,
}

impl TickReport {
    pub fn attempted(&self) -> usize {
        self.sent + self.failures.len()
    }
}

#[derive(Debug, Default)]
pub struct IndicationPump {
    ticks: u64,
}

impl IndicationPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// One indication per subscribed characteristic with a known target.
    /// Send failures are logged and reported, the registry is never touched.
    pub fn tick<S: IndicationSink>(
        &mut self,
        registry: &SubscriptionRegistry,
        table: &AttributeTable,
        reading: &SensorReading,
        sink: &mut S,
    ) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        for characteristic in CharacteristicId::ALL {
            if !registry.is_subscribed(characteristic) {
                report.skipped += 1;
                continue;
            }
            let (Some(conn), Some(attr)) = (
                registry.target_connection(characteristic),
                table.handle(characteristic),
            ) else {
                report.skipped += 1;
                continue;
            };

            let value = match encode(characteristic, reading) {
                Ok(value) => value,
                Err(EncodeError::OutOfRange {
                    value, saturated, ..
                }) => {
                    warn!(
                        "⚠️ {} value {} out of range, indicating saturated {:?}",
                        characteristic, value, saturated
                    );
                    saturated
                }
                Err(e) => {
                    error!("❌ Failed to encode {}: {}", characteristic, e);
                    report.skipped += 1;
                    continue;
                }
            };

            match sink.indicate(conn, attr, value.as_bytes()) {
                Ok(()) => {
                    debug!(
                        "📤 Indicated {} to conn_handle={}: {:?}",
                        characteristic, conn, value
                    );
                    report.sent += 1;
                }
                Err(LinkError::IndicationPending) => {
                    // Previous indication not yet confirmed; next tick carries a fresher value
                    debug!(
                        "Indication for {} still pending on conn_handle={}",
                        characteristic, conn
                    );
                    report.failures.push(IndicationFailure {
                        characteristic,
                        connection: conn,
                        error: LinkError::IndicationPending,
                    });
                }
                Err(e) => {
                    error!(
                        "❌ Indication of {} to conn_handle={} failed: {}",
                        characteristic, conn, e
                    );
                    report.failures.push(IndicationFailure {
                        characteristic,
                        connection: conn,
                        error: e,
                    });
                }
            }
        }

        report
    }
}
