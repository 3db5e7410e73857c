// Single-slot connection / advertising state machine
//
// Idle -> Advertising -> Connected -> Advertising, with Advertising ->
// Advertising on restart. Advertising is restarted whenever the slot frees up
// or the controller stops broadcasting on its own.

use std::fmt;

use log::{error, info, warn};

use crate::advertising::{
    build_advertising_data, build_scan_response, AdvertisingConfig, AdvertisingError,
};
use crate::config;
use crate::link::{ConnHandle, ConnectionDescriptor, ConnectionParams, Gap, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSlot {
    pub handle: ConnHandle,
    // None until the stack has answered the descriptor lookup
    pub descriptor: Option<ConnectionDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Advertising,
    Connected(ConnectionSlot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingState {
    Idle,
    Advertising,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    DescriptorLookup { handle: ConnHandle, source: LinkError },
    ParamUpdate { handle: ConnHandle, source: LinkError },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::DescriptorLookup { handle, source } => write!(
                f,
                "connection descriptor lookup for handle {} failed: {}",
                handle, source
            ),
            ConnectionError::ParamUpdate { handle, source } => write!(
                f,
                "connection parameter update for handle {} failed: {}",
                handle, source
            ),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::DescriptorLookup { source, .. }
            | ConnectionError::ParamUpdate { source, .. } => Some(source),
        }
    }
}

pub struct ConnectionManager {
    adv_config: AdvertisingConfig,
    state: LinkState,
}

impl ConnectionManager {
    pub fn new(adv_config: AdvertisingConfig) -> Self {
        Self {
            adv_config,
            state: LinkState::Idle,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn advertising_state(&self) -> AdvertisingState {
        match self.state {
            LinkState::Advertising => AdvertisingState::Advertising,
            _ => AdvertisingState::Idle,
        }
    }

    pub fn active_connection(&self) -> Option<ConnectionSlot> {
        match self.state {
            LinkState::Connected(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn adv_config(&self) -> &AdvertisingConfig {
        &self.adv_config
    }

    /// Push both payloads and start undirected connectable advertising.
    /// On failure the state is left as it was.
    pub fn start_advertising<G: Gap>(&mut self, gap: &mut G) -> Result<(), AdvertisingError> {
        if let LinkState::Connected(slot) = self.state {
            warn!(
                "⚠️ Not advertising, conn_handle={} still holds the slot",
                slot.handle
            );
            return Err(AdvertisingError::AlreadyConnected);
        }

        let result = self.configure_and_start(gap);
        match &result {
            Ok(()) => {
                info!(
                    "📡 Advertising as '{}' ({}), interval {}-{}",
                    self.adv_config.device_name,
                    self.adv_config.address,
                    self.adv_config.interval_min,
                    self.adv_config.interval_max
                );
                self.state = LinkState::Advertising;
            }
            Err(e) => error!("❌ Failed to start advertising: {}", e),
        }
        result
    }

    fn configure_and_start<G: Gap>(&self, gap: &mut G) -> Result<(), AdvertisingError> {
        let adv_data = build_advertising_data(&self.adv_config)?;
        let scan_rsp = build_scan_response(&self.adv_config)?;

        gap.set_advertising_data(adv_data.as_bytes())
            .map_err(AdvertisingError::SetAdvertisingData)?;
        gap.set_scan_response_data(scan_rsp.as_bytes())
            .map_err(AdvertisingError::SetScanResponse)?;
        gap.start_advertising(&self.adv_config.params())
            .map_err(AdvertisingError::Start)
    }

    /// Take the slot, then ask the central for a longer slave latency.
    pub fn on_connected<G: Gap>(
        &mut self,
        gap: &mut G,
        handle: ConnHandle,
    ) -> Result<(), ConnectionError> {
        if let LinkState::Connected(previous) = self.state {
            warn!(
                "⚠️ Connect on conn_handle={} while conn_handle={} still held, replacing",
                handle, previous.handle
            );
        }
        self.state = LinkState::Connected(ConnectionSlot {
            handle,
            descriptor: None,
        });
        info!("🔗 Central connected, conn_handle={}", handle);

        let descriptor = gap
            .connection_descriptor(handle)
            .map_err(|source| ConnectionError::DescriptorLookup { handle, source })
            .inspect_err(|e| error!("❌ {}", e))?;
        log_descriptor(&descriptor);
        self.state = LinkState::Connected(ConnectionSlot {
            handle,
            descriptor: Some(descriptor),
        });

        let params = ConnectionParams {
            interval_min: descriptor.interval,
            interval_max: descriptor.interval,
            latency: config::CONN_SLAVE_LATENCY,
            supervision_timeout: descriptor.supervision_timeout,
        };
        gap.update_connection_params(handle, &params)
            .map_err(|source| ConnectionError::ParamUpdate { handle, source })
            .inspect_err(|e| error!("❌ {}", e))
    }

    pub fn on_connect_failed<G: Gap>(
        &mut self,
        gap: &mut G,
        status: i32,
    ) -> Result<(), AdvertisingError> {
        warn!("⚠️ Connection attempt failed, status={}", status);
        if self.active_connection().is_none() {
            self.state = LinkState::Idle;
        }
        self.start_advertising(gap)
    }

    /// Free the slot and go straight back to advertising. A disconnect for a
    /// handle the slot no longer holds leaves the live connection alone.
    pub fn on_disconnected<G: Gap>(
        &mut self,
        gap: &mut G,
        handle: ConnHandle,
        reason: i32,
    ) -> Result<(), AdvertisingError> {
        match self.state {
            LinkState::Connected(slot) if slot.handle == handle => {
                info!(
                    "🔌 Central disconnected, conn_handle={}, reason=0x{:02X}",
                    handle, reason
                );
            }
            LinkState::Connected(slot) => {
                warn!(
                    "⚠️ Late disconnect for conn_handle={}, keeping conn_handle={}",
                    handle, slot.handle
                );
                return Ok(());
            }
            _ => {
                warn!(
                    "⚠️ Disconnect for conn_handle={} with no active connection",
                    handle
                );
            }
        }
        self.state = LinkState::Idle;
        self.start_advertising(gap)
    }

    pub fn on_advertising_complete<G: Gap>(
        &mut self,
        gap: &mut G,
        reason: i32,
    ) -> Result<(), AdvertisingError> {
        if let LinkState::Connected(slot) = self.state {
            info!(
                "Advertising complete (reason={}) while conn_handle={} connected, ignoring",
                reason, slot.handle
            );
            return Ok(());
        }
        info!("Advertising complete, reason={}, restarting", reason);
        self.state = LinkState::Idle;
        self.start_advertising(gap)
    }

    /// Refresh the stored descriptor after a parameter negotiation.
    pub fn on_connection_updated<G: Gap>(
        &mut self,
        gap: &mut G,
        handle: ConnHandle,
        status: i32,
    ) -> Result<(), ConnectionError> {
        let slot = match self.state {
            LinkState::Connected(slot) if slot.handle == handle => slot,
            _ => {
                warn!(
                    "⚠️ Parameter update for unknown conn_handle={}, ignoring",
                    handle
                );
                return Ok(());
            }
        };
        if status != 0 {
            warn!(
                "⚠️ Parameter update rejected, conn_handle={}, status={}",
                handle, status
            );
        }

        let descriptor = gap
            .connection_descriptor(handle)
            .map_err(|source| ConnectionError::DescriptorLookup { handle, source })
            .inspect_err(|e| error!("❌ {}", e))?;
        log_descriptor(&descriptor);
        self.state = LinkState::Connected(ConnectionSlot {
            descriptor: Some(descriptor),
            ..slot
        });
        Ok(())
    }
}

fn log_descriptor(d: &ConnectionDescriptor) {
    let a = &d.peer_address;
    info!(
        "   conn_handle={} peer={:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} interval={} latency={} timeout={}",
        d.handle, a[0], a[1], a[2], a[3], a[4], a[5], d.interval, d.latency, d.supervision_timeout
    );
}

/// Exponential delay between failed advertising restarts.
#[derive(Debug, Clone)]
pub struct AdvertisingBackoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl AdvertisingBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX))
            .min(self.max_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for AdvertisingBackoff {
    fn default() -> Self {
        Self::new(config::ADV_RETRY_BASE_MS, config::ADV_RETRY_MAX_MS)
    }
}
