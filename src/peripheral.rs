// The sensor peripheral: attribute table, subscriptions and the connection
// machine behind one owner, driven by link events and the indication timer.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::advertising::{AdvertisingConfig, AdvertisingError};
use crate::attribute::{AttributeTable, CharacteristicId};
use crate::connection::{ConnectionError, ConnectionManager, LinkState};
use crate::gatt_access::{dispatch_access, dispatch_subscribe, AccessOp, AccessResult};
use crate::indication::{IndicationPump, TickReport};
use crate::link::{AttrHandle, ConnHandle, Gap, GapEvent, IndicationSink, SubscribeEvent, TxStatus};
use crate::sensor_cache::SensorCache;
use crate::subscription::{DisconnectPolicy, SubscriptionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    Advertising(AdvertisingError),
    Connection(ConnectionError),
}

impl fmt::Display for PeripheralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralError::Advertising(e) => write!(f, "advertising: {}", e),
            PeripheralError::Connection(e) => write!(f, "connection: {}", e),
        }
    }
}

impl std::error::Error for PeripheralError {}

impl From<AdvertisingError> for PeripheralError {
    fn from(e: AdvertisingError) -> Self {
        PeripheralError::Advertising(e)
    }
}

impl From<ConnectionError> for PeripheralError {
    fn from(e: ConnectionError) -> Self {
        PeripheralError::Connection(e)
    }
}

impl PeripheralError {
    /// Advertising did not come back up and the event loop should retry.
    pub fn needs_advertising_retry(&self) -> bool {
        matches!(
            self,
            PeripheralError::Advertising(e) if *e != AdvertisingError::AlreadyConnected
        )
    }
}

pub type PeripheralResult<T> = Result<T, PeripheralError>;

pub struct Peripheral {
    cache: Arc<SensorCache>,
    table: AttributeTable,
    registry: SubscriptionRegistry,
    connection: ConnectionManager,
    pump: IndicationPump,
}

impl Peripheral {
    pub fn new(
        cache: Arc<SensorCache>,
        adv_config: AdvertisingConfig,
        policy: DisconnectPolicy,
    ) -> Self {
        Self {
            cache,
            table: AttributeTable::new(),
            registry: SubscriptionRegistry::new(policy),
            connection: ConnectionManager::new(adv_config),
            pump: IndicationPump::new(),
        }
    }

    /// Record the value handle the stack assigned to a characteristic.
    pub fn register_attribute(&mut self, characteristic: CharacteristicId, handle: AttrHandle) {
        self.table.register(characteristic, handle);
    }

    pub fn is_registered(&self) -> bool {
        self.table.is_complete()
    }

    pub fn start<G: Gap>(&mut self, gap: &mut G) -> PeripheralResult<()> {
        if !self.table.is_complete() {
            warn!("⚠️ Starting before all characteristics are registered");
        }
        self.connection.start_advertising(gap)?;
        Ok(())
    }

    /// Feed one link event through the matching handler.
    pub fn handle_event<G: Gap>(&mut self, event: GapEvent, gap: &mut G) -> PeripheralResult<()> {
        match event {
            GapEvent::Connected { handle } => self.on_connected(handle, gap),
            GapEvent::ConnectFailed { status } => self.on_connect_failed(status, gap),
            GapEvent::Disconnected { handle, reason } => self.on_disconnected(handle, reason, gap),
            GapEvent::ConnectionUpdated { handle, status } => {
                self.on_connection_updated(handle, status, gap)
            }
            GapEvent::AdvertisingComplete { reason } => self.on_advertising_complete(reason, gap),
            GapEvent::IndicationTx {
                handle,
                attr,
                status,
            } => {
                self.on_indication_tx(handle, attr, status);
                Ok(())
            }
            GapEvent::Subscribe(event) => {
                self.on_subscribe(&event);
                Ok(())
            }
            GapEvent::MtuChanged {
                handle,
                channel_id,
                mtu,
            } => {
                info!(
                    "📏 MTU updated: conn_handle={}, cid={}, mtu={}",
                    handle, channel_id, mtu
                );
                Ok(())
            }
        }
    }

    fn on_connected<G: Gap>(&mut self, handle: ConnHandle, gap: &mut G) -> PeripheralResult<()> {
        self.connection.on_connected(gap, handle)?;
        Ok(())
    }

    fn on_connect_failed<G: Gap>(&mut self, status: i32, gap: &mut G) -> PeripheralResult<()> {
        self.connection.on_connect_failed(gap, status)?;
        Ok(())
    }

    fn on_disconnected<G: Gap>(
        &mut self,
        handle: ConnHandle,
        reason: i32,
        gap: &mut G,
    ) -> PeripheralResult<()> {
        self.registry.on_disconnect(handle);
        self.connection.on_disconnected(gap, handle, reason)?;
        Ok(())
    }

    fn on_connection_updated<G: Gap>(
        &mut self,
        handle: ConnHandle,
        status: i32,
        gap: &mut G,
    ) -> PeripheralResult<()> {
        self.connection.on_connection_updated(gap, handle, status)?;
        Ok(())
    }

    fn on_advertising_complete<G: Gap>(
        &mut self,
        reason: i32,
        gap: &mut G,
    ) -> PeripheralResult<()> {
        self.connection.on_advertising_complete(gap, reason)?;
        Ok(())
    }

    fn on_indication_tx(&self, handle: ConnHandle, attr: AttrHandle, status: TxStatus) {
        match status {
            TxStatus::Sent | TxStatus::Done => {
                debug!("Indication tx {:?}: conn_handle={}, attr_handle={}", status, handle, attr)
            }
            TxStatus::Failed(code) => warn!(
                "⚠️ Indication tx failed: conn_handle={}, attr_handle={}, status={}",
                handle, attr, code
            ),
        }
    }

    fn on_subscribe(&mut self, event: &SubscribeEvent) {
        dispatch_subscribe(&self.table, &mut self.registry, event);
    }

    /// Answer an attribute access from the latest cached reading.
    pub fn on_access(&self, conn: ConnHandle, attr: AttrHandle, op: AccessOp) -> AccessResult {
        let reading = self.cache.snapshot();
        dispatch_access(&self.table, &reading, conn, attr, op)
    }

    pub fn send_indications<S: IndicationSink>(&mut self, sink: &mut S) -> TickReport {
        let reading = self.cache.snapshot();
        self.pump.tick(&self.registry, &self.table, &reading, sink)
    }

    pub fn link_state(&self) -> LinkState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn table(&self) -> &AttributeTable {
        &self.table
    }

    pub fn cache(&self) -> &Arc<SensorCache> {
        &self.cache
    }
}
