// Bluedroid GATT server glue: registers the sensor services, translates
// GATTS/GAP callbacks into link events for the Peripheral, and implements
// the Gap / IndicationSink commands on top of the raw ESP-IDF API.

use log::{debug, error, info, warn};

use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::sys as esp_idf_sys;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::advertising::AdvertisingError;
use crate::attribute::{AttributeValue, CharacteristicId, ServiceId, CLIENT_CONFIG_DESCR_UUID};
use crate::gatt_access::{AccessOp, AccessResponse};
use crate::indication::TickReport;
use crate::link::{
    AdvertisingParams, AttrHandle, ConnHandle, ConnectionDescriptor, ConnectionParams, Gap,
    GapEvent, IndicationSink, LinkError, LinkResult, SubscribeEvent, TxStatus,
};
use crate::peripheral::{Peripheral, PeripheralError};
use crate::tasks::ADVERTISING_RETRY_SIGNAL;

// Client configuration descriptor bits
const CCCD_NOTIFY: u16 = 0x0001;
const CCCD_INDICATE: u16 = 0x0002;

// Fixed L2CAP channel carrying ATT on LE links
const ATT_CHANNEL_ID: u16 = 0x0004;

#[derive(Debug, Clone, PartialEq)]
pub enum BleError {
    EspError(esp_idf_sys::esp_err_t, String),
    NotInitialized(String),
    AlreadyInitialized(String),
    Peripheral(PeripheralError),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleError::EspError(code, msg) => write!(f, "ESP-IDF error {}: {}", code, msg),
            BleError::NotInitialized(msg) => write!(f, "BLE not initialized: {}", msg),
            BleError::AlreadyInitialized(msg) => write!(f, "BLE already initialized: {}", msg),
            BleError::Peripheral(e) => write!(f, "BLE peripheral error: {}", e),
        }
    }
}

impl std::error::Error for BleError {}

impl From<PeripheralError> for BleError {
    fn from(e: PeripheralError) -> Self {
        BleError::Peripheral(e)
    }
}

pub type BleResult<T> = Result<T, BleError>;

static BLE_INITIALIZED: AtomicBool = AtomicBool::new(false);
static GATT_INTERFACE: AtomicU8 = AtomicU8::new(0);

// Everything the callbacks need, behind one lock
struct BleState {
    peripheral: Peripheral,
    // service handle -> characteristics still to be added, in order
    pending_chars: HashMap<u16, VecDeque<CharacteristicId>>,
    // service handle -> characteristic whose descriptor is being added
    current_char: HashMap<u16, CharacteristicId>,
    // CCCD handle -> owning characteristic
    cccd_handles: HashMap<AttrHandle, CharacteristicId>,
    connections: HashMap<ConnHandle, ConnectionDescriptor>,
}

static GLOBAL_BLE_STATE: OnceLock<Arc<Mutex<BleState>>> = OnceLock::new();

/// Run `f` against the shared BLE state. None if the server was never
/// created or the lock is poisoned.
fn with_ble_state<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut BleState) -> R,
{
    let state_arc = GLOBAL_BLE_STATE.get()?;
    let mut state = state_arc.lock().ok()?;
    Some(f(&mut state))
}

pub struct BleServer {
    // Keeps the controller and Bluedroid enabled for the lifetime of the server
    _bt_driver: BtDriver<'static, Ble>,
}

impl BleServer {
    pub fn new(bt_driver: BtDriver<'static, Ble>, peripheral: Peripheral) -> BleResult<Self> {
        let state = BleState {
            peripheral,
            pending_chars: HashMap::new(),
            current_char: HashMap::new(),
            cccd_handles: HashMap::new(),
            connections: HashMap::new(),
        };
        if GLOBAL_BLE_STATE.set(Arc::new(Mutex::new(state))).is_err() {
            return Err(BleError::AlreadyInitialized(
                "BLE server state already exists".to_string(),
            ));
        }

        Ok(Self {
            _bt_driver: bt_driver,
        })
    }

    /// Register callbacks and the GATT application. Services, characteristics
    /// and advertising follow from the registration events.
    pub fn start(&mut self) -> BleResult<()> {
        if BLE_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(BleError::AlreadyInitialized(
                "BLE server already started".to_string(),
            ));
        }

        info!("🔧 Registering BLE GATT and GAP callbacks");
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
            "GATT server callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
            "GAP callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_app_register(0) },
            "GATT application registration",
        )?;
        info!("✅ BLE callbacks registered, waiting for GATT registration");
        Ok(())
    }

    /// One indication pump pass over the current subscriptions.
    pub fn send_indications() -> TickReport {
        let mut sink = EspIndicationSink {
            gatts_if: GATT_INTERFACE.load(Ordering::SeqCst),
        };
        with_ble_state(|state| state.peripheral.send_indications(&mut sink)).unwrap_or_default()
    }

    /// Try to bring advertising back up. True when no further retry is needed.
    pub fn retry_advertising() -> bool {
        with_ble_state(|state| {
            let mut gap = EspGap {
                connections: &state.connections,
            };
            match state.peripheral.start(&mut gap) {
                Ok(()) => true,
                // A central got in meanwhile; the next disconnect restarts advertising
                Err(PeripheralError::Advertising(AdvertisingError::AlreadyConnected)) => true,
                Err(e) => {
                    warn!("⚠️ Advertising retry failed: {}", e);
                    false
                }
            }
        })
        .unwrap_or(false)
    }
}

// Feed one event through the peripheral, scheduling a retry if advertising
// could not be restarted
fn dispatch(state: &mut BleState, event: GapEvent) {
    let mut gap = EspGap {
        connections: &state.connections,
    };
    if let Err(e) = state.peripheral.handle_event(event, &mut gap) {
        error!("❌ {}", e);
        if e.needs_advertising_retry() {
            ADVERTISING_RETRY_SIGNAL.signal(());
        }
    }
}

struct EspGap<'a> {
    connections: &'a HashMap<ConnHandle, ConnectionDescriptor>,
}

impl Gap for EspGap<'_> {
    fn set_advertising_data(&mut self, data: &[u8]) -> LinkResult<()> {
        call_link_api(|| unsafe {
            esp_idf_sys::esp_ble_gap_config_adv_data_raw(
                data.as_ptr() as *mut u8,
                data.len() as u32,
            )
        })
    }

    fn set_scan_response_data(&mut self, data: &[u8]) -> LinkResult<()> {
        call_link_api(|| unsafe {
            esp_idf_sys::esp_ble_gap_config_scan_rsp_data_raw(
                data.as_ptr() as *mut u8,
                data.len() as u32,
            )
        })
    }

    fn start_advertising(&mut self, params: &AdvertisingParams) -> LinkResult<()> {
        let mut adv_params = esp_idf_sys::esp_ble_adv_params_t {
            adv_int_min: params.interval_min,
            adv_int_max: params.interval_max,
            adv_type: esp_idf_sys::esp_ble_adv_type_t_ADV_TYPE_IND,
            own_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            peer_addr: [0; 6],
            peer_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            channel_map: esp_idf_sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
            adv_filter_policy: esp_idf_sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
        };
        call_link_api(|| unsafe { esp_idf_sys::esp_ble_gap_start_advertising(&mut adv_params) })
    }

    fn connection_descriptor(&self, handle: ConnHandle) -> LinkResult<ConnectionDescriptor> {
        self.connections
            .get(&handle)
            .copied()
            .ok_or(LinkError::UnknownConnection(handle))
    }

    fn update_connection_params(
        &mut self,
        handle: ConnHandle,
        params: &ConnectionParams,
    ) -> LinkResult<()> {
        let descriptor = self.connection_descriptor(handle)?;
        let mut update = esp_idf_sys::esp_ble_conn_update_params_t {
            bda: descriptor.peer_address,
            min_int: params.interval_min,
            max_int: params.interval_max,
            latency: params.latency,
            timeout: params.supervision_timeout,
        };
        call_link_api(|| unsafe { esp_idf_sys::esp_ble_gap_update_conn_params(&mut update) })
    }
}

struct EspIndicationSink {
    gatts_if: esp_idf_sys::esp_gatt_if_t,
}

impl IndicationSink for EspIndicationSink {
    fn indicate(&mut self, conn: ConnHandle, attr: AttrHandle, value: &[u8]) -> LinkResult<()> {
        if self.gatts_if == 0 {
            return Err(LinkError::NotReady);
        }
        let result = unsafe {
            esp_idf_sys::esp_ble_gatts_send_indicate(
                self.gatts_if,
                conn,
                attr,
                value.len() as u16,
                value.as_ptr() as *mut u8,
                true, // need_confirm = true for indication
            )
        };
        match result {
            esp_idf_sys::ESP_OK => Ok(()),
            esp_idf_sys::ESP_ERR_NOT_FOUND => Err(LinkError::UnknownConnection(conn)),
            code => Err(link_error(code)),
        }
    }
}

// GATT event handler with panic safety
extern "C" fn gatts_event_handler(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    // Panics must not unwind into the C stack
    let result =
        std::panic::catch_unwind(|| gatts_event_handler_impl(event, gatt_interface, event_param));

    if let Err(panic_info) = result {
        error!("🚨 PANIC in GATT event handler: {:?}", panic_info);
    }
}

fn gatts_event_handler_impl(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    if event_param.is_null() {
        return;
    }

    match event {
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            info!(
                "📋 GATT server registered with interface: {}",
                gatt_interface
            );
            GATT_INTERFACE.store(gatt_interface, Ordering::SeqCst);
            create_services(gatt_interface);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let create_event = unsafe { &(*event_param).create };
            let uuid = unsafe { create_event.service_id.id.uuid.uuid.uuid16 };
            let Some(service) = ServiceId::from_uuid16(uuid) else {
                warn!("⚠️ Created unknown service 0x{:04X}", uuid);
                return;
            };
            info!(
                "📋 {:?} service created with handle: {}",
                service, create_event.service_handle
            );

            if let Err(e) = call_esp_api_with_context(
                || unsafe { esp_idf_sys::esp_ble_gatts_start_service(create_event.service_handle) },
                "GATT service start",
            ) {
                error!("❌ {}", e);
            }

            let first = with_ble_state(|state| {
                let mut queue: VecDeque<_> = service.characteristics().collect();
                let first = queue.pop_front();
                state.pending_chars.insert(create_event.service_handle, queue);
                first
            })
            .flatten();
            if let Some(characteristic) = first {
                add_characteristic(create_event.service_handle, characteristic);
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let add_char_event = unsafe { &(*event_param).add_char };
            let uuid = unsafe { add_char_event.char_uuid.uuid.uuid16 };
            let Some(characteristic) = CharacteristicId::from_uuid16(uuid) else {
                warn!("⚠️ Added unknown characteristic 0x{:04X}", uuid);
                return;
            };
            if add_char_event.status != esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK {
                error!(
                    "❌ Adding {} characteristic failed, status={}",
                    characteristic, add_char_event.status
                );
                return;
            }
            info!(
                "📝 {} characteristic added with handle: {}",
                characteristic, add_char_event.attr_handle
            );

            with_ble_state(|state| {
                state
                    .peripheral
                    .register_attribute(characteristic, add_char_event.attr_handle);
                state
                    .current_char
                    .insert(add_char_event.service_handle, characteristic);
            });
            add_client_config_descriptor(add_char_event.service_handle);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
            let descr_event = unsafe { &(*event_param).add_char_descr };
            if descr_event.status != esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK {
                error!(
                    "❌ Adding client configuration descriptor failed, status={}",
                    descr_event.status
                );
            }

            let next = with_ble_state(|state| {
                if let Some(owner) = state.current_char.remove(&descr_event.service_handle) {
                    debug!(
                        "CCCD for {} at handle {}",
                        owner, descr_event.attr_handle
                    );
                    state.cccd_handles.insert(descr_event.attr_handle, owner);
                }
                let next = state
                    .pending_chars
                    .get_mut(&descr_event.service_handle)
                    .and_then(VecDeque::pop_front);
                if next.is_none() && state.peripheral.is_registered() {
                    info!("🚀 All characteristics registered - starting advertising");
                    let mut gap = EspGap {
                        connections: &state.connections,
                    };
                    if let Err(e) = state.peripheral.start(&mut gap) {
                        error!("❌ {}", e);
                        ADVERTISING_RETRY_SIGNAL.signal(());
                    }
                }
                next
            })
            .flatten();
            if let Some(characteristic) = next {
                add_characteristic(descr_event.service_handle, characteristic);
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect_event = unsafe { &(*event_param).connect };
            let descriptor = ConnectionDescriptor {
                handle: connect_event.conn_id,
                peer_address: connect_event.remote_bda,
                interval: connect_event.conn_params.interval,
                latency: connect_event.conn_params.latency,
                supervision_timeout: connect_event.conn_params.timeout,
            };
            with_ble_state(|state| {
                state.connections.insert(connect_event.conn_id, descriptor);
                dispatch(
                    state,
                    GapEvent::Connected {
                        handle: connect_event.conn_id,
                    },
                );
            });
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            let disconnect_event = unsafe { &(*event_param).disconnect };
            with_ble_state(|state| {
                state.connections.remove(&disconnect_event.conn_id);
                dispatch(
                    state,
                    GapEvent::Disconnected {
                        handle: disconnect_event.conn_id,
                        reason: disconnect_event.reason as i32,
                    },
                );
            });
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_READ_EVT => {
            let read_event = unsafe { &(*event_param).read };
            handle_read(gatt_interface, read_event);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write_event = unsafe { &(*event_param).write };
            handle_write(gatt_interface, write_event);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONF_EVT => {
            let conf_event = unsafe { &(*event_param).conf };
            let status = if conf_event.status == esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK {
                TxStatus::Done
            } else {
                TxStatus::Failed(conf_event.status as i32)
            };
            with_ble_state(|state| {
                dispatch(
                    state,
                    GapEvent::IndicationTx {
                        handle: conf_event.conn_id,
                        attr: conf_event.handle,
                        status,
                    },
                )
            });
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_MTU_EVT => {
            let mtu_event = unsafe { &(*event_param).mtu };
            with_ble_state(|state| {
                dispatch(
                    state,
                    GapEvent::MtuChanged {
                        handle: mtu_event.conn_id,
                        channel_id: ATT_CHANNEL_ID,
                        mtu: mtu_event.mtu,
                    },
                )
            });
        }
        _ => {
            debug!("GATT event: {}", event);
        }
    }
}

// GAP event handler with panic safety
extern "C" fn gap_event_handler(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    let result = std::panic::catch_unwind(|| gap_event_handler_impl(event, event_param));

    if let Err(panic_info) = result {
        error!("🚨 PANIC in GAP event handler: {:?}", panic_info);
    }
}

fn gap_event_handler_impl(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    if event_param.is_null() {
        return;
    }

    match event {
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_RAW_SET_COMPLETE_EVT
        | esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RSP_DATA_RAW_SET_COMPLETE_EVT => {}
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            let status = unsafe { (*event_param).adv_start_cmpl.status };
            if status == esp_idf_sys::esp_bt_status_t_ESP_BT_STATUS_SUCCESS {
                info!("📡 Advertising started successfully");
            } else {
                error!("❌ Advertising start failed in controller, status={}", status);
                ADVERTISING_RETRY_SIGNAL.signal(());
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            let status = unsafe { (*event_param).adv_stop_cmpl.status };
            info!("📡 Advertising stopped");
            with_ble_state(|state| {
                dispatch(
                    state,
                    GapEvent::AdvertisingComplete {
                        reason: status as i32,
                    },
                )
            });
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_UPDATE_CONN_PARAMS_EVT => {
            let update = unsafe { &(*event_param).update_conn_params };
            info!("🔄 BLE connection parameters updated");
            with_ble_state(|state| {
                let handle = state
                    .connections
                    .values_mut()
                    .find(|d| d.peer_address == update.bda)
                    .map(|d| {
                        d.interval = update.conn_int;
                        d.latency = update.latency;
                        d.supervision_timeout = update.timeout;
                        d.handle
                    });
                match handle {
                    Some(handle) => dispatch(
                        state,
                        GapEvent::ConnectionUpdated {
                            handle,
                            status: update.status as i32,
                        },
                    ),
                    None => warn!(
                        "⚠️ Parameter update for unknown peer {:02x?}",
                        update.bda
                    ),
                }
            });
        }
        _ => {
            debug!("📡 GAP event: {}", event);
        }
    }
}

fn create_services(gatt_interface: esp_idf_sys::esp_gatt_if_t) {
    for (inst_id, service) in ServiceId::ALL.into_iter().enumerate() {
        let service_id = esp_idf_sys::esp_gatt_srvc_id_t {
            is_primary: true,
            id: esp_idf_sys::esp_gatt_id_t {
                uuid: uuid16(service.uuid16()),
                inst_id: inst_id as u8,
            },
        };
        // Service declaration + (declaration, value, CCCD) per characteristic
        let num_handles = 1 + 3 * service.characteristics().count() as u16;

        if let Err(e) = call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_create_service(
                    gatt_interface,
                    &service_id as *const _ as *mut _,
                    num_handles,
                )
            },
            "GATT service creation",
        ) {
            error!("❌ {}", e);
        }
    }
}

fn add_characteristic(service_handle: u16, characteristic: CharacteristicId) {
    let char_uuid = uuid16(characteristic.uuid16());
    if let Err(e) = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_add_char(
                service_handle,
                &char_uuid as *const _ as *mut _,
                esp_idf_sys::ESP_GATT_PERM_READ as u16,
                (esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
                    | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_INDICATE) as u8,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        },
        "characteristic creation",
    ) {
        error!("❌ {} characteristic: {}", characteristic, e);
    }
}

fn add_client_config_descriptor(service_handle: u16) {
    let descr_uuid = uuid16(CLIENT_CONFIG_DESCR_UUID);
    if let Err(e) = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_add_char_descr(
                service_handle,
                &descr_uuid as *const _ as *mut _,
                (esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE) as u16,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        },
        "client configuration descriptor creation",
    ) {
        error!("❌ {}", e);
    }
}

fn handle_read(
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    param: &esp_idf_sys::esp_ble_gatts_cb_param_t_gatts_read_evt_param,
) {
    if !param.need_rsp {
        return;
    }

    let result = with_ble_state(|state| {
        match state.cccd_handles.get(&param.handle).copied() {
            Some(characteristic) => {
                let sub = state.peripheral.registry().state(characteristic);
                let enabled = sub.indication_enabled && sub.connection == Some(param.conn_id);
                let bits = if enabled { CCCD_INDICATE } else { 0 };
                Ok(AccessResponse::Value(AttributeValue::from_slice(
                    &bits.to_le_bytes(),
                )))
            }
            None => state
                .peripheral
                .on_access(param.conn_id, param.handle, AccessOp::ReadCharacteristic),
        }
    });

    let (status, payload) = match result {
        Some(Ok(response)) => (esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK, response),
        Some(Err(e)) => (
            e.att_code() as esp_idf_sys::esp_gatt_status_t,
            AccessResponse::NoContent,
        ),
        None => (
            esp_idf_sys::esp_gatt_status_t_ESP_GATT_ERROR,
            AccessResponse::NoContent,
        ),
    };

    let mut response: esp_idf_sys::esp_gatt_rsp_t = unsafe { std::mem::zeroed() };
    let bytes = payload.as_bytes();
    unsafe {
        response.attr_value.handle = param.handle;
        response.attr_value.offset = param.offset;
        response.attr_value.len = bytes.len() as u16;
        response.attr_value.value[..bytes.len()].copy_from_slice(bytes);
    }

    if let Err(e) = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_send_response(
                gatt_interface,
                param.conn_id,
                param.trans_id,
                status,
                &mut response as *mut _,
            )
        },
        "read response",
    ) {
        warn!("⚠️ {}", e);
    }
}

fn handle_write(
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    param: &esp_idf_sys::esp_ble_gatts_cb_param_t_gatts_write_evt_param,
) {
    let data: &[u8] = if param.value.is_null() || param.len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(param.value, param.len as usize) }
    };

    let status = with_ble_state(|state| {
        match state.cccd_handles.get(&param.handle).copied() {
            Some(characteristic) => {
                let (Some(value_handle), [lo, hi, ..]) =
                    (state.peripheral.table().handle(characteristic), data)
                else {
                    warn!("⚠️ Malformed CCCD write for {}", characteristic);
                    return esp_idf_sys::esp_gatt_status_t_ESP_GATT_INVALID_ATTR_LEN;
                };
                let bits = u16::from_le_bytes([*lo, *hi]);
                let prev = state.peripheral.registry().state(characteristic);
                let prev_here = prev.connection == Some(param.conn_id);
                let event = SubscribeEvent {
                    conn: param.conn_id,
                    attr: value_handle,
                    prev_notify: false,
                    cur_notify: bits & CCCD_NOTIFY != 0,
                    prev_indicate: prev_here && prev.indication_enabled,
                    cur_indicate: bits & CCCD_INDICATE != 0,
                };
                dispatch(state, GapEvent::Subscribe(event));
                esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK
            }
            None => match state.peripheral.on_access(
                param.conn_id,
                param.handle,
                AccessOp::WriteCharacteristic,
            ) {
                Ok(_) => esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK,
                Err(e) => e.att_code() as esp_idf_sys::esp_gatt_status_t,
            },
        }
    })
    .unwrap_or(esp_idf_sys::esp_gatt_status_t_ESP_GATT_ERROR);

    if param.need_rsp {
        if let Err(e) = call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_send_response(
                    gatt_interface,
                    param.conn_id,
                    param.trans_id,
                    status,
                    std::ptr::null_mut(),
                )
            },
            "write response",
        ) {
            warn!("⚠️ {}", e);
        }
    }
}

fn uuid16(uuid: u16) -> esp_idf_sys::esp_bt_uuid_t {
    esp_idf_sys::esp_bt_uuid_t {
        len: esp_idf_sys::ESP_UUID_LEN_16 as u16,
        uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 { uuid16: uuid },
    }
}

fn link_error(code: esp_idf_sys::esp_err_t) -> LinkError {
    match code {
        esp_idf_sys::ESP_ERR_NO_MEM => LinkError::NoResources,
        esp_idf_sys::ESP_ERR_INVALID_STATE => LinkError::NotReady,
        other => LinkError::Stack(other),
    }
}

fn call_link_api<F>(f: F) -> LinkResult<()>
where
    F: FnOnce() -> esp_idf_sys::esp_err_t,
{
    match f() {
        esp_idf_sys::ESP_OK => Ok(()),
        code => Err(link_error(code)),
    }
}

// ESP API wrapper with error context
fn call_esp_api_with_context<F>(f: F, context: &str) -> BleResult<()>
where
    F: FnOnce() -> esp_idf_sys::esp_err_t,
{
    let result = f();
    if result == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        let error_msg = match result {
            esp_idf_sys::ESP_ERR_INVALID_STATE => {
                format!("{}: Invalid state - BLE stack not ready", context)
            }
            esp_idf_sys::ESP_ERR_INVALID_ARG => format!("{}: Invalid argument", context),
            esp_idf_sys::ESP_ERR_NO_MEM => format!("{}: Out of memory", context),
            _ => format!("{}: Unknown error", context),
        };
        Err(BleError::EspError(result, error_msg))
    }
}
