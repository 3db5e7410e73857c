// Seam between the peripheral logic and the BLE host stack
//
// The stack is an event source (GapEvent) plus a handful of one-way commands
// (Gap, IndicationSink). Handles are opaque values assigned by the stack.

use std::fmt;

/// Connection handle assigned by the link layer.
pub type ConnHandle = u16;

/// Attribute (characteristic value) handle assigned at service registration.
pub type AttrHandle = u16;

// Errors reported by the link layer for commands issued by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    // The handle is not (or no longer) a live connection
    UnknownConnection(ConnHandle),
    // An indication is already waiting for its confirmation on this connection
    IndicationPending,
    // Stack ran out of buffers / queue slots
    NoResources,
    // Stack has not finished initializing
    NotReady,
    // Any other raw status from the stack
    Stack(i32),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UnknownConnection(handle) => write!(f, "unknown connection {}", handle),
            LinkError::IndicationPending => write!(f, "indication already queued"),
            LinkError::NoResources => write!(f, "insufficient resources"),
            LinkError::NotReady => write!(f, "stack not ready"),
            LinkError::Stack(code) => write!(f, "stack error {}", code),
        }
    }
}

impl std::error::Error for LinkError {}

pub type LinkResult<T> = Result<T, LinkError>;

/// Negotiated parameters of a live connection, in link-layer units
/// (interval: 1.25 ms, supervision timeout: 10 ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub handle: ConnHandle,
    pub peer_address: [u8; 6],
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

/// Undirected connectable advertising with an interval range in 0.625 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParams {
    pub interval_min: u16,
    pub interval_max: u16,
}

/// GAP commands the peripheral issues to the stack.
pub trait Gap {
    fn set_advertising_data(&mut self, data: &[u8]) -> LinkResult<()>;
    fn set_scan_response_data(&mut self, data: &[u8]) -> LinkResult<()>;
    fn start_advertising(&mut self, params: &AdvertisingParams) -> LinkResult<()>;
    fn connection_descriptor(&self, handle: ConnHandle) -> LinkResult<ConnectionDescriptor>;
    fn update_connection_params(
        &mut self,
        handle: ConnHandle,
        params: &ConnectionParams,
    ) -> LinkResult<()>;
}

/// One-way push of an indication frame. Delivery is confirmed (or not)
/// later through `GapEvent::IndicationTx`.
pub trait IndicationSink {
    fn indicate(&mut self, conn: ConnHandle, attr: AttrHandle, value: &[u8]) -> LinkResult<()>;
}

/// Outcome of a queued indication as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Sent,
    // Peer confirmed the indication
    Done,
    Failed(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeEvent {
    pub conn: ConnHandle,
    pub attr: AttrHandle,
    pub prev_notify: bool,
    pub cur_notify: bool,
    pub prev_indicate: bool,
    pub cur_indicate: bool,
}

/// Link-layer events, one variant per event kind the peripheral reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    Connected { handle: ConnHandle },
    ConnectFailed { status: i32 },
    Disconnected { handle: ConnHandle, reason: i32 },
    ConnectionUpdated { handle: ConnHandle, status: i32 },
    AdvertisingComplete { reason: i32 },
    IndicationTx { handle: ConnHandle, attr: AttrHandle, status: TxStatus },
    Subscribe(SubscribeEvent),
    MtuChanged { handle: ConnHandle, channel_id: u16, mtu: u16 },
}
