// Legacy advertising and scan-response payload construction
//
// Payloads are sequences of AD structures: [len][type][data...], len covering
// type + data, each payload at most 31 bytes.

use std::fmt;

use crate::config;
use crate::link::{AdvertisingParams, LinkError};

pub const MAX_PAYLOAD_LEN: usize = 31;

// AD types (Bluetooth assigned numbers)
pub const AD_FLAGS: u8 = 0x01;
pub const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TX_POWER_LEVEL: u8 = 0x0A;
pub const AD_APPEARANCE: u8 = 0x19;
pub const AD_ADVERTISING_INTERVAL: u8 = 0x1A;
pub const AD_LE_DEVICE_ADDRESS: u8 = 0x1B;
pub const AD_LE_ROLE: u8 = 0x1C;
pub const AD_URI: u8 = 0x24;

pub const FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0x02;
pub const FLAG_BREDR_NOT_SUPPORTED: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingError {
    // AD structure does not fit the remaining payload space
    PayloadTooLarge { ad_type: u8, needed: usize, available: usize },
    SetAdvertisingData(LinkError),
    SetScanResponse(LinkError),
    Start(LinkError),
    // Single connection slot already taken
    AlreadyConnected,
}

impl fmt::Display for AdvertisingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisingError::PayloadTooLarge {
                ad_type,
                needed,
                available,
            } => write!(
                f,
                "AD type 0x{:02X} needs {} bytes, only {} left",
                ad_type, needed, available
            ),
            AdvertisingError::SetAdvertisingData(e) => {
                write!(f, "setting advertising data failed: {}", e)
            }
            AdvertisingError::SetScanResponse(e) => {
                write!(f, "setting scan response data failed: {}", e)
            }
            AdvertisingError::Start(e) => write!(f, "starting advertising failed: {}", e),
            AdvertisingError::AlreadyConnected => {
                write!(f, "a central is already connected")
            }
        }
    }
}

impl std::error::Error for AdvertisingError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Public,
    Random,
}

/// Device address in display order (most significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    pub bytes: [u8; 6],
    pub kind: AddressKind,
}

impl DeviceAddress {
    pub fn public(bytes: [u8; 6]) -> Self {
        Self {
            bytes,
            kind: AddressKind::Public,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Everything that goes into the advertising and scan-response payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisingConfig {
    pub device_name: String,
    pub tx_power_dbm: i8,
    pub appearance: u16,
    pub le_role: u8,
    pub address: DeviceAddress,
    pub uri_scheme: u8,
    pub uri: String,
    pub interval_min: u16, // 0.625 ms units
    pub interval_max: u16,
}

impl AdvertisingConfig {
    /// Build from the compile-time defaults for the given device address.
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            device_name: config::DEVICE_NAME.to_string(),
            tx_power_dbm: config::ADV_TX_POWER_DBM,
            appearance: config::APPEARANCE_GENERIC_TAG,
            le_role: config::LE_ROLE_PERIPHERAL_ONLY,
            address,
            uri_scheme: config::URI_SCHEME_HTTPS,
            uri: config::DEVICE_URI.to_string(),
            interval_min: config::adv_interval_units(config::ADV_INTERVAL_MIN_MS),
            interval_max: config::adv_interval_units(config::ADV_INTERVAL_MAX_MS),
        }
    }

    pub fn params(&self) -> AdvertisingParams {
        AdvertisingParams {
            interval_min: self.interval_min,
            interval_max: self.interval_max,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AdPayload {
    buf: [u8; MAX_PAYLOAD_LEN],
    len: usize,
}

impl AdPayload {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_PAYLOAD_LEN],
            len: 0,
        }
    }

    /// Append one AD structure. Nothing is written if it does not fit.
    pub fn push(&mut self, ad_type: u8, data: &[u8]) -> Result<(), AdvertisingError> {
        let needed = data.len() + 2;
        let available = MAX_PAYLOAD_LEN - self.len;
        if needed > available {
            return Err(AdvertisingError::PayloadTooLarge {
                ad_type,
                needed,
                available,
            });
        }
        self.buf[self.len] = (data.len() + 1) as u8;
        self.buf[self.len + 1] = ad_type;
        self.buf[self.len + 2..self.len + needed].copy_from_slice(data);
        self.len += needed;
        Ok(())
    }

    /// Iterate over (type, data) of each AD structure.
    pub fn structures(&self) -> impl Iterator<Item = (u8, &[u8])> {
        let mut rest = self.as_bytes();
        std::iter::from_fn(move || {
            let (&len, tail) = rest.split_first()?;
            let len = len as usize;
            if len == 0 || len > tail.len() {
                return None;
            }
            let (structure, next) = tail.split_at(len);
            rest = next;
            Some((structure[0], &structure[1..]))
        })
    }

    pub fn find(&self, ad_type: u8) -> Option<&[u8]> {
        self.structures()
            .find(|(t, _)| *t == ad_type)
            .map(|(_, data)| data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for AdPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x?}", self.as_bytes())
    }
}

/// Flags, complete name, TX power, appearance and LE role.
pub fn build_advertising_data(cfg: &AdvertisingConfig) -> Result<AdPayload, AdvertisingError> {
    let mut payload = AdPayload::new();
    payload.push(
        AD_FLAGS,
        &[FLAG_LE_GENERAL_DISCOVERABLE | FLAG_BREDR_NOT_SUPPORTED],
    )?;
    payload.push(AD_COMPLETE_LOCAL_NAME, cfg.device_name.as_bytes())?;
    payload.push(AD_TX_POWER_LEVEL, &[cfg.tx_power_dbm as u8])?;
    payload.push(AD_APPEARANCE, &cfg.appearance.to_le_bytes())?;
    payload.push(AD_LE_ROLE, &[cfg.le_role])?;
    Ok(payload)
}

/// Device address, URI and advertising interval.
pub fn build_scan_response(cfg: &AdvertisingConfig) -> Result<AdPayload, AdvertisingError> {
    let mut payload = AdPayload::new();

    // Address goes over the air little-endian, followed by its type
    let mut address = [0u8; 7];
    for (dst, src) in address.iter_mut().zip(cfg.address.bytes.iter().rev()) {
        *dst = *src;
    }
    address[6] = match cfg.address.kind {
        AddressKind::Public => 0x00,
        AddressKind::Random => 0x01,
    };
    payload.push(AD_LE_DEVICE_ADDRESS, &address)?;

    let mut uri = Vec::with_capacity(cfg.uri.len() + 1);
    uri.push(cfg.uri_scheme);
    uri.extend_from_slice(cfg.uri.as_bytes());
    payload.push(AD_URI, &uri)?;

    payload.push(AD_ADVERTISING_INTERVAL, &cfg.interval_min.to_le_bytes())?;
    Ok(payload)
}
