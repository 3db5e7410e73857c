use crate::advertising::DeviceAddress;

/// Serial number derived from the Bluetooth address, unique per chip
pub fn device_serial_number(address: &DeviceAddress) -> String {
    let b = &address.bytes;
    format!(
        "ENVSENSE-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Get the Bluetooth public address burned into eFuse
#[cfg(target_os = "espidf")]
pub fn get_bluetooth_address() -> Result<DeviceAddress, esp_idf_svc::sys::EspError> {
    let mut mac = [0u8; 6];
    esp_idf_svc::sys::esp!(unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_BT,
        )
    })?;
    Ok(DeviceAddress::public(mac))
}
