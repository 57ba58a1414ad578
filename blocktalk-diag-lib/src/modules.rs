//! Module discovery and identification payloads.

use crate::error::{Error, Result};

/// Bus address of the CAN gateway.
pub const GATEWAY_ADDRESS: u8 = 0x1F;

/// Gateway list entries at this address are not diagnosable modules.
const SKIPPED_ADDRESS: u8 = 0x13;

/// One entry of the gateway's module list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub number: u8,
    pub address: u8,
    pub name: &'static str,
    pub present: bool,
    pub status: u8,
}

/// Display name for a VAG module number.
pub fn module_name(number: u8) -> &'static str {
    match number {
        0x01 => "Engine #1",
        0x02 => "Transmission",
        0x03 => "ABS",
        0x05 => "Security Access",
        0x06 => "Passenger Seat",
        0x07 => "Front Info/Control",
        0x08 => "AC & Heating",
        0x09 => "Central Electronics #1",
        0x10 => "Parking Aid #2",
        0x11 => "Engine #2",
        0x13 => "Distance Regulation",
        0x14 => "Suspension",
        0x15 => "Airbags",
        0x16 => "Steering",
        0x17 => "Instrument Cluster",
        0x18 => "Aux Heater",
        0x19 => "CAN Gateway",
        0x20 => "High Beam Assist",
        0x22 => "All Wheel Drive",
        0x25 => "Immobiliser",
        0x26 => "Convertible Top",
        0x29 => "Left Headlight",
        0x31 => "Diagnostic Interface",
        0x34 => "Level Control",
        0x35 => "Central Locking",
        0x36 => "Driver Seat",
        0x37 => "Radio/Sat Nav",
        0x39 => "Right Headlight",
        0x42 => "Driver Door",
        0x44 => "Steering Assist",
        0x45 => "Interior Monitoring",
        0x46 => "Comfort System",
        0x47 => "Sound System",
        0x52 => "Passenger Door",
        0x53 => "Parking Brake",
        0x55 => "Headlights",
        0x56 => "Radio",
        0x57 => "TV Tuner",
        0x61 => "Battery",
        0x62 => "Rear Left Door",
        0x65 => "Tire Pressure",
        0x67 => "Voice Control",
        0x68 => "Wipers",
        0x69 => "Trailer Recognition",
        0x72 => "Rear Right Door",
        0x75 => "Telematics",
        0x76 => "Parking Aid",
        0x77 => "Telephone",
        _ => "Unknown Module",
    }
}

/// Split `len, bytes...` records (the length counts itself) up to a `0xFF`
/// terminator or the end of the data.
pub fn length_prefixed_records(data: &[u8]) -> Vec<&[u8]> {
    let mut records = Vec::new();
    let mut i = 0;
    while i < data.len() && data[i] != 0xFF {
        let len = usize::from(data[i]);
        if len == 0 {
            break;
        }
        let end = (i + len).min(data.len());
        records.push(&data[i + 1..end]);
        i += len;
    }
    records
}

/// Parse the gateway module list (the data after `5A 9F`).
///
/// # Errors
///
/// The list must hold exactly two records and the first must be a whole
/// number of 4-byte entries.
pub fn parse_module_list(data: &[u8]) -> Result<Vec<ModuleInfo>> {
    let records = length_prefixed_records(data);
    if records.len() != 2 {
        return Err(Error::violation(format!(
            "module list has {} records, expected 2",
            records.len()
        )));
    }
    let entries = records[0];
    if entries.len() % 4 != 0 {
        return Err(Error::violation(format!(
            "module list record of {} bytes is not a multiple of 4",
            entries.len()
        )));
    }

    Ok(entries
        .chunks_exact(4)
        .filter(|e| e[3] != 0 && e[1] != SKIPPED_ADDRESS)
        .map(|e| ModuleInfo {
            number: e[0],
            address: e[1],
            name: module_name(e[0]),
            present: e[3] & 0x01 != 0,
            status: (e[3] & 0x1E) >> 1,
        })
        .collect())
}

/// Part number and component name from a long identification (after `5A 9B`).
pub fn parse_long_id(data: &[u8]) -> Vec<String> {
    let part = &data[..data.len().min(16)];
    let component = data.get(26..).unwrap_or_default();
    vec![
        String::from_utf8_lossy(part).trim_end().to_string(),
        String::from_utf8_lossy(component).trim_end().to_string(),
    ]
}

/// Identification strings from a short identification (after `5A 91`).
pub fn parse_short_id(data: &[u8]) -> Vec<String> {
    length_prefixed_records(data)
        .into_iter()
        .map(|r| String::from_utf8_lossy(r).trim_end().to_string())
        .collect()
}
