//! ECU identity: the immutable record every discovery response and
//! announcement is populated from, plus loading it from the identity
//! config file (YAML, or JSON for tooling that prefers it).

use crate::error::DoipError;
use crate::payload::{DoipPayload, VehicleIdentification};
use serde::Deserialize;
use std::path::Path;

/// Identity of the DoIP entity, read-only after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityIdentity {
    pub vin: [u8; 17],
    pub logical_address: u16,
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action_required: u8,
}

impl EntityIdentity {
    /// The vehicle identification response / announcement body for this
    /// entity. Sync status is reported as synchronized (0x00).
    pub fn identification(&self) -> VehicleIdentification {
        VehicleIdentification {
            vin: self.vin,
            logical_address: self.logical_address,
            eid: self.eid,
            gid: self.gid,
            further_action_required: self.further_action_required,
            vin_gid_sync_status: Some(0x00),
        }
    }

    pub fn identification_response(&self) -> DoipPayload {
        DoipPayload::VehicleIdentificationResponse(self.identification())
    }
}

#[derive(Debug, Deserialize)]
struct IdentityFile {
    #[serde(rename = "ECU")]
    ecu: EcuSection,
}

#[derive(Debug, Deserialize)]
struct EcuSection {
    vin: String,
    #[serde(rename = "logicalAddress")]
    logical_address: u16,
    eid: String,
    gid: String,
    #[serde(rename = "furtherActionRequired", default)]
    further_action_required: u8,
}

fn parse_vin(vin: &str) -> Result<[u8; 17], DoipError> {
    if vin.len() != 17 || !vin.is_ascii() {
        return Err(DoipError::Config(format!(
            "vin must be 17 ASCII characters, got {:?}",
            vin
        )));
    }
    let mut out = [0u8; 17];
    out.copy_from_slice(vin.as_bytes());
    Ok(out)
}

/// Parse a 6-byte identifier given as hex, with or without `:`/`-`
/// separators (MAC notation).
fn parse_id6(field: &str, value: &str) -> Result<[u8; 6], DoipError> {
    let stripped: String = value.chars().filter(|c| *c != ':' && *c != '-').collect();
    let decoded = hex::decode(&stripped)
        .map_err(|e| DoipError::Config(format!("{field} is not valid hex: {e}")))?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| DoipError::Config(format!("{field} must be 6 bytes, got {}", decoded.len())))
}

impl EntityIdentity {
    /// Load the identity from a config file. `.json` files are parsed as
    /// JSON, everything else as YAML (the original `yaml.conf` shape):
    ///
    /// ```yaml
    /// ECU:
    ///   vin: "WAUZZZ8V9KA000001"
    ///   logicalAddress: 0xE400
    ///   eid: "00:1a:2b:3c:4d:5e"
    ///   gid: "00:1a:2b:3c:4d:5f"
    /// ```
    pub fn load(path: &Path) -> Result<Self, DoipError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DoipError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: IdentityFile = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&raw)
                .map_err(|e| DoipError::Config(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|e| DoipError::Config(format!("{}: {e}", path.display())))?
        };
        Self::from_sections(file.ecu)
    }

    fn from_sections(ecu: EcuSection) -> Result<Self, DoipError> {
        Ok(EntityIdentity {
            vin: parse_vin(&ecu.vin)?,
            logical_address: ecu.logical_address,
            eid: parse_id6("eid", &ecu.eid)?,
            gid: parse_id6("gid", &ecu.gid)?,
            further_action_required: ecu.further_action_required,
        })
    }
}
