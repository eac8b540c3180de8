//! Device identity: unique device identification and persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// The identity this device uses on either link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device identifier, carried as `deviceId` on the wire.
    pub device_id: String,
    /// Operator callsign shown to other devices.
    pub callsign: String,
}

impl DeviceIdentity {
    /// Create a new identity with a fresh device id (UUID v4).
    pub fn generate(callsign: impl Into<String>) -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            callsign: callsign.into(),
        }
    }

    /// Create an identity from known values.
    pub fn new(device_id: impl Into<String>, callsign: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            callsign: callsign.into(),
        }
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize identity: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write identity file: {e}"))
    }

    /// Load an identity from a JSON file, or generate (and save) a new one
    /// if the file is missing or corrupt. The configured callsign always wins
    /// over the stored one.
    pub fn load_or_generate(path: &Path, callsign: impl Into<String>) -> Self {
        let callsign = callsign.into();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DeviceIdentity>(&data) {
                    Ok(mut identity) => {
                        if !callsign.is_empty() {
                            identity.callsign = callsign;
                        }
                        return identity;
                    }
                    Err(e) => tracing::warn!("Corrupt identity file, regenerating: {e}"),
                },
                Err(e) => tracing::warn!("Cannot read identity file, regenerating: {e}"),
            }
        }

        let identity = Self::generate(callsign);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
