// DEVICE KEY REGISTRY
// Provisioned sensor-to-verifying-key bindings, the trust root for seals
//
// SAFETY INVARIANTS:
// 1. A seal is trusted for a sensor only when its signer is the key
//    provisioned for that sensor; a well-formed signature from any other
//    key is an integrity violation, not a valid seal
// 2. An unprovisioned sensor has no trusted key and every seal claiming
//    it is refused
// 3. Re-provisioning a sensor is a key rotation and is logged

use std::collections::HashMap;

use log::{info, warn};
use parking_lot::RwLock;

use crate::sealer::SealError;

/// Registry of provisioned devices, keyed by sensor id. The signer id is
/// the hex-encoded ed25519 verifying key recorded at provisioning time.
#[derive(Default)]
pub struct DeviceKeyRegistry {
    keys: RwLock<HashMap<String, String>>,
}

impl DeviceKeyRegistry {
    pub fn new() -> DeviceKeyRegistry {
        DeviceKeyRegistry::default()
    }

    /// Bind a sensor to its provisioned verifying key.
    pub fn provision(&self, sensor_id: impl Into<String>, signer_id: impl Into<String>) {
        let sensor_id = sensor_id.into();
        let signer_id = signer_id.into();
        let mut keys = self.keys.write();
        match keys.insert(sensor_id.clone(), signer_id) {
            Some(previous) => warn!("registry: key rotated for sensor {} (was {})", sensor_id, previous),
            None => info!("registry: provisioned sensor {}", sensor_id),
        }
    }

    pub fn signer_for(&self, sensor_id: &str) -> Option<String> {
        self.keys.read().get(sensor_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Check a seal's signer against the key provisioned for the sensor
    /// the record claims to come from.
    pub fn check_binding(&self, sensor_id: &str, signer_id: &str) -> Result<(), SealError> {
        match self.keys.read().get(sensor_id) {
            None => Err(SealError::UnprovisionedSensor {
                sensor_id: sensor_id.to_string(),
            }),
            Some(expected) if expected == signer_id => Ok(()),
            Some(_) => Err(SealError::SignerMismatch {
                sensor_id: sensor_id.to_string(),
            }),
        }
    }
}
