// DEVICE IDENTITY
// Per-device ed25519 keypair backing every seal
//
// SAFETY INVARIANTS:
// 1. The signing key never leaves this module (not serialized, not cloned out)
// 2. The signer id is derived from the verifying key, so identity claims
//    are checkable against the key that travels with each record

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// An ed25519 identity bound to one physical device.
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Generate a fresh identity. In production the key is generated
    /// once at device provisioning and kept in the device's key store.
    pub fn generate(device_id: impl Into<String>) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from a stored 32-byte secret.
    pub fn from_secret_bytes(device_id: impl Into<String>, secret: &[u8; 32]) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.into(),
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex-encoded verifying key: the signer identity carried by records.
    pub fn signer_id(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for DeviceIdentity {
    // Never expose key material in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("signer_id", &self.signer_id())
            .finish()
    }
}
