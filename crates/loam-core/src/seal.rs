// SEALED RECORD
// The portable proof attached to every raw measurement and derived artifact

use serde::{Deserialize, Serialize};

/// Hash + signature produced by the Integrity Sealer.
///
/// The hash is SHA-256 over the payload's canonical bytes. The signature
/// is ed25519 over that hash, made with the originating device's key.
/// The signer's public key travels with the record so any node (or a
/// court-appointed expert) can verify without key distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// SHA-256 of the canonical payload bytes
    pub payload_hash: Vec<u8>,

    /// ed25519 signature over `payload_hash`
    pub signature: Vec<u8>,

    /// Signer identity: hex-encoded ed25519 verifying key
    pub signer: String,

    /// Logical device that produced the payload
    pub device_id: String,
}

impl SealedRecord {
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.payload_hash)
    }
}
