// INTEGRITY SEALER
// Hashes and signs every raw measurement and derived artifact
//
// SAFETY INVARIANTS:
// 1. Hash = SHA-256 over canonical bytes; field order is deterministic,
//    which is load-bearing for reproducibility in legal review
// 2. Every successful seal appends exactly one audit entry
// 3. A failed verification appends an INTEGRITY_VIOLATION entry and
//    returns the error; records are rejected, never silently dropped
// 4. Malformed payloads are rejected before hashing

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{error, info};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use loam_audit::{AuditChain, AuditEntryType};
use loam_core::{canonical_bytes, EncodeError, SealedRecord};

use crate::identity::DeviceIdentity;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("payload is malformed and was rejected before hashing: {0}")]
    Malformed(#[from] EncodeError),

    #[error("payload hash does not match the sealed hash")]
    HashMismatch,

    #[error("signature verification failed for signer {signer}")]
    BadSignature { signer: String },

    #[error("signer id {signer} is not a valid ed25519 verifying key")]
    BadSignerKey { signer: String },

    #[error("no verifying key provisioned for sensor {sensor_id}")]
    UnprovisionedSensor { sensor_id: String },

    #[error("seal for sensor {sensor_id} signed by a key other than its provisioned one")]
    SignerMismatch { sensor_id: String },
}

/// Seals payloads under one device identity and verifies seals from any
/// device (the verifying key travels inside the record).
pub struct Sealer {
    identity: DeviceIdentity,
}

impl Sealer {
    pub fn new(identity: DeviceIdentity) -> Sealer {
        Sealer { identity }
    }

    pub fn signer_id(&self) -> String {
        self.identity.signer_id()
    }

    /// Hash and sign a payload. Appends one PAYLOAD_SEALED audit entry.
    pub fn seal<T: Serialize>(
        &self,
        payload: &T,
        chain: &mut AuditChain,
    ) -> Result<SealedRecord, SealError> {
        let bytes = canonical_bytes(payload)?;
        let payload_hash = Sha256::digest(&bytes).to_vec();
        let signature = self.identity.sign(&payload_hash);
        let record = SealedRecord {
            payload_hash: payload_hash.clone(),
            signature: signature.to_bytes().to_vec(),
            signer: self.identity.signer_id(),
            device_id: self.identity.device_id().to_string(),
        };
        chain.append(AuditEntryType::PayloadSealed, payload_hash);
        info!("sealed payload for device {}", record.device_id);
        Ok(record)
    }

    /// Verify a sealed record against its payload.
    ///
    /// Checks, in order: payload re-hash matches, signer key parses,
    /// signature verifies over the hash. Any failure appends an
    /// INTEGRITY_VIOLATION entry before returning.
    pub fn verify<T: Serialize>(
        record: &SealedRecord,
        payload: &T,
        chain: &mut AuditChain,
    ) -> Result<(), SealError> {
        let outcome = Self::check(record, payload);
        if let Err(ref e) = outcome {
            error!("integrity violation from device {}: {}", record.device_id, e);
            chain.append(AuditEntryType::IntegrityViolation, record.payload_hash.clone());
        }
        outcome
    }

    fn check<T: Serialize>(record: &SealedRecord, payload: &T) -> Result<(), SealError> {
        let bytes = canonical_bytes(payload)?;
        let recomputed = Sha256::digest(&bytes).to_vec();
        if recomputed != record.payload_hash {
            return Err(SealError::HashMismatch);
        }

        let key_bytes: [u8; 32] = hex::decode(&record.signer)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| SealError::BadSignerKey { signer: record.signer.clone() })?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| SealError::BadSignerKey { signer: record.signer.clone() })?;

        let signature = Signature::from_slice(&record.signature)
            .map_err(|_| SealError::BadSignature { signer: record.signer.clone() })?;
        key.verify(&record.payload_hash, &signature)
            .map_err(|_| SealError::BadSignature { signer: record.signer.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loam_core::{GeoPosition, ReadingBody};

    fn body() -> ReadingBody {
        ReadingBody {
            sensor_id: "probe-12".to_string(),
            position: GeoPosition { lat_deg: 36.001, lon_deg: -119.998 },
            depth_m: 0.3,
            vwc: 0.31,
            captured_at: Utc::now(),
            sequence: 41,
        }
    }

    #[test]
    fn test_seal_then_verify() {
        let sealer = Sealer::new(DeviceIdentity::generate("edge-01"));
        let mut chain = AuditChain::new();
        let payload = body();
        let record = sealer.seal(&payload, &mut chain).unwrap();
        assert!(Sealer::verify(&record, &payload, &mut chain).is_ok());
        // Exactly one entry from the seal, none from the good verify.
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.entries()[0].entry_type, AuditEntryType::PayloadSealed);
    }

    #[test]
    fn test_tampered_payload_fails_and_is_audited() {
        let sealer = Sealer::new(DeviceIdentity::generate("edge-01"));
        let mut chain = AuditChain::new();
        let payload = body();
        let record = sealer.seal(&payload, &mut chain).unwrap();

        let mut tampered = payload.clone();
        tampered.vwc = 0.95;
        let result = Sealer::verify(&record, &tampered, &mut chain);
        assert!(matches!(result, Err(SealError::HashMismatch)));
        assert_eq!(chain.last().unwrap().entry_type, AuditEntryType::IntegrityViolation);
    }

    #[test]
    fn test_wrong_signer_fails() {
        let sealer = Sealer::new(DeviceIdentity::generate("edge-01"));
        let other = DeviceIdentity::generate("edge-02");
        let mut chain = AuditChain::new();
        let payload = body();
        let mut record = sealer.seal(&payload, &mut chain).unwrap();
        // Claim the seal came from another device.
        record.signer = other.signer_id();
        let result = Sealer::verify(&record, &payload, &mut chain);
        assert!(matches!(result, Err(SealError::BadSignature { .. })));
    }

    #[test]
    fn test_garbage_signer_key_rejected() {
        let sealer = Sealer::new(DeviceIdentity::generate("edge-01"));
        let mut chain = AuditChain::new();
        let payload = body();
        let mut record = sealer.seal(&payload, &mut chain).unwrap();
        record.signer = "zz".to_string();
        assert!(matches!(
            Sealer::verify(&record, &payload, &mut chain),
            Err(SealError::BadSignerKey { .. })
        ));
    }
}
