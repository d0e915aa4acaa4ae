// CANONICAL ENCODING
// Single serialization used for every hash and signature in the system
//
// SAFETY INVARIANTS:
// 1. Field order is fixed by struct definition (bincode is positional)
// 2. Same value → same bytes on every node, every run
// 3. Changing a sealed type's field layout invalidates existing seals
//    and is a breaking change to the audit chain

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("canonical encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Encode a value into its canonical byte form.
///
/// Every payload hash and every signature in LOAM is computed over the
/// output of this function, never over an ad-hoc serialization. Legal
/// reproducibility of sealed records depends on this being deterministic.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(bincode::serialize(value)?)
}
