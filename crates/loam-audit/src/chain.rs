// AUDIT TRAIL
// Append-only, hash-chained log of every state transition in the system
//
// SAFETY INVARIANTS:
// 1. Append is the only write operation; no update, no delete
// 2. Entries form a singly-linked hash chain from a zero genesis link
// 3. Verification reports the FIRST broken entry, not a bare boolean
// 4. Entry hashes are computed over canonical bytes (reproducible in review)

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use loam_core::canonical_bytes;

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEntryType {
    /// A reading passed every ingest check
    ReadingAccepted,

    /// A reading was refused (reason is in the payload hash's source record)
    ReadingRejected,

    /// The Integrity Sealer sealed a payload
    PayloadSealed,

    /// The filter wrote a new CellState version
    StateUpdated,

    /// A GridPublication was produced
    GridPublished,

    /// Pipeline ownership moved to a new epoch/owner
    OwnershipTransitioned,

    /// A signature or chain check failed. Never silently dropped; this
    /// is the category a legal audit cares most about.
    IntegrityViolation,
}

impl AuditEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntryType::ReadingAccepted => "READING_ACCEPTED",
            AuditEntryType::ReadingRejected => "READING_REJECTED",
            AuditEntryType::PayloadSealed => "PAYLOAD_SEALED",
            AuditEntryType::StateUpdated => "STATE_UPDATED",
            AuditEntryType::GridPublished => "GRID_PUBLISHED",
            AuditEntryType::OwnershipTransitioned => "OWNERSHIP_TRANSITIONED",
            AuditEntryType::IntegrityViolation => "INTEGRITY_VIOLATION",
        }
    }
}

/// One immutable link in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 0
    pub index: u64,

    pub entry_type: AuditEntryType,

    /// SHA-256 of the recorded payload's canonical bytes
    pub payload_hash: Vec<u8>,

    /// Hash of the previous entry; all zeros for the genesis entry
    pub prev_hash: Vec<u8>,

    pub recorded_at: DateTime<Utc>,

    /// SHA-256 over (index, type, payload_hash, prev_hash, recorded_at)
    pub entry_hash: Vec<u8>,
}

/// The exact location and nature of a detected chain break.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainBreak {
    #[error("entry {index}: stored hash does not match recomputed hash")]
    EntryTampered { index: u64 },

    #[error("entry {index}: prev_hash does not link to entry {}", index - 1)]
    LinkBroken { index: u64 },

    #[error("entry {index}: index out of order (expected {expected})")]
    IndexGap { index: u64, expected: u64 },

    #[error("verification range {from}..={to} is outside the chain (len {len})")]
    RangeOutOfBounds { from: u64, to: u64, len: u64 },
}

const HASH_LEN: usize = 32;

fn zero_hash() -> Vec<u8> {
    vec![0u8; HASH_LEN]
}

/// Fields covered by the entry hash, in canonical order.
#[derive(Serialize)]
struct EntryDigestView<'a> {
    index: u64,
    entry_type: AuditEntryType,
    payload_hash: &'a [u8],
    prev_hash: &'a [u8],
    recorded_at: DateTime<Utc>,
}

fn compute_entry_hash(
    index: u64,
    entry_type: AuditEntryType,
    payload_hash: &[u8],
    prev_hash: &[u8],
    recorded_at: DateTime<Utc>,
) -> Vec<u8> {
    let view = EntryDigestView { index, entry_type, payload_hash, prev_hash, recorded_at };
    let bytes = canonical_bytes(&view).expect("digest view has no unserializable fields");
    Sha256::digest(&bytes).to_vec()
}

/// In-memory chain. Durability is layered on by a sink (see `sink`);
/// the chain itself is the source of truth for verification.
#[derive(Debug, Default)]
pub struct AuditChain {
    entries: Vec<AuditEntry>,
}

impl AuditChain {
    pub fn new() -> AuditChain {
        AuditChain { entries: Vec::new() }
    }

    /// Rebuild a chain from previously persisted entries, verifying as
    /// it loads. A break on load means the durable log was tampered with
    /// or corrupted, and must surface before the node resumes.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<AuditChain, ChainBreak> {
        let chain = AuditChain { entries };
        if let Some(last) = chain.entries.last() {
            chain.verify_range(0, last.index)?;
        }
        Ok(chain)
    }

    /// Append one entry. The only public write.
    pub fn append(&mut self, entry_type: AuditEntryType, payload_hash: Vec<u8>) -> &AuditEntry {
        let index = self.entries.len() as u64;
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(zero_hash);
        let recorded_at = Utc::now();
        let entry_hash = compute_entry_hash(index, entry_type, &payload_hash, &prev_hash, recorded_at);
        info!("audit: {} at index {}", entry_type.as_str(), index);
        self.entries.push(AuditEntry {
            index,
            entry_type,
            payload_hash,
            prev_hash,
            recorded_at,
            entry_hash,
        });
        self.entries.last().expect("entry just pushed")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&AuditEntry> {
        self.entries.last()
    }

    /// Recompute hashes over an inclusive index range and report the
    /// first break, if any.
    pub fn verify_range(&self, from: u64, to: u64) -> Result<(), ChainBreak> {
        let len = self.entries.len() as u64;
        if from > to || to >= len {
            return Err(ChainBreak::RangeOutOfBounds { from, to, len });
        }
        for idx in from..=to {
            let entry = &self.entries[idx as usize];
            if entry.index != idx {
                return Err(ChainBreak::IndexGap { index: entry.index, expected: idx });
            }
            let expected_prev = if idx == 0 {
                zero_hash()
            } else {
                self.entries[idx as usize - 1].entry_hash.clone()
            };
            if entry.prev_hash != expected_prev {
                return Err(ChainBreak::LinkBroken { index: idx });
            }
            let recomputed = compute_entry_hash(
                entry.index,
                entry.entry_type,
                &entry.payload_hash,
                &entry.prev_hash,
                entry.recorded_at,
            );
            if recomputed != entry.entry_hash {
                return Err(ChainBreak::EntryTampered { index: idx });
            }
        }
        Ok(())
    }

    /// Verify the whole chain from genesis.
    pub fn verify_all(&self) -> Result<(), ChainBreak> {
        match self.entries.last() {
            None => Ok(()),
            Some(last) => self.verify_range(0, last.index),
        }
    }

    /// Compliance export: entries within a time range, as JSON lines.
    pub fn export_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>, serde_json::Error> {
        self.entries
            .iter()
            .filter(|e| e.recorded_at >= from && e.recorded_at <= to)
            .map(serde_json::to_string)
            .collect()
    }
}


#[cfg(test)]
mod chain_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_append_order_yields_a_verifiable_chain(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 32), 1..30)
        ) {
            let mut chain = AuditChain::new();
            for payload in payloads {
                chain.append(AuditEntryType::ReadingAccepted, payload);
            }
            prop_assert!(chain.verify_all().is_ok());
        }

        #[test]
        fn single_payload_mutation_breaks_at_that_entry(
            len in 2usize..30,
            victim_seed in any::<usize>(),
        ) {
            let mut chain = AuditChain::new();
            for n in 0..len {
                chain.append(AuditEntryType::StateUpdated, vec![n as u8; 32]);
            }
            let victim = victim_seed % len;
            chain.entries[victim].payload_hash = vec![0xCD; 32];
            prop_assert_eq!(
                chain.verify_all(),
                Err(ChainBreak::EntryTampered { index: victim as u64 })
            );
        }
    }
}
