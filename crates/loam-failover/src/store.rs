// OWNERSHIP STORE
// Durable compare-and-swap ledger of pipeline ownership claims
//
// SAFETY INVARIANTS:
// 1. claim() is an atomic compare-and-swap on the latest epoch; of two
//    concurrent claimants exactly one succeeds and the loser gets the
//    winning record back
// 2. A successful claim carries epoch exactly one above its predecessor
// 3. Records are append-only; superseded records are deactivated, never
//    removed

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use loam_core::OwnershipRecord;

#[derive(Debug, Error)]
pub enum OwnershipStoreError {
    #[error("ownership store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("ownership store record malformed at line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },
}

/// Why a claim write was refused.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Another node won the epoch race. Carries the winning record so
    /// the loser can step down against ground truth.
    #[error("claim lost: epoch {} already held by {}", current.epoch, current.owner)]
    Lost { current: OwnershipRecord },

    /// The proposed record does not carry the successor epoch.
    #[error("claim rejected: proposed epoch {proposed} is not successor of {expected:?}")]
    NotSuccessor { expected: Option<u64>, proposed: u64 },

    #[error(transparent)]
    Storage(#[from] OwnershipStoreError),
}

/// Compare-and-swap ledger the orchestrator claims ownership through.
///
/// `expected_epoch` is the epoch the claimant last observed (`None` for
/// an empty ledger). The claim succeeds only if that is still the latest
/// epoch at write time.
pub trait OwnershipStore: Send + Sync {
    fn latest(&self) -> Result<Option<OwnershipRecord>, OwnershipStoreError>;

    fn claim(
        &self,
        expected_epoch: Option<u64>,
        record: OwnershipRecord,
    ) -> Result<OwnershipRecord, ClaimError>;

    fn history(&self) -> Result<Vec<OwnershipRecord>, OwnershipStoreError>;
}

fn check_and_apply(
    records: &mut Vec<OwnershipRecord>,
    expected_epoch: Option<u64>,
    mut record: OwnershipRecord,
) -> Result<OwnershipRecord, ClaimError> {
    let current_epoch = records.last().map(|r| r.epoch);
    if current_epoch != expected_epoch {
        return match records.last() {
            Some(current) => {
                warn!(
                    "ownership: claim by {} at epoch {} lost to epoch {} ({})",
                    record.owner, record.epoch, current.epoch, current.owner
                );
                Err(ClaimError::Lost { current: current.clone() })
            }
            // The claimant remembers an epoch from a ledger that no
            // longer exists (fresh data dir after a hardware swap). It
            // must refresh its view and re-claim, not crash.
            None => {
                warn!(
                    "ownership: claim by {} expected epoch {:?} against an empty ledger",
                    record.owner, expected_epoch
                );
                Err(ClaimError::NotSuccessor { expected: None, proposed: record.epoch })
            }
        };
    }
    let successor = expected_epoch.map_or(1, |e| e + 1);
    if record.epoch != successor {
        return Err(ClaimError::NotSuccessor {
            expected: expected_epoch,
            proposed: record.epoch,
        });
    }
    if let Some(prev) = records.last_mut() {
        prev.active = false;
    }
    record.active = true;
    info!(
        "ownership: epoch {} claimed by {} ({})",
        record.epoch,
        record.owner,
        record.location.as_str()
    );
    records.push(record.clone());
    Ok(record)
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryOwnershipStore {
    records: Mutex<Vec<OwnershipRecord>>,
}

impl MemoryOwnershipStore {
    pub fn new() -> MemoryOwnershipStore {
        MemoryOwnershipStore::default()
    }
}

impl OwnershipStore for MemoryOwnershipStore {
    fn latest(&self) -> Result<Option<OwnershipRecord>, OwnershipStoreError> {
        Ok(self.records.lock().last().cloned())
    }

    fn claim(
        &self,
        expected_epoch: Option<u64>,
        record: OwnershipRecord,
    ) -> Result<OwnershipRecord, ClaimError> {
        let mut records = self.records.lock();
        check_and_apply(&mut records, expected_epoch, record)
    }

    fn history(&self) -> Result<Vec<OwnershipRecord>, OwnershipStoreError> {
        Ok(self.records.lock().clone())
    }
}

/// JSONL-backed store. The whole ledger is rewritten under the lock on
/// each claim; ownership transitions are rare enough that simplicity
/// wins over an append-only encoding of the deactivation.
pub struct FileOwnershipStore {
    path: PathBuf,
    records: Mutex<Vec<OwnershipRecord>>,
}

impl FileOwnershipStore {
    pub fn open(path: &Path) -> Result<FileOwnershipStore, OwnershipStoreError> {
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str(&line)
                    .map_err(|source| OwnershipStoreError::Malformed { line: line_no + 1, source })?;
                records.push(record);
            }
        }
        Ok(FileOwnershipStore { path: path.to_path_buf(), records: Mutex::new(records) })
    }

    fn persist(&self, records: &[OwnershipRecord]) -> Result<(), OwnershipStoreError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| OwnershipStoreError::Io(e.into()))?;
            buf.push(b'\n');
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl OwnershipStore for FileOwnershipStore {
    fn latest(&self) -> Result<Option<OwnershipRecord>, OwnershipStoreError> {
        Ok(self.records.lock().last().cloned())
    }

    fn claim(
        &self,
        expected_epoch: Option<u64>,
        record: OwnershipRecord,
    ) -> Result<OwnershipRecord, ClaimError> {
        let mut records = self.records.lock();
        let mut candidate = records.clone();
        let accepted = check_and_apply(&mut candidate, expected_epoch, record)?;
        // Persist before exposing the new epoch; a crash here leaves the
        // previous ledger intact.
        self.persist(&candidate)?;
        *records = candidate;
        Ok(accepted)
    }

    fn history(&self) -> Result<Vec<OwnershipRecord>, OwnershipStoreError> {
        Ok(self.records.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use loam_core::OwnerLocation;

    fn record(epoch: u64, owner: &str, location: OwnerLocation) -> OwnershipRecord {
        let now = Utc::now();
        OwnershipRecord {
            epoch,
            owner: owner.to_string(),
            location,
            claimed_at: now,
            heartbeat_deadline: now + Duration::seconds(15),
            active: true,
        }
    }

    #[test]
    fn test_first_claim_takes_epoch_one() {
        let store = MemoryOwnershipStore::new();
        let accepted = store
            .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
            .unwrap();
        assert_eq!(accepted.epoch, 1);
        assert!(store.latest().unwrap().unwrap().active);
    }

    #[test]
    fn test_stale_expectation_loses_with_winner_attached() {
        let store = MemoryOwnershipStore::new();
        store
            .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
            .unwrap();
        store
            .claim(Some(1), record(2, "mirror-01", OwnerLocation::CloudMirror))
            .unwrap();

        // A claimant that still believes epoch 1 is current must lose.
        match store.claim(Some(1), record(2, "spare-01", OwnerLocation::ColdSpare)) {
            Err(ClaimError::Lost { current }) => {
                assert_eq!(current.epoch, 2);
                assert_eq!(current.owner, "mirror-01");
            }
            other => panic!("expected lost claim, got {:?}", other),
        }
    }

    #[test]
    fn test_remembered_epoch_against_empty_ledger_is_refused_not_fatal() {
        let store = MemoryOwnershipStore::new();
        // A node whose remembered epoch outlived its ledger file.
        match store.claim(Some(1), record(2, "spare-01", OwnerLocation::ColdSpare)) {
            Err(ClaimError::NotSuccessor { expected: None, proposed: 2 }) => {}
            other => panic!("expected refusal, got {:?}", other),
        }
        // After refreshing its view the same node claims normally.
        let accepted = store
            .claim(None, record(1, "spare-01", OwnerLocation::ColdSpare))
            .unwrap();
        assert_eq!(accepted.epoch, 1);
    }

    #[test]
    fn test_non_successor_epoch_rejected() {
        let store = MemoryOwnershipStore::new();
        store
            .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
            .unwrap();
        assert!(matches!(
            store.claim(Some(1), record(5, "mirror-01", OwnerLocation::CloudMirror)),
            Err(ClaimError::NotSuccessor { .. })
        ));
    }

    #[test]
    fn test_superseded_record_deactivated_but_retained() {
        let store = MemoryOwnershipStore::new();
        store
            .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
            .unwrap();
        store
            .claim(Some(1), record(2, "mirror-01", OwnerLocation::CloudMirror))
            .unwrap();
        let history = store.history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[1].active);
    }

    #[test]
    fn test_exactly_one_concurrent_claimant_wins() {
        use std::sync::Arc;
        let store = Arc::new(MemoryOwnershipStore::new());
        store
            .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let owner = format!("claimant-{}", i);
                store
                    .claim(Some(1), record(2, &owner, OwnerLocation::CloudMirror))
                    .is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(store.latest().unwrap().unwrap().epoch, 2);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ownership.jsonl");
        {
            let store = FileOwnershipStore::open(&path).unwrap();
            store
                .claim(None, record(1, "edge-01", OwnerLocation::PrimaryEdge))
                .unwrap();
            store
                .claim(Some(1), record(2, "mirror-01", OwnerLocation::CloudMirror))
                .unwrap();
        }
        let reopened = FileOwnershipStore::open(&path).unwrap();
        let latest = reopened.latest().unwrap().unwrap();
        assert_eq!(latest.epoch, 2);
        assert_eq!(latest.owner, "mirror-01");
        assert_eq!(reopened.history().unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ownership.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            FileOwnershipStore::open(&path),
            Err(OwnershipStoreError::Malformed { line: 1, .. })
        ));
    }
}
