// CELL STATE STORE
// Append-only versioned storage of the filter's beliefs
//
// SAFETY INVARIANTS:
// 1. Versions are appended, never mutated in place; any number of filter
//    workers may write concurrently as long as each appends
// 2. A new version's number is exactly predecessor + 1
// 3. History is retained so the audit trail can reconstruct any epoch

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use thiserror::Error;

use loam_core::{CellIndex, CellState, TexturePrior};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version {got} does not follow latest version {latest} for cell ({}, {})", cell.row, cell.col)]
    VersionGap { cell: CellIndex, latest: u64, got: u64 },

    #[error("state persistence I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("state persistence decode failure: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Concurrent append-only store of CellState versions.
#[derive(Default)]
pub struct CellStateStore {
    cells: DashMap<CellIndex, Vec<CellState>>,
}

impl CellStateStore {
    pub fn new() -> CellStateStore {
        CellStateStore { cells: DashMap::new() }
    }

    /// Latest version for a cell, if the cell has ever been initialized.
    pub fn latest(&self, cell: CellIndex) -> Option<CellState> {
        self.cells.get(&cell).and_then(|v| v.last().cloned())
    }

    /// Latest version for a cell, initializing from the regional prior
    /// if the cell has never been observed.
    pub fn latest_or_prior(
        &self,
        cell: CellIndex,
        prior: &TexturePrior,
        now: DateTime<Utc>,
    ) -> CellState {
        self.cells
            .entry(cell)
            .or_insert_with(|| vec![CellState::from_prior(cell, prior, now)])
            .last()
            .cloned()
            .expect("cell history is never empty once inserted")
    }

    /// Append a new version. Rejects version gaps so a stale writer can
    /// never clobber or skip history.
    pub fn append(&self, state: CellState) -> Result<(), StoreError> {
        let mut entry = self.cells.entry(state.cell).or_default();
        let latest = entry.last().map(|s| s.version).unwrap_or(0);
        if state.version != latest + 1 {
            return Err(StoreError::VersionGap { cell: state.cell, latest, got: state.version });
        }
        entry.push(state);
        Ok(())
    }

    /// History of one cell, oldest first.
    pub fn history(&self, cell: CellIndex) -> Vec<CellState> {
        self.cells.get(&cell).map(|v| v.clone()).unwrap_or_default()
    }

    /// Consistent snapshot of every cell's latest version. The epoch
    /// barrier: callers invoke this only after all in-flight updates for
    /// the epoch have completed.
    pub fn snapshot_latest(&self) -> Vec<CellState> {
        let mut snapshot: Vec<CellState> = self
            .cells
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        snapshot.sort_by_key(|s| s.cell);
        snapshot
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Persist the latest version of every cell as JSON. Durable-state
    /// contract: latest CellState per cell survives process restart.
    pub fn save_latest(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let snapshot = self.snapshot_latest();
        let json = serde_json::to_string(&snapshot)?;
        fs::write(path.as_ref(), json)?;
        info!("persisted {} cell states", snapshot.len());
        Ok(())
    }

    /// Restore a store from a persisted snapshot. Each cell's history
    /// restarts at its persisted latest version.
    pub fn load_latest(path: impl AsRef<Path>) -> Result<CellStateStore, StoreError> {
        let store = CellStateStore::new();
        if !path.as_ref().exists() {
            return Ok(store);
        }
        let json = fs::read_to_string(path.as_ref())?;
        let snapshot: Vec<CellState> = serde_json::from_str(&json)?;
        for state in snapshot {
            store.cells.insert(state.cell, vec![state]);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::TexturePrior;

    fn cell(row: u32, col: u32) -> CellIndex {
        CellIndex { row, col }
    }

    #[test]
    fn test_prior_initialization() {
        let store = CellStateStore::new();
        let prior = TexturePrior::default();
        let state = store.latest_or_prior(cell(1, 1), &prior, Utc::now());
        assert_eq!(state.version, 1);
        assert_eq!(store.cell_count(), 1);
    }

    #[test]
    fn test_append_requires_consecutive_versions() {
        let store = CellStateStore::new();
        let prior = TexturePrior::default();
        let mut state = store.latest_or_prior(cell(0, 0), &prior, Utc::now());

        state.version = 3; // skips 2
        assert!(matches!(store.append(state.clone()), Err(StoreError::VersionGap { .. })));

        state.version = 2;
        assert!(store.append(state).is_ok());
        assert_eq!(store.latest(cell(0, 0)).unwrap().version, 2);
    }

    #[test]
    fn test_history_is_retained() {
        let store = CellStateStore::new();
        let prior = TexturePrior::default();
        let base = store.latest_or_prior(cell(2, 2), &prior, Utc::now());
        for v in 2..=5 {
            let mut next = base.clone();
            next.version = v;
            store.append(next).unwrap();
        }
        let history = store.history(cell(2, 2));
        assert_eq!(history.len(), 5);
        assert_eq!(history.first().unwrap().version, 1);
        assert_eq!(history.last().unwrap().version, 5);
    }

    #[test]
    fn test_snapshot_is_sorted_and_latest_only() {
        let store = CellStateStore::new();
        let prior = TexturePrior::default();
        let now = Utc::now();
        store.latest_or_prior(cell(5, 0), &prior, now);
        store.latest_or_prior(cell(0, 5), &prior, now);
        let snapshot = store.snapshot_latest();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].cell < snapshot[1].cell);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.json");

        let store = CellStateStore::new();
        let prior = TexturePrior::default();
        let base = store.latest_or_prior(cell(3, 3), &prior, Utc::now());
        let mut v2 = base.clone();
        v2.version = 2;
        v2.epoch = 7;
        store.append(v2).unwrap();
        store.save_latest(&path).unwrap();

        let restored = CellStateStore::load_latest(&path).unwrap();
        let latest = restored.latest(cell(3, 3)).unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.epoch, 7);
    }
}
