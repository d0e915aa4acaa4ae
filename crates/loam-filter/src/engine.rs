// FILTER ENGINE
// One predict/observe/update epoch across the grid
//
// SAFETY INVARIANTS:
// 1. Distinct cells update in parallel; each appends its own new version
// 2. A malformed single-cell update is isolated (logged, prior state
//    kept) and never aborts the epoch for other cells
// 3. A superseded epoch finishes in-flight cell work but starts no new
//    cells; its results are discarded by the caller, not published
// 4. Function return is the epoch barrier: when run_epoch returns, every
//    update for the epoch is in the store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use rayon::prelude::*;

use loam_core::{CellIndex, CellState, DepthLayer, FilterConfig, Reading, TexturePrior};

use crate::model::{learn_texture, predict_layer, update_layer};
use crate::store::CellStateStore;

/// Cancellation handle for one epoch. The scheduler cancels a stale
/// epoch when a newer trigger supersedes it.
#[derive(Clone, Default)]
pub struct EpochHandle {
    cancelled: Arc<AtomicBool>,
}

impl EpochHandle {
    pub fn new() -> EpochHandle {
        EpochHandle::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What one epoch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSummary {
    pub epoch: u64,

    /// Cells that appended a new version
    pub cells_updated: usize,

    /// Readings folded into estimates
    pub readings_applied: usize,

    /// Cells whose update was isolated due to numerical degeneracy
    pub isolated_failures: usize,

    /// Cells skipped because the epoch was cancelled mid-run
    pub cells_skipped: usize,

    /// True when the epoch was superseded before completing
    pub cancelled: bool,
}

/// Runs filter epochs against a store.
pub struct FilterEngine {
    config: FilterConfig,
    prior: TexturePrior,
}

enum CellOutcome {
    Updated { readings: usize },
    Isolated,
    Skipped,
}

impl FilterEngine {
    pub fn new(config: FilterConfig, prior: TexturePrior) -> FilterEngine {
        FilterEngine { config, prior }
    }

    /// Run one epoch. `accepted` pairs each reading with its grid cell
    /// (per-sensor sequence order is restored here before application).
    /// Cells already in the store but without readings this epoch are
    /// advanced predict-only, so their uncertainty inflates with time.
    pub fn run_epoch(
        &self,
        epoch: u64,
        now: DateTime<Utc>,
        accepted: Vec<(CellIndex, Reading)>,
        forecast_et_mm_day: f64,
        store: &CellStateStore,
        handle: &EpochHandle,
    ) -> EpochSummary {
        let mut by_cell: HashMap<CellIndex, Vec<Reading>> = HashMap::new();
        for (cell, reading) in accepted {
            by_cell.entry(cell).or_default().push(reading);
        }
        // Within one sensor, readings apply in sequence order. Across
        // sensors no ordering is required.
        for readings in by_cell.values_mut() {
            readings.sort_by(|a, b| {
                (&a.body.sensor_id, a.body.sequence).cmp(&(&b.body.sensor_id, b.body.sequence))
            });
        }

        // Every known cell participates; observed cells get the update step.
        let mut work: Vec<(CellIndex, Vec<Reading>)> = by_cell.into_iter().collect();
        for state in store.snapshot_latest() {
            if !work.iter().any(|(c, _)| *c == state.cell) {
                work.push((state.cell, Vec::new()));
            }
        }

        let outcomes: Vec<CellOutcome> = work
            .into_par_iter()
            .map(|(cell, readings)| {
                if handle.is_cancelled() {
                    return CellOutcome::Skipped;
                }
                self.update_cell(epoch, now, cell, readings, forecast_et_mm_day, store)
            })
            .collect();

        let mut summary = EpochSummary {
            epoch,
            cells_updated: 0,
            readings_applied: 0,
            isolated_failures: 0,
            cells_skipped: 0,
            cancelled: handle.is_cancelled(),
        };
        for outcome in outcomes {
            match outcome {
                CellOutcome::Updated { readings } => {
                    summary.cells_updated += 1;
                    summary.readings_applied += readings;
                }
                CellOutcome::Isolated => summary.isolated_failures += 1,
                CellOutcome::Skipped => summary.cells_skipped += 1,
            }
        }
        info!(
            "filter epoch {}: {} cells updated, {} readings, {} isolated, {} skipped",
            epoch,
            summary.cells_updated,
            summary.readings_applied,
            summary.isolated_failures,
            summary.cells_skipped
        );
        summary
    }

    fn update_cell(
        &self,
        epoch: u64,
        now: DateTime<Utc>,
        cell: CellIndex,
        readings: Vec<Reading>,
        forecast_et_mm_day: f64,
        store: &CellStateStore,
    ) -> CellOutcome {
        let prev = store.latest_or_prior(cell, &self.prior, now);
        let dt_hours = (now - prev.updated_at).num_seconds().max(0) as f64 / 3600.0;

        // Predict
        let mut next = prev.clone();
        for layer in &mut next.layers {
            *layer = predict_layer(
                layer,
                &next.texture,
                next.ksat_mm_hr,
                forecast_et_mm_day,
                dt_hours,
                &self.config,
            );
        }

        // Observe + update, in restored sequence order
        let mut contributing = Vec::with_capacity(readings.len());
        let mut last_observed_at = prev.last_observed_at;
        for reading in &readings {
            let layer_kind = DepthLayer::from_depth_m(reading.body.depth_m);
            let Some(layer) = next.layer(layer_kind).copied() else {
                continue;
            };
            let residual = reading.body.vwc - layer.vwc;
            let updated = update_layer(&layer, reading.body.vwc, &self.config);
            *next
                .layer_mut(layer_kind)
                .expect("layer present: just read it") = updated;

            let (texture, ksat) = learn_texture(&next.texture, next.ksat_mm_hr, residual, &self.config);
            next.texture = texture;
            next.ksat_mm_hr = ksat;

            contributing.push(reading.id());
            last_observed_at = Some(match last_observed_at {
                Some(t) => t.max(reading.body.captured_at),
                None => reading.body.captured_at,
            });
        }

        next.version = prev.version + 1;
        next.epoch = epoch;
        next.updated_at = now;
        next.last_observed_at = last_observed_at;
        next.contributing = contributing;

        if !Self::is_well_formed(&next) {
            error!(
                "isolating malformed update for cell ({}, {}); retaining version {}",
                cell.row, cell.col, prev.version
            );
            return CellOutcome::Isolated;
        }

        match store.append(next) {
            Ok(()) => CellOutcome::Updated { readings: readings.len() },
            Err(e) => {
                error!("isolating cell ({}, {}): {}", cell.row, cell.col, e);
                CellOutcome::Isolated
            }
        }
    }

    fn is_well_formed(state: &CellState) -> bool {
        state.layers.iter().all(|l| {
            l.vwc.is_finite() && (0.0..=1.0).contains(&l.vwc) && l.variance.is_finite() && l.variance > 0.0
        }) && state.ksat_mm_hr.is_finite()
            && state.ksat_mm_hr > 0.0
    }
}
