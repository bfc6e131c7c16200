//! Temporal fire identity tracking.
//!
//! The record set is append-only. A fire's current footprint is its latest
//! record; new detections either grow an intersecting fire, are ignored as
//! re-detections with no growth, or start a new fire.

use crate::core::geometry::{
    geodesic_area_ha, is_empty_polygon, is_valid_polygon, orient_ccw, round_to, union_with,
};
use crate::io::store::FireStore;
use crate::types::{format_timestamp, Detection, FireError, FireId, FireRecord, FireResult};
use geo::{Intersects, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Absolute tolerance under which a merge counts as no growth, hectares
    pub noop_tolerance_ha: f64,
    /// Decimals kept on `time_area` and `acc_area`
    pub area_decimals: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            noop_tolerance_ha: 0.01,
            area_decimals: 2,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> FireResult<()> {
        if !(self.noop_tolerance_ha.is_finite() && self.noop_tolerance_ha >= 0.0) {
            return Err(FireError::InvalidConfig(format!(
                "noop_tolerance_ha must be non-negative, got {}",
                self.noop_tolerance_ha
            )));
        }
        if self.area_decimals > 12 {
            return Err(FireError::InvalidConfig(format!(
                "area_decimals must be at most 12, got {}",
                self.area_decimals
            )));
        }
        Ok(())
    }
}

/// What happened to one detection of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    Created { fire: FireId, area_ha: f64 },
    Merged { fire: FireId, time_area: f64, acc_area: f64 },
    Unchanged { fire: FireId },
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    pub created: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub outcomes: Vec<TrackOutcome>,
}

impl UpdateSummary {
    /// Records appended to the store by this batch
    pub fn appended(&self) -> usize {
        self.created + self.merged
    }

    fn push(&mut self, outcome: TrackOutcome) {
        match outcome {
            TrackOutcome::Created { .. } => self.created += 1,
            TrackOutcome::Merged { .. } => self.merged += 1,
            TrackOutcome::Unchanged { .. } => self.unchanged += 1,
            TrackOutcome::Skipped => self.skipped += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Index of the latest record of every fire identity, ascending by identity.
/// Ties on time go to the record stored last.
fn latest_records(records: &[FireRecord]) -> BTreeMap<FireId, usize> {
    let mut latest: BTreeMap<FireId, usize> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        let newer = match latest.get(&record.fire) {
            Some(&cur) => record.time >= records[cur].time,
            None => true,
        };
        if newer {
            latest.insert(record.fire, idx);
        }
    }
    latest
}

/// Reconcile one batch against an in-memory record set. Detections are
/// processed in order. Only identities that existed before the batch are
/// merge candidates, but their current geometry includes merges made
/// earlier in the same batch.
pub fn reconcile(records: &mut Vec<FireRecord>, batch: &[Detection], config: &TrackerConfig) -> UpdateSummary {
    let mut summary = UpdateSummary::default();
    let mut latest = latest_records(records);
    let candidates: BTreeSet<FireId> = latest.keys().copied().collect();
    let mut next_fire = candidates.iter().next_back().map_or(1, |max| max + 1);
    let decimals = config.area_decimals;

    for (idx, detection) in batch.iter().enumerate() {
        let polygon = &detection.polygon;
        if is_empty_polygon(polygon) || !is_valid_polygon(polygon) {
            log::warn!("Skipping invalid or empty geometry at batch index {}", idx);
            summary.push(TrackOutcome::Skipped);
            continue;
        }
        let time_tag = format_timestamp(&detection.time);

        let matched = candidates
            .iter()
            .filter_map(|fire| latest.get(fire).map(|&rec| (*fire, rec)))
            .find(|&(_, rec)| records[rec].geometry.intersects(polygon));

        let outcome = match matched {
            Some((fire, rec)) => {
                let current = &records[rec];
                let (prev_time, prev_acc) = (current.time, current.acc_area);
                let combined = union_with(&current.geometry, polygon);
                let time_area = round_to(geodesic_area_ha(polygon), decimals);
                let mut acc_area = round_to(geodesic_area_ha(&combined), decimals);
                if let Some(prev) = prev_acc {
                    acc_area = acc_area.max(prev);
                }

                let unchanged =
                    prev_acc.map_or(false, |prev| (prev - acc_area).abs() <= config.noop_tolerance_ha);
                if unchanged {
                    log::info!("Ignored fire={} at {}: no change in area", fire, time_tag);
                    TrackOutcome::Unchanged { fire }
                } else {
                    records.push(FireRecord {
                        fire,
                        time: detection.time,
                        time_area: Some(time_area),
                        acc_area: Some(acc_area),
                        geometry: combined,
                    });
                    if detection.time >= prev_time {
                        latest.insert(fire, records.len() - 1);
                    }
                    log::info!(
                        "Fire={} updated at {} | time_area={:.2} ha | acc_area={:.2} ha",
                        fire, time_tag, time_area, acc_area
                    );
                    TrackOutcome::Merged { fire, time_area, acc_area }
                }
            }
            None => {
                let fire = next_fire;
                next_fire += 1;
                let area_ha = round_to(geodesic_area_ha(polygon), decimals);
                records.push(FireRecord {
                    fire,
                    time: detection.time,
                    time_area: Some(area_ha),
                    acc_area: Some(area_ha),
                    geometry: MultiPolygon::new(vec![orient_ccw(polygon)]),
                });
                latest.insert(fire, records.len() - 1);
                log::info!("New fire={} at {} | time_area={:.2} ha", fire, time_tag, area_ha);
                TrackOutcome::Created { fire, area_ha }
            }
        };
        summary.push(outcome);
    }
    summary
}

/// Single writer over a fire store
pub struct FireTracker<S: FireStore> {
    store: S,
    config: TrackerConfig,
}

impl<S: FireStore> FireTracker<S> {
    pub fn new(store: S, config: TrackerConfig) -> FireResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Read the whole store, reconcile one timestamp's batch and write the
    /// whole store back. Nothing is written when the batch changes nothing
    /// and the store already exists.
    pub fn update(&mut self, batch: &[Detection]) -> FireResult<UpdateSummary> {
        if batch.is_empty() {
            log::debug!("Empty batch, store untouched");
            return Ok(UpdateSummary::default());
        }

        let existed = self.store.exists();
        let mut records = self.store.load()?;
        let before = records.len();
        let summary = reconcile(&mut records, batch, &self.config);

        if summary.appended() > 0 || !existed {
            self.store.save(&records)?;
            log::info!(
                "Stored {} records ({} appended) at {}",
                records.len(),
                records.len() - before,
                self.store.location()
            );
        }
        Ok(summary)
    }
}
