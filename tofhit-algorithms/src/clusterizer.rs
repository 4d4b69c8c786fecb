//! TOF clusterizer: the full hit reconstruction of one processing unit.
//!
//! Stages, in order:
//! 1. beam counter side duplication ([`DigiStore::duplicate_beam_counter`])
//! 2. calibration and deadtime ([`Calibrator`])
//! 3. routing into channel buckets ([`DigiStore::ingest`])
//! 4. per counter: strip pairing and cluster building
//!    ([`build_counter_clusters`]), optionally in parallel
//! 5. hit emission with global positions and digi match records
//! 6. merging across neighbouring counters ([`merge_hits`])
//! 7. optional bounded hit history ([`HitHistory`])
//!
//! Stages 5 to 7 only start once every counter is done.

use crate::calibrator::{Calibrator, CalibratorConfig};
use crate::cluster::{build_counter_clusters, Cluster};
use crate::history::HitHistory;
use crate::merge::merge_hits;
use crate::store::DigiStore;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tofhit_core::hit::DEFAULT_POSITION_ERROR;
use tofhit_core::{
    CalibrationTables, ClusterizerStatistics, DetectorLayout, DetectorSetup, Digi, DigiMatch,
    Error, Geometry, Result, TofHit,
};

/// Clusterizer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterizerConfig {
    pub calibrator: CalibratorConfig,
    /// Accepted |position| along a strip, in units of the half strip length.
    pub pos_max_scale: f64,
    /// Merge hits across neighbouring counters of pad-like types.
    pub merge_across_counters: bool,
    /// Space window of the merger; defaults to the counter space window.
    pub merge_space_dist: Option<f64>,
    /// Position uncertainty assigned to each hit coordinate (cm).
    pub position_error: f64,
    /// Time horizon of the hit history (ns); 0 disables the history.
    pub memory_time: f64,
    /// Clear the hit history every N units (0: only at finish).
    pub history_clean_interval: usize,
    /// Verify the hit history on every cleanup.
    pub check_history: bool,
    /// Units with more raw digis are skipped.
    pub max_digis_per_unit: usize,
    /// Cluster counters in parallel.
    pub parallel: bool,
}

impl Default for ClusterizerConfig {
    fn default() -> Self {
        Self {
            calibrator: CalibratorConfig::default(),
            pos_max_scale: 1.5,
            merge_across_counters: true,
            merge_space_dist: None,
            position_error: DEFAULT_POSITION_ERROR,
            memory_time: 0.0,
            history_clean_interval: 1000,
            check_history: true,
            max_digis_per_unit: 100_000,
            parallel: false,
        }
    }
}

impl ClusterizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_calibrator(mut self, calibrator: CalibratorConfig) -> Self {
        self.calibrator = calibrator;
        self
    }

    #[must_use]
    pub fn with_pos_max_scale(mut self, scale: f64) -> Self {
        self.pos_max_scale = scale;
        self
    }

    #[must_use]
    pub fn with_merging(mut self, enabled: bool, space_dist: Option<f64>) -> Self {
        self.merge_across_counters = enabled;
        self.merge_space_dist = space_dist;
        self
    }

    #[must_use]
    pub fn with_memory_time(mut self, memory_time: f64, clean_interval: usize) -> Self {
        self.memory_time = memory_time;
        self.history_clean_interval = clean_interval;
        self
    }

    #[must_use]
    pub fn with_max_digis(mut self, max: usize) -> Self {
        self.max_digis_per_unit = max;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.pos_max_scale) {
            return Err(Error::Config(format!(
                "pos_max_scale must be positive, got {}",
                self.pos_max_scale
            )));
        }
        if self.merge_space_dist.is_some_and(|d| !positive(d)) {
            return Err(Error::Config("merge_space_dist must be positive".to_string()));
        }
        if !(self.memory_time.is_finite() && self.memory_time >= 0.0) {
            return Err(Error::Config(format!(
                "memory_time must be non-negative, got {}",
                self.memory_time
            )));
        }
        if !(self.calibrator.channel_deadtime.is_finite() && self.calibrator.channel_deadtime >= 0.0)
        {
            return Err(Error::Config("channel_deadtime must be non-negative".to_string()));
        }
        Ok(())
    }
}

/// Result of one processing unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitOutput {
    /// Calibrated digis, sorted by time. Match records index into this.
    pub calibrated_digis: Vec<Digi>,
    pub hits: Vec<TofHit>,
    /// Index aligned with `hits`.
    pub matches: Vec<DigiMatch>,
}

/// Mutable clusterizer state, owned by the caller.
pub struct ClusterizerState {
    store: DigiStore,
    history: Option<HitHistory>,
    rng: Xoshiro256Plus,
    seed: u64,
    statistics: ClusterizerStatistics,
}

impl ClusterizerState {
    /// Reset buckets, history, dither generator and counters.
    pub fn reset(&mut self) {
        self.store.reset();
        if let Some(history) = self.history.as_mut() {
            history.clean();
        }
        self.rng = Xoshiro256Plus::seed_from_u64(self.seed);
        self.statistics = ClusterizerStatistics::default();
    }

    pub fn statistics(&self) -> &ClusterizerStatistics {
        &self.statistics
    }

    pub fn history(&self) -> Option<&HitHistory> {
        self.history.as_ref()
    }
}

/// TOF hit reconstruction.
pub struct TofClusterizer {
    layout: Arc<DetectorLayout>,
    calibrator: Calibrator,
    config: ClusterizerConfig,
    geometry: Arc<dyn Geometry>,
}

impl TofClusterizer {
    /// Build a clusterizer for `setup` using `tables`.
    ///
    /// The tables must have been built for the layout of the same setup.
    pub fn new(
        setup: &DetectorSetup,
        tables: CalibrationTables,
        config: ClusterizerConfig,
    ) -> Result<Self> {
        Self::from_layout(Arc::new(DetectorLayout::new(setup)?), tables, config)
    }

    /// Build a clusterizer for `setup` with neutral calibration tables.
    pub fn uncalibrated(setup: &DetectorSetup, config: ClusterizerConfig) -> Result<Self> {
        let layout = DetectorLayout::new(setup)?;
        let tables = CalibrationTables::neutral(&layout);
        Self::from_layout(Arc::new(layout), tables, config)
    }

    /// Build a clusterizer from an already validated layout.
    pub fn from_layout(
        layout: Arc<DetectorLayout>,
        tables: CalibrationTables,
        config: ClusterizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if tables.n_channels() != layout.n_channels_total() {
            return Err(Error::Config(format!(
                "calibration tables cover {} channels, layout has {}",
                tables.n_channels(),
                layout.n_channels_total()
            )));
        }
        let calibrator = Calibrator::new(tables, config.calibrator.clone());
        let geometry: Arc<dyn Geometry> = layout.clone();
        Ok(Self {
            layout,
            calibrator,
            config,
            geometry,
        })
    }

    /// Replace the counter transforms of the layout by an external geometry.
    #[must_use]
    pub fn with_geometry(mut self, geometry: Arc<dyn Geometry>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    pub fn config(&self) -> &ClusterizerConfig {
        &self.config
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn create_state(&self) -> ClusterizerState {
        let seed = self.config.calibrator.seed;
        ClusterizerState {
            store: DigiStore::new(&self.layout),
            history: (self.config.memory_time > 0.0).then(|| HitHistory::new(&self.layout)),
            rng: Xoshiro256Plus::seed_from_u64(seed),
            seed,
            statistics: ClusterizerStatistics::default(),
        }
    }

    /// Reconstruct the hits of one processing unit.
    ///
    /// Recoverable conditions are counted in the state statistics. An error
    /// aborts the unit; the counts gathered up to that point are kept and the
    /// state stays usable for the next one.
    pub fn process_unit(&self, raw: &[Digi], state: &mut ClusterizerState) -> Result<UnitOutput> {
        let mut stats = ClusterizerStatistics {
            units_processed: 1,
            digis_received: raw.len(),
            ..Default::default()
        };
        let result = self.reconstruct(raw, state, &mut stats);
        if result.is_err() {
            stats.units_aborted += 1;
        }
        state.statistics += stats;
        result
    }

    fn reconstruct(
        &self,
        raw: &[Digi],
        state: &mut ClusterizerState,
        stats: &mut ClusterizerStatistics,
    ) -> Result<UnitOutput> {
        state.store.clear();

        if raw.len() > self.config.max_digis_per_unit {
            log::warn!(
                "unit with {} digis exceeds the limit of {}, skipped",
                raw.len(),
                self.config.max_digis_per_unit
            );
            stats.oversized_units += 1;
            return Ok(UnitOutput::default());
        }

        let expanded = state.store.duplicate_beam_counter(&self.layout, raw, stats);
        let calibrated = self
            .calibrator
            .calibrate(&self.layout, &expanded, &mut state.rng, stats)?;
        state.store.ingest(&self.layout, &calibrated, stats);

        let clusters = self.build_clusters(&mut state.store, stats)?;

        let mut hits = Vec::with_capacity(clusters.len());
        let mut matches = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let (hit, digi_match) = self.emit(cluster, hits.len(), &calibrated)?;
            hits.push(hit);
            matches.push(digi_match);
        }
        stats.hits_built += hits.len();

        if self.config.merge_across_counters {
            merge_hits(
                &self.layout,
                self.config.merge_space_dist,
                &mut hits,
                &mut matches,
                &calibrated,
                stats,
            )?;
        }

        let units_done = state.statistics.units_processed + 1;
        if let Some(history) = state.history.as_mut() {
            self.update_history(history, &hits, units_done, stats)?;
        }

        Ok(UnitOutput {
            calibrated_digis: calibrated,
            hits,
            matches,
        })
    }

    /// Flush the hit history at the end of a run.
    pub fn finish(&self, state: &mut ClusterizerState) -> Result<()> {
        if let Some(history) = state.history.as_mut() {
            if self.config.check_history {
                history.check(&self.layout)?;
            }
            state.statistics.history_evicted += history.clean();
        }
        log::info!(
            "clusterizer finished: {} units, {} hits",
            state.statistics.units_processed,
            state.statistics.hits_out()
        );
        Ok(())
    }

    /// Statistics accumulated in `state`.
    pub fn statistics<'a>(&self, state: &'a ClusterizerState) -> &'a ClusterizerStatistics {
        &state.statistics
    }

    fn build_clusters(
        &self,
        store: &mut DigiStore,
        stats: &mut ClusterizerStatistics,
    ) -> Result<Vec<Cluster>> {
        let scale = self.config.pos_max_scale;
        let buckets = store.counter_buckets(&self.layout);
        let counters = self.layout.counters();

        let per_counter: Vec<Result<(Vec<Cluster>, ClusterizerStatistics)>> = if self.config.parallel
        {
            counters
                .par_iter()
                .zip(buckets.into_par_iter())
                .map(|(counter, buckets)| {
                    let mut local = ClusterizerStatistics::default();
                    build_counter_clusters(counter, buckets, scale, &mut local).map(|c| (c, local))
                })
                .collect()
        } else {
            counters
                .iter()
                .zip(buckets)
                .map(|(counter, buckets)| {
                    let mut local = ClusterizerStatistics::default();
                    build_counter_clusters(counter, buckets, scale, &mut local).map(|c| (c, local))
                })
                .collect()
        };

        // Counts of every finished counter are kept even when another fails.
        let mut clusters = Vec::new();
        let mut failure = None;
        for result in per_counter {
            match result {
                Ok((found, local)) => {
                    *stats += local;
                    clusters.extend(found);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(clusters),
        }
    }

    fn emit(&self, cluster: Cluster, index: usize, calibrated: &[Digi]) -> Result<(TofHit, DigiMatch)> {
        let counter = self.layout.counter(cluster.slot).ok_or_else(|| {
            Error::Config(format!("cluster refers to unknown counter slot {}", cluster.slot))
        })?;

        let mut digi_match = DigiMatch::new();
        for &digi in &cluster.digis {
            let calibrated_digi = calibrated.get(digi).ok_or(Error::InvalidDigiIndex {
                index: digi,
                len: calibrated.len(),
            })?;
            digi_match.add_link(calibrated_digi.tot, digi);
        }

        // The beam counter defines the origin.
        let position = if self.layout.is_beam_counter(counter.address.sm_type) {
            [0.0; 3]
        } else {
            self.geometry.to_global(counter.address, cluster.local)
        };

        let hit = TofHit {
            address: counter.channel_address(cluster.channel),
            position,
            position_error: [self.config.position_error; 3],
            time: cluster.time,
            tot: cluster.weight,
            n_digis: digi_match.len(),
            index,
        };
        Ok((hit, digi_match))
    }

    fn update_history(
        &self,
        history: &mut HitHistory,
        hits: &[TofHit],
        units_done: usize,
        stats: &mut ClusterizerStatistics,
    ) -> Result<()> {
        for hit in hits {
            let slot = self.layout.slot(hit.address).ok_or_else(|| {
                Error::HistoryMismatch(format!("hit address {} has no counter", hit.address))
            })?;
            if history.store(slot, hit.address.channel, *hit) {
                stats.history_stored += 1;
            } else {
                stats.history_duplicates += 1;
            }
        }

        if let Some(latest) = hits.iter().map(|h| h.time).reduce(f64::max) {
            stats.history_evicted += history.expire(latest - self.config.memory_time);
        }

        let interval = self.config.history_clean_interval;
        if interval > 0 && units_done % interval == 0 {
            if self.config.check_history {
                history.check(&self.layout)?;
            }
            let evicted = history.clean();
            log::debug!("hit history cleaned after {units_done} units, {evicted} hits evicted");
            stats.history_evicted += evicted;
        }
        Ok(())
    }
}
