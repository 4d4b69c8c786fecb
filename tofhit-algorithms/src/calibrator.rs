//! Raw digi calibration and channel deadtime.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tofhit_core::{
    CalibrationTables, ClusterizerStatistics, DetectorLayout, Digi, Error, Result, TofAddress,
};

/// Smallest Tot a calibrated digi may carry.
pub const TOT_FLOOR: f64 = 0.001;

/// Calibrator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Minimum spacing of two valid digis on one readout address (ns),
    /// measured on the raw time.
    pub channel_deadtime: f64,
    /// Exchange side 0 and side 1 on all strip counters.
    pub swap_channel_sides: bool,
    /// Raw time and Tot are given in picoseconds.
    pub times_in_ps: bool,
    /// Add uniform noise in [0, 1) to the raw Tot before calibration, to
    /// smear its integer binning.
    pub tot_dither: bool,
    /// Seed of the dither generator.
    pub seed: u64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            channel_deadtime: 0.0,
            swap_channel_sides: false,
            times_in_ps: false,
            tot_dither: false,
            seed: 12345,
        }
    }
}

impl CalibratorConfig {
    #[must_use]
    pub fn with_deadtime(mut self, deadtime: f64) -> Self {
        self.channel_deadtime = deadtime;
        self
    }

    #[must_use]
    pub fn with_side_swap(mut self, swap: bool) -> Self {
        self.swap_channel_sides = swap;
        self
    }

    #[must_use]
    pub fn with_times_in_ps(mut self, ps: bool) -> Self {
        self.times_in_ps = ps;
        self
    }

    #[must_use]
    pub fn with_dither(mut self, seed: u64) -> Self {
        self.tot_dither = true;
        self.seed = seed;
        self
    }
}

/// Applies per-channel calibration constants to raw digis.
#[derive(Clone, Debug)]
pub struct Calibrator {
    tables: CalibrationTables,
    config: CalibratorConfig,
}

impl Calibrator {
    pub fn new(tables: CalibrationTables, config: CalibratorConfig) -> Self {
        Self { tables, config }
    }

    pub fn tables(&self) -> &CalibrationTables {
        &self.tables
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    /// Calibrate `raw` digis in arrival order and return them sorted by time.
    ///
    /// Deadtime bookkeeping is local to the call. Digis whose address is not
    /// part of `layout` pass through uncalibrated; the digi store rejects them
    /// later.
    pub fn calibrate<R: Rng + ?Sized>(
        &self,
        layout: &DetectorLayout,
        raw: &[Digi],
        rng: &mut R,
        stats: &mut ClusterizerStatistics,
    ) -> Result<Vec<Digi>> {
        let mut last_seen: HashMap<TofAddress, f64> = HashMap::new();
        let mut calibrated = Vec::with_capacity(raw.len());

        for digi in raw {
            let mut address = digi.address;
            if self.config.swap_channel_sides && !layout.is_pad_like(address.sm_type) {
                address = address.mirrored();
            }

            if !digi.is_finite() {
                log::debug!("drop digi on {address} with non-finite time or Tot");
                stats.invalid_digis += 1;
                continue;
            }
            let (mut time, mut tot) = (digi.time, digi.tot);
            if self.config.times_in_ps {
                time /= 1000.0;
                tot /= 1000.0;
            }

            // Deadtime applies to the raw time in ns, before offsets and walk.
            // The last time is recorded for discarded digis as well.
            let previous = last_seen.insert(address, time);
            if let Some(last) = previous {
                if time - last <= self.config.channel_deadtime {
                    log::debug!("deadtime: digi at t={time:.3} on {address} follows t={last:.3}");
                    stats.deadtime_discarded += 1;
                    continue;
                }
            }

            let Some((_, index)) = layout.locate(address) else {
                log::debug!("no calibration for {address}, digi kept uncalibrated");
                calibrated.push(Digi::new(address, time, tot));
                continue;
            };
            let Some(cal) = self.tables.channel(index) else {
                calibrated.push(Digi::new(address, time, tot));
                continue;
            };
            let side = usize::from(address.side);

            time -= cal.t_off[side];
            let dither = if self.config.tot_dither {
                rng.gen::<f64>()
            } else {
                0.0
            };
            tot = (tot + dither - cal.tot_off[side]).max(TOT_FLOOR) * cal.tot_gain[side];
            time -= self.tables.walk_correction(&cal.walk[side], tot);

            calibrated.push(Digi::new(address, time, tot));
        }

        calibrated.sort_by(|a, b| a.time.total_cmp(&b.time));
        if let Some(i) = calibrated.windows(2).position(|w| w[0].time > w[1].time) {
            return Err(Error::UnsortedDigis { index: i + 1 });
        }
        Ok(calibrated)
    }
}
