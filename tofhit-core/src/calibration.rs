//! Per-channel calibration tables.
//!
//! Every channel carries, per readout side, a time offset, a Tot offset, a Tot
//! gain and a walk table with a fixed number of bins over `[tot_min, tot_max)`.
//! Channels without an entry keep neutral constants (no correction).
//!
//! Tables are loaded from JSON against a [`DetectorLayout`]:
//!
//! ```json
//! {
//!   "tot_min": 0.0, "tot_max": 50.0, "target_tot_mean": 2.0, "n_walk_bins": 50,
//!   "channels": [
//!     { "sm_type": 0, "sm": 0, "rpc": 0, "channel": 3,
//!       "t_off": [0.1, -0.1], "tot_mean": [2.5, 1.9],
//!       "walk": [[0.0, ...], [0.0, ...]] }
//!   ]
//! }
//! ```
//!
//! An entry may give the gain directly (`tot_gain`) or a measured mean Tot
//! (`tot_mean`), in which case `gain = target_tot_mean / tot_mean`. Measured
//! position and time means (`y_mean`, `t_mean`) fold into the time offsets.

use crate::address::TofAddress;
use crate::error::{Error, Result};
use crate::setup::DetectorLayout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Default number of walk bins.
pub const DEFAULT_WALK_BINS: usize = 50;
/// Default upper edge of the walk Tot range.
pub const DEFAULT_TOT_MAX: f64 = 50.0;
/// Default mean Tot targeted by the gain calibration.
pub const DEFAULT_TARGET_TOT_MEAN: f64 = 2.0;
/// Measured mean Tot below which no gain is derived.
const MIN_MEASURED_TOT_MEAN: f64 = 0.001;

/// Calibration constants of one channel, indexed by side.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelCalibration {
    pub t_off: [f64; 2],
    pub tot_gain: [f64; 2],
    pub tot_off: [f64; 2],
    pub walk: [Vec<f64>; 2],
}

impl ChannelCalibration {
    /// Constants that leave a digi untouched.
    pub fn neutral(n_walk_bins: usize) -> Self {
        Self {
            t_off: [0.0; 2],
            tot_gain: [1.0; 2],
            tot_off: [0.0; 2],
            walk: [vec![0.0; n_walk_bins], vec![0.0; n_walk_bins]],
        }
    }

    /// Copy the side 0 constants onto side 1.
    pub fn symmetrize(&mut self) {
        self.t_off[1] = self.t_off[0];
        self.tot_gain[1] = self.tot_gain[0];
        self.tot_off[1] = self.tot_off[0];
        self.walk[1] = self.walk[0].clone();
    }
}

/// Calibration tables for every channel of a layout.
#[derive(Clone, Debug)]
pub struct CalibrationTables {
    tot_min: f64,
    tot_max: f64,
    target_tot_mean: f64,
    n_walk_bins: usize,
    /// Flat channel arena, same indexing as the layout.
    channels: Vec<ChannelCalibration>,
}

impl CalibrationTables {
    /// Neutral tables with the default walk binning.
    pub fn neutral(layout: &DetectorLayout) -> Self {
        Self {
            tot_min: 0.0,
            tot_max: DEFAULT_TOT_MAX,
            target_tot_mean: DEFAULT_TARGET_TOT_MEAN,
            n_walk_bins: DEFAULT_WALK_BINS,
            channels: vec![ChannelCalibration::neutral(DEFAULT_WALK_BINS); layout.n_channels_total()],
        }
    }

    /// Neutral tables with a custom walk binning.
    pub fn with_binning(
        layout: &DetectorLayout,
        tot_min: f64,
        tot_max: f64,
        n_walk_bins: usize,
    ) -> Result<Self> {
        if !(tot_min.is_finite() && tot_max.is_finite() && tot_max > tot_min) {
            return Err(Error::Config(format!(
                "walk Tot range [{tot_min}, {tot_max}) is empty"
            )));
        }
        if n_walk_bins == 0 {
            return Err(Error::Config("walk table needs at least one bin".to_string()));
        }
        Ok(Self {
            tot_min,
            tot_max,
            target_tot_mean: DEFAULT_TARGET_TOT_MEAN,
            n_walk_bins,
            channels: vec![ChannelCalibration::neutral(n_walk_bins); layout.n_channels_total()],
        })
    }

    /// Load tables from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P, layout: &DetectorLayout) -> Result<Self> {
        let file = File::open(path)?;
        let json: JsonCalibration = serde_json::from_reader(BufReader::new(file))?;
        Self::from_json_tables(json, layout)
    }

    /// Parse tables from a JSON string.
    pub fn from_json(json: &str, layout: &DetectorLayout) -> Result<Self> {
        let json: JsonCalibration = serde_json::from_str(json)?;
        Self::from_json_tables(json, layout)
    }

    fn from_json_tables(json: JsonCalibration, layout: &DetectorLayout) -> Result<Self> {
        let mut tables = Self::with_binning(layout, json.tot_min, json.tot_max, json.n_walk_bins)?;
        tables.target_tot_mean = json.target_tot_mean;

        for entry in json.channels {
            let address = TofAddress::new(entry.sm_type, entry.sm, entry.rpc, entry.channel, 0)?;
            let Some((slot, index)) = layout.locate(address) else {
                log::warn!("calibration entry for unconfigured channel {address} ignored");
                continue;
            };
            let velocity = layout.counters()[slot].signal_velocity;
            let mut cal = ChannelCalibration::neutral(tables.n_walk_bins);

            cal.t_off = entry.t_off;
            cal.tot_off = entry.tot_off;
            if let Some(gain) = entry.tot_gain {
                cal.tot_gain = gain;
            }
            if let Some(means) = entry.tot_mean {
                for (gain, mean) in cal.tot_gain.iter_mut().zip(means) {
                    if mean > MIN_MEASURED_TOT_MEAN {
                        *gain *= tables.target_tot_mean / mean;
                    }
                }
            }
            let y_mean = entry.y_mean.unwrap_or(0.0);
            let t_mean = entry.t_mean.unwrap_or(0.0);
            cal.t_off[0] += -y_mean / velocity + t_mean;
            cal.t_off[1] += y_mean / velocity + t_mean;

            if let Some(walk) = entry.walk {
                for (side, table) in walk.into_iter().enumerate() {
                    if table.len() != tables.n_walk_bins {
                        return Err(Error::Config(format!(
                            "channel {address} side {side}: walk table has {} bins, expected {}",
                            table.len(),
                            tables.n_walk_bins
                        )));
                    }
                    cal.walk[side] = table;
                }
            }
            tables.channels[index] = cal;
        }

        tables.enforce_pad_symmetry(layout);
        Ok(tables)
    }

    /// Force identical constants on both sides of pad-like station types.
    pub fn enforce_pad_symmetry(&mut self, layout: &DetectorLayout) {
        for counter in layout.counters() {
            if !layout.is_pad_like(counter.address.sm_type) {
                continue;
            }
            for channel in 0..counter.n_channels {
                self.channels[counter.channel_index(channel)].symmetrize();
            }
        }
    }

    /// Replace the constants of one channel. Returns false if the channel is
    /// not part of the layout or the walk tables have the wrong length.
    ///
    /// Pad-like channels keep side 0 constants on both sides.
    pub fn set_channel(
        &mut self,
        layout: &DetectorLayout,
        address: TofAddress,
        mut calibration: ChannelCalibration,
    ) -> bool {
        if calibration.walk.iter().any(|w| w.len() != self.n_walk_bins) {
            return false;
        }
        let Some((_, index)) = layout.locate(address) else {
            return false;
        };
        if layout.is_pad_like(address.sm_type) {
            calibration.symmetrize();
        }
        self.channels[index] = calibration;
        true
    }

    /// Constants of the channel at flat arena `index`.
    #[inline]
    pub fn channel(&self, index: usize) -> Option<&ChannelCalibration> {
        self.channels.get(index)
    }

    /// Number of channels covered.
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn tot_min(&self) -> f64 {
        self.tot_min
    }

    #[inline]
    pub fn tot_max(&self) -> f64 {
        self.tot_max
    }

    #[inline]
    pub fn target_tot_mean(&self) -> f64 {
        self.target_tot_mean
    }

    #[inline]
    pub fn n_walk_bins(&self) -> usize {
        self.n_walk_bins
    }

    /// Walk correction for `tot`, interpolated between neighbouring bins.
    ///
    /// The bin value applies at the bin centre; outside the Tot range the
    /// edge bins are used.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn walk_correction(&self, walk: &[f64], tot: f64) -> f64 {
        let n = walk.len();
        if n == 0 {
            return 0.0;
        }
        let bin_size = (self.tot_max - self.tot_min) / n as f64;
        let position = (tot - self.tot_min) / bin_size;
        let bin = position.floor().clamp(0.0, (n - 1) as f64) as usize;
        let fraction = position - bin as f64 - 0.5;

        let mut correction = walk[bin];
        if fraction > 0.0 && bin + 1 < n {
            correction += fraction * (walk[bin + 1] - walk[bin]);
        } else if fraction < 0.0 && bin > 0 {
            correction -= fraction * (walk[bin - 1] - walk[bin]);
        }
        correction
    }
}

// Intermediate structs for the JSON schema
#[derive(Deserialize, Serialize)]
#[serde(default)]
struct JsonCalibration {
    tot_min: f64,
    tot_max: f64,
    target_tot_mean: f64,
    n_walk_bins: usize,
    channels: Vec<JsonChannel>,
}

impl Default for JsonCalibration {
    fn default() -> Self {
        Self {
            tot_min: 0.0,
            tot_max: DEFAULT_TOT_MAX,
            target_tot_mean: DEFAULT_TARGET_TOT_MEAN,
            n_walk_bins: DEFAULT_WALK_BINS,
            channels: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Default)]
#[serde(default)]
struct JsonChannel {
    sm_type: u8,
    sm: u8,
    rpc: u8,
    channel: u8,
    t_off: [f64; 2],
    tot_off: [f64; 2],
    tot_gain: Option<[f64; 2]>,
    tot_mean: Option<[f64; 2]>,
    y_mean: Option<f64>,
    t_mean: Option<f64>,
    walk: Option<[Vec<f64>; 2]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::{DetectorSetup, RpcPar, SmTypePar};
    use approx::assert_relative_eq;

    fn layout() -> DetectorLayout {
        let rpc = RpcPar::default().with_channels(4).with_signal_velocity(10.0);
        let setup = DetectorSetup::default()
            .with_sm_type(SmTypePar::uniform(1, 1, &rpc))
            .with_sm_type(SmTypePar::default())
            .with_sm_type(SmTypePar::default())
            .with_sm_type(SmTypePar::default())
            .with_sm_type(SmTypePar::default())
            .with_sm_type(SmTypePar::uniform(1, 1, &rpc.clone().with_channels(1)));
        DetectorLayout::new(&setup).unwrap()
    }

    #[test]
    fn test_neutral_tables() {
        let layout = layout();
        let tables = CalibrationTables::neutral(&layout);
        let cal = tables.channel(0).unwrap();
        assert_eq!(cal.t_off, [0.0; 2]);
        assert_eq!(cal.tot_gain, [1.0; 2]);
        assert_eq!(cal.walk[0].len(), DEFAULT_WALK_BINS);
        assert!(tables.channel(layout.n_channels_total()).is_none());
    }

    #[test]
    fn test_walk_interpolation() {
        let layout = layout();
        let tables = CalibrationTables::with_binning(&layout, 0.0, 4.0, 4).unwrap();
        let walk = [0.0, 1.0, 3.0, 3.0];
        // Bin centres reproduce the table.
        assert_relative_eq!(tables.walk_correction(&walk, 1.5), 1.0);
        // Above the centre of bin 1: towards bin 2.
        assert_relative_eq!(tables.walk_correction(&walk, 1.75), 1.5);
        // Below the centre of bin 1: towards bin 0.
        assert_relative_eq!(tables.walk_correction(&walk, 1.25), 0.75);
        // First half of the first bin and beyond the range: edge value.
        assert_relative_eq!(tables.walk_correction(&walk, 0.1), 0.0);
        assert_relative_eq!(tables.walk_correction(&walk, 10.0), 3.0);
        assert_relative_eq!(tables.walk_correction(&walk, -3.0), 0.0);
    }

    #[test]
    fn test_json_gain_and_offsets() {
        let layout = layout();
        let json = r#"{
            "target_tot_mean": 2.0,
            "n_walk_bins": 2,
            "channels": [
                { "sm_type": 0, "sm": 0, "rpc": 0, "channel": 1,
                  "t_off": [1.0, 2.0], "tot_mean": [4.0, 0.0],
                  "y_mean": 5.0, "t_mean": 0.25,
                  "walk": [[0.1, 0.2], [0.3, 0.4]] }
            ]
        }"#;
        let tables = CalibrationTables::from_json(json, &layout).unwrap();
        let cal = tables.channel(1).unwrap();
        assert_relative_eq!(cal.tot_gain[0], 0.5);
        // Measured mean below threshold keeps unit gain.
        assert_relative_eq!(cal.tot_gain[1], 1.0);
        assert_relative_eq!(cal.t_off[0], 1.0 - 0.5 + 0.25);
        assert_relative_eq!(cal.t_off[1], 2.0 + 0.5 + 0.25);
        assert_eq!(cal.walk[1], vec![0.3, 0.4]);
        assert_eq!(tables.channel(0).unwrap().walk[0], vec![0.0, 0.0]);
    }

    #[test]
    fn test_json_wrong_walk_length() {
        let layout = layout();
        let json = r#"{ "n_walk_bins": 3,
            "channels": [{ "channel": 0, "walk": [[0.0], [0.0]] }] }"#;
        assert!(matches!(
            CalibrationTables::from_json(json, &layout),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_pad_symmetry() {
        let layout = layout();
        let json = r#"{ "n_walk_bins": 1,
            "channels": [{ "sm_type": 5, "channel": 0,
                           "t_off": [0.7, -3.0], "tot_gain": [2.0, 9.0],
                           "walk": [[0.5], [7.0]] }] }"#;
        let tables = CalibrationTables::from_json(json, &layout).unwrap();
        let index = layout.counters()[1].channel_index(0);
        let cal = tables.channel(index).unwrap();
        assert_eq!(cal.t_off, [0.7, 0.7]);
        assert_eq!(cal.tot_gain, [2.0, 2.0]);
        assert_eq!(cal.walk[1], vec![0.5]);
    }

    #[test]
    fn test_set_channel_keeps_pad_symmetry() {
        let layout = layout();
        let mut tables = CalibrationTables::with_binning(&layout, 0.0, 10.0, 1).unwrap();
        let cal = ChannelCalibration {
            t_off: [0.0, 2.0],
            tot_gain: [1.0, 3.0],
            tot_off: [0.0, 0.5],
            walk: [vec![0.1], vec![0.9]],
        };
        let pad = TofAddress::new(5, 0, 0, 0, 1).unwrap();
        assert!(tables.set_channel(&layout, pad, cal.clone()));
        let stored = tables.channel(layout.counters()[1].channel_index(0)).unwrap();
        assert_eq!(stored.t_off, [0.0, 0.0]);
        assert_eq!(stored.tot_gain, [1.0, 1.0]);
        assert_eq!(stored.tot_off, [0.0, 0.0]);
        assert_eq!(stored.walk[1], vec![0.1]);

        // Strip channels keep distinct sides.
        let strip = TofAddress::new(0, 0, 0, 2, 0).unwrap();
        assert!(tables.set_channel(&layout, strip, cal.clone()));
        assert_eq!(tables.channel(2).unwrap(), &cal);
    }

    #[test]
    fn test_unknown_channel_ignored() {
        let layout = layout();
        let json = r#"{ "channels": [{ "sm_type": 3, "channel": 0 }] }"#;
        let tables = CalibrationTables::from_json(json, &layout).unwrap();
        assert_eq!(tables.channel(0).unwrap().t_off, [0.0; 2]);
    }
}
