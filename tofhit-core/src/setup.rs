//! Detector setup and the flattened counter layout.
//!
//! [`DetectorSetup`] is the user-facing description (loaded from JSON).
//! [`DetectorLayout`] is computed from it once: every counter (one RPC of one
//! module) gets a flat slot index, its resolved parameters and an offset into
//! a flat channel arena.
//!
//! # JSON schema
//!
//! ```json
//! {
//!   "max_time_dist": 0.2,
//!   "max_space_dist": 0.5,
//!   "beam_counter_type": 5,
//!   "pad_like_types": [5, 8],
//!   "sm_types": [
//!     {
//!       "n_sm": 2,
//!       "rpcs": [{ "n_channels": 32, "layout": "vertical_strip",
//!                  "signal_velocity": 16.0, "cell_size_x": 1.0, "cell_size_y": 27.0 }],
//!       "counters": [{ "sm": 1, "rpc": 0, "dead_strips": 4,
//!                      "transform": { "rotation": [[1,0,0],[0,1,0],[0,0,1]],
//!                                     "translation": [0, 0, 400] } }]
//!     }
//!   ]
//! }
//! ```

use crate::address::{TofAddress, MAX_CHANNEL, MAX_RPC, MAX_SM, MAX_SM_TYPE};
use crate::error::{Error, Result};
use crate::geometry::{Geometry, RpcTransform};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Default station type of the beam (start) counter.
pub const DEFAULT_BEAM_COUNTER_TYPE: u8 = 5;
/// Default station types whose two sides are physically symmetric.
pub const DEFAULT_PAD_LIKE_TYPES: [u8; 2] = [5, 8];

/// How the channels of a counter are read out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    /// Strips along y, read out at both ends; channels step along x.
    #[default]
    VerticalStrip,
    /// Strips along x, read out at both ends; channels step along y.
    HorizontalStrip,
    /// Single-ended pads. Not supported by the cluster builder.
    Pad,
}

/// Parameters shared by one RPC index of every module of a station type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcPar {
    pub n_channels: u8,
    pub layout: ChannelLayout,
    /// Signal propagation velocity along the strip (cm/ns).
    pub signal_velocity: f64,
    /// Channel size along x (cm).
    pub cell_size_x: f64,
    /// Channel size along y (cm).
    pub cell_size_y: f64,
    /// Overrides the setup-wide time correlation window.
    pub max_time_dist: Option<f64>,
    /// Overrides the setup-wide space correlation window.
    pub max_space_dist: Option<f64>,
}

impl Default for RpcPar {
    fn default() -> Self {
        Self {
            n_channels: 32,
            layout: ChannelLayout::VerticalStrip,
            signal_velocity: 16.0,
            cell_size_x: 1.0,
            cell_size_y: 27.0,
            max_time_dist: None,
            max_space_dist: None,
        }
    }
}

impl RpcPar {
    #[must_use]
    pub fn with_channels(mut self, n_channels: u8) -> Self {
        self.n_channels = n_channels;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn with_signal_velocity(mut self, velocity: f64) -> Self {
        self.signal_velocity = velocity;
        self
    }

    #[must_use]
    pub fn with_cell_size(mut self, x: f64, y: f64) -> Self {
        self.cell_size_x = x;
        self.cell_size_y = y;
        self
    }

    #[must_use]
    pub fn with_windows(mut self, max_time_dist: f64, max_space_dist: f64) -> Self {
        self.max_time_dist = Some(max_time_dist);
        self.max_space_dist = Some(max_space_dist);
        self
    }
}

/// Per-counter overrides (one RPC of one module).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterPar {
    pub sm: u8,
    pub rpc: u8,
    pub signal_velocity: Option<f64>,
    /// Bit `c` set marks channel `c` as dead.
    pub dead_strips: u64,
    pub transform: RpcTransform,
}

/// One station type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmTypePar {
    /// Number of modules of this type.
    pub n_sm: u8,
    /// Parameters per RPC index.
    pub rpcs: Vec<RpcPar>,
    pub counters: Vec<CounterPar>,
}

impl SmTypePar {
    /// `n_sm` modules with `n_rpc` identical RPCs each.
    pub fn uniform(n_sm: u8, n_rpc: u8, rpc: &RpcPar) -> Self {
        Self {
            n_sm,
            rpcs: vec![rpc.clone(); usize::from(n_rpc)],
            counters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_counter(mut self, counter: CounterPar) -> Self {
        self.counters.push(counter);
        self
    }
}

/// Static description of the TOF wall.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSetup {
    /// Time correlation window (ns).
    pub max_time_dist: f64,
    /// Space correlation window (cm). Derived from the time window and the
    /// signal velocity when absent.
    pub max_space_dist: Option<f64>,
    pub beam_counter_type: u8,
    pub pad_like_types: Vec<u8>,
    /// Station types, indexed by `sm_type`.
    pub sm_types: Vec<SmTypePar>,
}

impl Default for DetectorSetup {
    fn default() -> Self {
        Self {
            max_time_dist: 1.0,
            max_space_dist: None,
            beam_counter_type: DEFAULT_BEAM_COUNTER_TYPE,
            pad_like_types: DEFAULT_PAD_LIKE_TYPES.to_vec(),
            sm_types: Vec::new(),
        }
    }
}

impl DetectorSetup {
    /// Load a setup from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Parse a setup from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Append a station type; its `sm_type` is its position.
    #[must_use]
    pub fn with_sm_type(mut self, sm_type: SmTypePar) -> Self {
        self.sm_types.push(sm_type);
        self
    }

    #[must_use]
    pub fn with_windows(mut self, max_time_dist: f64, max_space_dist: f64) -> Self {
        self.max_time_dist = max_time_dist;
        self.max_space_dist = Some(max_space_dist);
        self
    }
}

/// Fully resolved parameters of one counter.
#[derive(Clone, Debug, PartialEq)]
pub struct CounterLayout {
    /// Flat index of the counter.
    pub slot: usize,
    /// Counter identity (channel and side zero).
    pub address: TofAddress,
    pub n_channels: u8,
    pub layout: ChannelLayout,
    pub signal_velocity: f64,
    pub cell_size_x: f64,
    pub cell_size_y: f64,
    pub max_time_dist: f64,
    pub max_space_dist: f64,
    pub dead_strips: u64,
    pub transform: RpcTransform,
    /// Offset of channel 0 in the flat channel arena.
    pub first_channel: usize,
}

impl CounterLayout {
    /// Whether the channel is masked as dead.
    #[inline]
    pub fn is_dead(&self, channel: u8) -> bool {
        channel < 64 && self.dead_strips & (1u64 << channel) != 0
    }

    /// Channel pitch across the strips.
    pub fn pitch(&self) -> f64 {
        match self.layout {
            ChannelLayout::HorizontalStrip => self.cell_size_y,
            ChannelLayout::VerticalStrip | ChannelLayout::Pad => self.cell_size_x,
        }
    }

    /// Physical strip length.
    pub fn strip_length(&self) -> f64 {
        match self.layout {
            ChannelLayout::HorizontalStrip => self.cell_size_x,
            ChannelLayout::VerticalStrip | ChannelLayout::Pad => self.cell_size_y,
        }
    }

    /// Local coordinate of the centre of `channel` across the strips.
    pub fn across_position(&self, channel: u8) -> f64 {
        let offset = i32::from(channel) - i32::from(self.n_channels / 2);
        (f64::from(offset) + 0.5) * self.pitch()
    }

    /// Channel whose area contains the local `across` coordinate, clamped to
    /// the counter.
    #[allow(clippy::cast_possible_truncation)]
    pub fn representative_channel(&self, across: f64) -> u8 {
        let last = i64::from(self.n_channels.saturating_sub(1));
        let raw = (across / self.pitch()).floor();
        let channel = if raw.is_finite() {
            (raw as i64 + i64::from(self.n_channels / 2)).clamp(0, last)
        } else {
            0
        };
        u8::try_from(channel).unwrap_or(0)
    }

    /// Local 3D position from the along- and across-strip coordinates.
    pub fn local_position(&self, along: f64, across: f64) -> [f64; 3] {
        match self.layout {
            ChannelLayout::HorizontalStrip => [along, across, 0.0],
            ChannelLayout::VerticalStrip | ChannelLayout::Pad => [across, along, 0.0],
        }
    }

    /// Flat arena index of `channel`.
    #[inline]
    pub fn channel_index(&self, channel: u8) -> usize {
        self.first_channel + usize::from(channel)
    }

    /// Address of `channel`, side 0.
    #[inline]
    pub fn channel_address(&self, channel: u8) -> TofAddress {
        TofAddress {
            channel,
            ..self.address
        }
    }
}

/// Flattened, validated view of a [`DetectorSetup`].
#[derive(Clone, Debug)]
pub struct DetectorLayout {
    counters: Vec<CounterLayout>,
    /// First slot of each station type.
    type_offsets: Vec<usize>,
    n_sm: Vec<u8>,
    n_rpc: Vec<u8>,
    n_channels_total: usize,
    beam_counter_type: u8,
    pad_like_types: Vec<u8>,
}

impl DetectorLayout {
    /// Validate `setup` and compute the flat layout.
    pub fn new(setup: &DetectorSetup) -> Result<Self> {
        if !(setup.max_time_dist.is_finite() && setup.max_time_dist > 0.0) {
            return Err(Error::Config(format!(
                "max_time_dist must be positive, got {}",
                setup.max_time_dist
            )));
        }
        if let Some(space) = setup.max_space_dist {
            check_positive("max_space_dist", space)?;
        }
        if setup.sm_types.len() > usize::from(MAX_SM_TYPE) + 1 {
            return Err(Error::Config(format!(
                "{} station types configured, at most {} addressable",
                setup.sm_types.len(),
                usize::from(MAX_SM_TYPE) + 1
            )));
        }

        let mut counters = Vec::new();
        let mut type_offsets = Vec::with_capacity(setup.sm_types.len());
        let mut n_sm = Vec::with_capacity(setup.sm_types.len());
        let mut n_rpc = Vec::with_capacity(setup.sm_types.len());
        let mut first_channel = 0;

        for (sm_type, type_par) in setup.sm_types.iter().enumerate() {
            let sm_type = u8::try_from(sm_type)
                .map_err(|_| Error::Config("station type index overflow".to_string()))?;
            if usize::from(type_par.n_sm) > usize::from(MAX_SM) + 1 {
                return Err(Error::Config(format!(
                    "type {sm_type}: {} modules exceed the address range",
                    type_par.n_sm
                )));
            }
            let rpc_count = u8::try_from(type_par.rpcs.len())
                .ok()
                .filter(|&n| n <= MAX_RPC + 1)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "type {sm_type}: {} RPCs exceed the address range",
                        type_par.rpcs.len()
                    ))
                })?;
            for (rpc, par) in type_par.rpcs.iter().enumerate() {
                validate_rpc(sm_type, rpc, par)?;
            }
            for counter in &type_par.counters {
                if counter.sm >= type_par.n_sm || counter.rpc >= rpc_count {
                    return Err(Error::Config(format!(
                        "type {sm_type}: counter override for sm {} rpc {} outside {}x{}",
                        counter.sm, counter.rpc, type_par.n_sm, rpc_count
                    )));
                }
            }

            type_offsets.push(counters.len());
            n_sm.push(type_par.n_sm);
            n_rpc.push(rpc_count);

            for sm in 0..type_par.n_sm {
                for (rpc, par) in (0..rpc_count).zip(&type_par.rpcs) {
                    let mut overrides = type_par
                        .counters
                        .iter()
                        .filter(|c| c.sm == sm && c.rpc == rpc);
                    let counter_par = overrides.next();
                    if overrides.next().is_some() {
                        return Err(Error::Config(format!(
                            "type {sm_type}: duplicate counter override for sm {sm} rpc {rpc}"
                        )));
                    }

                    let signal_velocity = counter_par
                        .and_then(|c| c.signal_velocity)
                        .unwrap_or(par.signal_velocity);
                    check_positive("signal_velocity", signal_velocity)?;
                    let max_time_dist = par.max_time_dist.unwrap_or(setup.max_time_dist);
                    check_positive("max_time_dist", max_time_dist)?;
                    let max_space_dist = par
                        .max_space_dist
                        .or(setup.max_space_dist)
                        .unwrap_or(max_time_dist * signal_velocity * 0.5);
                    check_positive("max_space_dist", max_space_dist)?;

                    let transform = counter_par
                        .map(|c| c.transform.clone())
                        .unwrap_or_default();
                    transform.validate().map_err(|e| {
                        Error::Config(format!("type {sm_type} sm {sm} rpc {rpc}: {e}"))
                    })?;

                    let dead_strips = counter_par.map_or(0, |c| c.dead_strips);
                    if par.n_channels < 64 && dead_strips >> par.n_channels != 0 {
                        log::warn!(
                            "type {sm_type} sm {sm} rpc {rpc}: dead strip mask 0x{dead_strips:x} \
                             names channels beyond {}",
                            par.n_channels
                        );
                    }

                    counters.push(CounterLayout {
                        slot: counters.len(),
                        address: TofAddress::new(sm_type, sm, rpc, 0, 0)?,
                        n_channels: par.n_channels,
                        layout: par.layout,
                        signal_velocity,
                        cell_size_x: par.cell_size_x,
                        cell_size_y: par.cell_size_y,
                        max_time_dist,
                        max_space_dist,
                        dead_strips,
                        transform,
                        first_channel,
                    });
                    first_channel += usize::from(par.n_channels);
                }
            }
        }

        Ok(Self {
            counters,
            type_offsets,
            n_sm,
            n_rpc,
            n_channels_total: first_channel,
            beam_counter_type: setup.beam_counter_type,
            pad_like_types: setup.pad_like_types.clone(),
        })
    }

    /// All counters in slot order.
    #[inline]
    pub fn counters(&self) -> &[CounterLayout] {
        &self.counters
    }

    /// Counter at `slot`.
    #[inline]
    pub fn counter(&self, slot: usize) -> Option<&CounterLayout> {
        self.counters.get(slot)
    }

    /// Number of counters.
    #[inline]
    pub fn n_counters(&self) -> usize {
        self.counters.len()
    }

    /// Total number of channels over all counters.
    #[inline]
    pub fn n_channels_total(&self) -> usize {
        self.n_channels_total
    }

    /// Number of configured station types.
    #[inline]
    pub fn n_types(&self) -> usize {
        self.type_offsets.len()
    }

    /// Number of modules of `sm_type` (0 when not configured).
    pub fn n_sm(&self, sm_type: u8) -> u8 {
        self.n_sm.get(usize::from(sm_type)).copied().unwrap_or(0)
    }

    /// Number of RPCs per module of `sm_type` (0 when not configured).
    pub fn n_rpc(&self, sm_type: u8) -> u8 {
        self.n_rpc.get(usize::from(sm_type)).copied().unwrap_or(0)
    }

    /// Slot of the counter containing `address`, if it is configured.
    pub fn slot(&self, address: TofAddress) -> Option<usize> {
        let t = usize::from(address.sm_type);
        let offset = *self.type_offsets.get(t)?;
        let (n_sm, n_rpc) = (self.n_sm[t], self.n_rpc[t]);
        if address.sm >= n_sm || address.rpc >= n_rpc {
            return None;
        }
        Some(offset + usize::from(address.sm) * usize::from(n_rpc) + usize::from(address.rpc))
    }

    /// Slot and flat channel index of `address`, if the channel and side are
    /// valid for the configured counter.
    pub fn locate(&self, address: TofAddress) -> Option<(usize, usize)> {
        let slot = self.slot(address)?;
        let counter = &self.counters[slot];
        if address.channel >= counter.n_channels || address.side > 1 {
            return None;
        }
        Some((slot, counter.channel_index(address.channel)))
    }

    #[inline]
    pub fn beam_counter_type(&self) -> u8 {
        self.beam_counter_type
    }

    #[inline]
    pub fn is_beam_counter(&self, sm_type: u8) -> bool {
        sm_type == self.beam_counter_type
    }

    /// Whether both sides of `sm_type` channels are physically symmetric.
    #[inline]
    pub fn is_pad_like(&self, sm_type: u8) -> bool {
        self.pad_like_types.contains(&sm_type)
    }
}

impl Geometry for DetectorLayout {
    fn to_global(&self, counter: TofAddress, local: [f64; 3]) -> [f64; 3] {
        match self.slot(counter) {
            Some(slot) => self.counters[slot].transform.apply(local),
            None => local,
        }
    }
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be positive, got {value}")))
    }
}

fn validate_rpc(sm_type: u8, rpc: usize, par: &RpcPar) -> Result<()> {
    if par.n_channels == 0 || par.n_channels > MAX_CHANNEL + 1 {
        return Err(Error::Config(format!(
            "type {sm_type} rpc {rpc}: {} channels outside 1..={}",
            par.n_channels,
            u16::from(MAX_CHANNEL) + 1
        )));
    }
    check_positive("signal_velocity", par.signal_velocity)?;
    check_positive("cell_size_x", par.cell_size_x)?;
    check_positive("cell_size_y", par.cell_size_y)?;
    if let Some(t) = par.max_time_dist {
        check_positive("max_time_dist", t)?;
    }
    if let Some(s) = par.max_space_dist {
        check_positive("max_space_dist", s)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_type_setup() -> DetectorSetup {
        DetectorSetup::default()
            .with_sm_type(SmTypePar::uniform(2, 3, &RpcPar::default().with_channels(4)))
            .with_sm_type(SmTypePar::uniform(1, 1, &RpcPar::default().with_channels(8)))
    }

    #[test]
    fn test_slots_follow_type_module_rpc_order() {
        let layout = DetectorLayout::new(&two_type_setup()).unwrap();
        assert_eq!(layout.n_counters(), 7);
        assert_eq!(layout.n_channels_total(), 6 * 4 + 8);
        let addr = TofAddress::new(0, 1, 2, 0, 0).unwrap();
        assert_eq!(layout.slot(addr), Some(5));
        let addr = TofAddress::new(1, 0, 0, 7, 1).unwrap();
        assert_eq!(layout.locate(addr), Some((6, 24 + 7)));
        assert_eq!(layout.counter(6).unwrap().address.sm_type, 1);
    }

    #[test]
    fn test_out_of_range_addresses() {
        let layout = DetectorLayout::new(&two_type_setup()).unwrap();
        assert_eq!(layout.slot(TofAddress::new(2, 0, 0, 0, 0).unwrap()), None);
        assert_eq!(layout.slot(TofAddress::new(0, 2, 0, 0, 0).unwrap()), None);
        assert_eq!(layout.slot(TofAddress::new(0, 0, 3, 0, 0).unwrap()), None);
        assert_eq!(layout.locate(TofAddress::new(0, 0, 0, 4, 0).unwrap()), None);
    }

    #[test]
    fn test_space_window_derived_from_velocity() {
        let setup = DetectorSetup {
            max_time_dist: 0.4,
            ..DetectorSetup::default()
        }
        .with_sm_type(SmTypePar::uniform(
            1,
            1,
            &RpcPar::default().with_signal_velocity(15.0),
        ));
        let layout = DetectorLayout::new(&setup).unwrap();
        let counter = &layout.counters()[0];
        assert_relative_eq!(counter.max_time_dist, 0.4);
        assert_relative_eq!(counter.max_space_dist, 0.4 * 15.0 * 0.5);
    }

    #[test]
    fn test_channel_geometry() {
        let setup = DetectorSetup::default().with_sm_type(SmTypePar::uniform(
            1,
            1,
            &RpcPar::default().with_channels(4).with_cell_size(2.0, 20.0),
        ));
        let layout = DetectorLayout::new(&setup).unwrap();
        let counter = &layout.counters()[0];
        assert_relative_eq!(counter.across_position(0), -3.0);
        assert_relative_eq!(counter.across_position(3), 3.0);
        assert_eq!(counter.representative_channel(-3.0), 0);
        assert_eq!(counter.representative_channel(0.0), 2);
        assert_eq!(counter.representative_channel(-0.1), 1);
        assert_eq!(counter.representative_channel(100.0), 3);
        assert_eq!(counter.representative_channel(-100.0), 0);
        assert_eq!(counter.local_position(5.0, 1.0), [1.0, 5.0, 0.0]);
    }

    #[test]
    fn test_counter_overrides() {
        let setup = DetectorSetup::default().with_sm_type(
            SmTypePar::uniform(2, 1, &RpcPar::default()).with_counter(CounterPar {
                sm: 1,
                rpc: 0,
                signal_velocity: Some(12.0),
                dead_strips: 0b101,
                transform: RpcTransform::translation(0.0, 0.0, 500.0),
            }),
        );
        let layout = DetectorLayout::new(&setup).unwrap();
        let counter = &layout.counters()[1];
        assert_relative_eq!(counter.signal_velocity, 12.0);
        assert!(counter.is_dead(0));
        assert!(!counter.is_dead(1));
        assert!(counter.is_dead(2));
        let global = layout.to_global(counter.address, [1.0, 2.0, 0.0]);
        assert_eq!(global, [1.0, 2.0, 500.0]);
        assert!(!layout.counters()[0].is_dead(0));
    }

    #[test]
    fn test_invalid_setups_rejected() {
        let bad_override = DetectorSetup::default().with_sm_type(
            SmTypePar::uniform(1, 1, &RpcPar::default()).with_counter(CounterPar {
                sm: 3,
                ..CounterPar::default()
            }),
        );
        assert!(DetectorLayout::new(&bad_override).is_err());

        let too_many_channels = DetectorSetup::default().with_sm_type(SmTypePar::uniform(
            1,
            1,
            &RpcPar::default().with_channels(65),
        ));
        assert!(DetectorLayout::new(&too_many_channels).is_err());

        let zero_velocity = DetectorSetup::default().with_sm_type(SmTypePar::uniform(
            1,
            1,
            &RpcPar::default().with_signal_velocity(0.0),
        ));
        assert!(DetectorLayout::new(&zero_velocity).is_err());
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{
            "max_time_dist": 0.2,
            "max_space_dist": 0.5,
            "sm_types": [
                { "n_sm": 1,
                  "rpcs": [{ "n_channels": 16, "layout": "horizontal_strip",
                             "signal_velocity": 0.5, "cell_size_x": 20.0, "cell_size_y": 3.0 }] }
            ]
        }"#;
        let setup = DetectorSetup::from_json(json).unwrap();
        assert_eq!(setup.beam_counter_type, 5);
        assert_eq!(setup.pad_like_types, vec![5, 8]);
        let layout = DetectorLayout::new(&setup).unwrap();
        let counter = &layout.counters()[0];
        assert_eq!(counter.layout, ChannelLayout::HorizontalStrip);
        assert_relative_eq!(counter.pitch(), 3.0);
        assert_relative_eq!(counter.strip_length(), 20.0);
        assert_relative_eq!(counter.max_space_dist, 0.5);
        assert!(counter.transform == RpcTransform::identity());
    }
}
