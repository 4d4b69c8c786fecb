//! tofhit-algorithms: TOF hit reconstruction stages.
//!
//! This crate turns raw two-ended strip digis into hits:
//! - **Calibrator** - offsets, Tot gain, walk correction and channel deadtime
//! - **Digi store** - per-channel time ordered buckets
//! - **Strip pairing** - one digi per strip end into a strip hit
//! - **Cluster builder** - adjacent strip hits into one Tot-weighted hit
//! - **Merger** - hits of neighbouring pad counters into one
//! - **History** - bounded per-channel record of emitted hits
//!
//! [`TofClusterizer`] runs all stages on one processing unit at a time; its
//! mutable state lives in a separate [`ClusterizerState`].

pub mod calibrator;
pub mod cluster;
mod clusterizer;
pub mod history;
pub mod merge;
pub mod pairing;
pub mod store;

pub use calibrator::{Calibrator, CalibratorConfig};
pub use cluster::{build_counter_clusters, Cluster};
pub use clusterizer::{ClusterizerConfig, ClusterizerState, TofClusterizer, UnitOutput};
pub use history::HitHistory;
pub use merge::merge_hits;
pub use pairing::{next_strip_hit, take_matching_pair, ClusterWindow, StripGeometry, StripHit};
pub use store::{DigiStore, StoredDigi};

pub use tofhit_core::ClusterizerStatistics;
