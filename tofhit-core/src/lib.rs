//! tofhit-core: core types for time-of-flight hit reconstruction.
//!
//! This crate provides the data model shared by the reconstruction stages:
//! detector addresses, digis, hits and their digi match records, the
//! detector setup with its flattened counter layout, per-channel
//! calibration tables and the geometry abstraction.
//!

pub mod address;
pub mod calibration;
pub mod digi;
pub mod error;
pub mod geometry;
pub mod hit;
pub mod setup;
pub mod statistics;

pub use address::TofAddress;
pub use calibration::{CalibrationTables, ChannelCalibration};
pub use digi::{Digi, ProcessingUnit};
pub use error::{Error, Result};
pub use geometry::{Geometry, RpcTransform};
pub use hit::{DigiLink, DigiMatch, TofHit};
pub use setup::{ChannelLayout, CounterLayout, CounterPar, DetectorLayout, DetectorSetup, RpcPar, SmTypePar};
pub use statistics::ClusterizerStatistics;
