//! Error types for tofhit-core.

use thiserror::Error;

/// Result type alias for tofhit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
///
/// Only conditions that must terminate a processing unit are represented here.
/// Recoverable conditions (digis outside the configured layout, readout
/// anomalies, deadtime) are counted in
/// [`ClusterizerStatistics`](crate::ClusterizerStatistics) instead.
#[derive(Error, Debug)]
pub enum Error {
    /// An address field does not fit into its bit width.
    #[error("invalid TOF address: {field}={value} exceeds {max}")]
    InvalidAddress {
        field: &'static str,
        value: u32,
        max: u32,
    },

    /// A packed address does not belong to the TOF system.
    #[error("packed address 0x{0:08x} does not carry the TOF system id")]
    ForeignAddress(u32),

    /// Detector setup or calibration table is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Clustering was requested on a counter whose channel layout is not
    /// supported.
    #[error("unsupported channel layout on counter (type {sm_type}, sm {sm}, rpc {rpc}): pad readout cannot be clustered")]
    UnsupportedChannelLayout { sm_type: u8, sm: u8, rpc: u8 },

    /// Calibrated digis failed the ordering check after sorting.
    #[error("calibrated digis not time ordered at index {index}")]
    UnsortedDigis { index: usize },

    /// A digi match refers to a digi that does not exist.
    #[error("digi index {index} out of range for {len} calibrated digis")]
    InvalidDigiIndex { index: usize, len: usize },

    /// Bounded hit history bookkeeping is inconsistent.
    #[error("hit history mismatch: {0}")]
    HistoryMismatch(String),

    /// I/O error while loading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error while loading a configuration file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
