//! tofhit-io: digi input and hit output files.
//!
//! Digis are read from CSV files, one row per digi, grouped into processing
//! units. Hits and their digi match records are written as CSV or as
//! fixed-size little-endian binary records.
//!

mod error;
mod reader;
mod writer;

pub use error::{Error, Result};
pub use reader::{DigiFileSummary, DigiReader, DIGI_CSV_HEADER};
pub use writer::{HitWriter, HIT_RECORD_SIZE};
