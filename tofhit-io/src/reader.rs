//! CSV digi reader.
//!
//! Format: a header line followed by one row per digi,
//!
//! ```text
//! unit,sm_type,sm,rpc,channel,side,time,tot
//! 0,0,0,1,5,0,10.0,5.0
//! ```
//!
//! Columns are matched by name and may come in any order. Lines starting with
//! `#` are comments, blank lines and whitespace around fields are ignored.
//! Rows are grouped into processing units by the `unit` column, in order of
//! first appearance; rows of one unit need not be contiguous. Rows whose
//! address does not fit the TOF address layout are skipped and counted.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tofhit_core::{Digi, ProcessingUnit, TofAddress};

/// Expected header of a digi file.
pub const DIGI_CSV_HEADER: &str = "unit,sm_type,sm,rpc,channel,side,time,tot";

/// One row of a digi file.
///
/// Address fields are read wider than the packed layout so that oversized
/// values end up as skipped rows rather than syntax errors.
#[derive(Debug, Deserialize)]
struct DigiRow {
    unit: u64,
    sm_type: u32,
    sm: u32,
    rpc: u32,
    channel: u32,
    side: u32,
    time: f64,
    tot: f64,
}

impl DigiRow {
    fn address(&self) -> Option<TofAddress> {
        let narrow = |v: u32| u8::try_from(v).ok();
        TofAddress::new(
            narrow(self.sm_type)?,
            narrow(self.sm)?,
            narrow(self.rpc)?,
            narrow(self.channel)?,
            narrow(self.side)?,
        )
        .ok()
    }
}

/// Reader for CSV digi files.
pub struct DigiReader<R> {
    reader: csv::Reader<R>,
    path: Option<PathBuf>,
    skipped_rows: usize,
}

impl DigiReader<File> {
    /// Opens a digi file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let mut reader = Self::from_reader(file);
        reader.path = Some(path.as_ref().to_path_buf());
        Ok(reader)
    }
}

impl<R: Read> DigiReader<R> {
    /// Wraps any reader.
    pub fn from_reader(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);
        Self {
            reader,
            path: None,
            skipped_rows: 0,
        }
    }

    /// Path of the underlying file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rows skipped so far for an out-of-range address.
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    /// Reads the remaining input and groups it into processing units.
    ///
    /// # Errors
    /// Returns [`Error::Parse`] when a header column is missing and
    /// [`Error::Csv`] for a malformed row (wrong column count, unparsable
    /// value); the CSV error carries the line number.
    pub fn read_units(&mut self) -> Result<Vec<ProcessingUnit>> {
        let headers = self.reader.headers()?.clone();
        if headers.is_empty() {
            log::warn!("digi input without header, no units read");
            return Ok(Vec::new());
        }
        check_header(&headers)?;

        let mut units: Vec<ProcessingUnit> = Vec::new();
        let mut positions: HashMap<u64, usize> = HashMap::new();
        let mut record = csv::StringRecord::new();

        while self.reader.read_record(&mut record)? {
            let row: DigiRow = record.deserialize(Some(&headers))?;
            let Some(address) = row.address() else {
                log::warn!(
                    "line {}: address {}/{}/{}/{}/{} out of range, row skipped",
                    record.position().map_or(0, csv::Position::line),
                    row.sm_type,
                    row.sm,
                    row.rpc,
                    row.channel,
                    row.side
                );
                self.skipped_rows += 1;
                continue;
            };

            let position = *positions.entry(row.unit).or_insert_with(|| {
                units.push(ProcessingUnit::new(row.unit));
                units.len() - 1
            });
            units[position].digis.push(Digi::new(address, row.time, row.tot));
        }

        log::debug!(
            "read {} digis in {} units, {} rows skipped",
            units.iter().map(ProcessingUnit::len).sum::<usize>(),
            units.len(),
            self.skipped_rows
        );
        Ok(units)
    }
}

fn check_header(headers: &csv::StringRecord) -> Result<()> {
    let missing: Vec<&str> = DIGI_CSV_HEADER
        .split(',')
        .filter(|column| !headers.iter().any(|h| h == *column))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::Parse {
        line: headers.position().map_or(1, csv::Position::line),
        message: format!(
            "missing column(s) {}, expected header `{DIGI_CSV_HEADER}`",
            missing.join(", ")
        ),
    })
}

/// Overview of a digi file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DigiFileSummary {
    pub n_units: usize,
    pub n_digis: usize,
    pub max_unit_size: usize,
    /// Earliest and latest digi time, if any digi is present.
    pub time_range: Option<(f64, f64)>,
    /// Digi count per station type.
    pub per_type: BTreeMap<u8, usize>,
    /// Digi count per side.
    pub per_side: [usize; 2],
}

impl DigiFileSummary {
    pub fn from_units(units: &[ProcessingUnit]) -> Self {
        let mut summary = Self {
            n_units: units.len(),
            ..Self::default()
        };
        for unit in units {
            summary.n_digis += unit.len();
            summary.max_unit_size = summary.max_unit_size.max(unit.len());
            for digi in &unit.digis {
                *summary.per_type.entry(digi.address.sm_type).or_default() += 1;
                summary.per_side[usize::from(digi.side().min(1))] += 1;
                summary.time_range = Some(match summary.time_range {
                    Some((lo, hi)) => (lo.min(digi.time), hi.max(digi.time)),
                    None => (digi.time, digi.time),
                });
            }
        }
        summary
    }
}

impl fmt::Display for DigiFileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "units:          {}", self.n_units)?;
        writeln!(f, "digis:          {}", self.n_digis)?;
        writeln!(f, "largest unit:   {}", self.max_unit_size)?;
        if let Some((lo, hi)) = self.time_range {
            writeln!(f, "time range:     {lo:.3} .. {hi:.3} ns")?;
        }
        writeln!(
            f,
            "sides:          {} / {}",
            self.per_side[0], self.per_side[1]
        )?;
        for (sm_type, count) in &self.per_type {
            writeln!(f, "  type {sm_type:>2}:      {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    const SAMPLE: &str = "\
# test run
unit,sm_type,sm,rpc,channel,side,time,tot
0,0,0,1,5,0,10.0,5.0
0,0,0,1,5,1,10.2,6.0

7,5,0,0,0,0,3.5,1.0
# late row of unit 0
0,0,1,0,2,0,11.0,2.0
";

    #[test]
    fn test_read_units_groups_by_first_appearance() {
        let units = DigiReader::from_reader(Cursor::new(SAMPLE)).read_units().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, 0);
        assert_eq!(units[0].len(), 3);
        assert_eq!(units[1].id, 7);
        assert_eq!(units[1].len(), 1);

        let d = units[0].digis[1];
        assert_eq!(d.address, TofAddress::new(0, 0, 1, 5, 1).unwrap());
        assert!((d.time - 10.2).abs() < 1e-12);
        assert!((d.tot - 6.0).abs() < 1e-12);
        assert_eq!(units[0].digis[2].address.sm, 1);
    }

    #[test]
    fn test_open_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let mut reader = DigiReader::open(file.path()).unwrap();
        assert_eq!(reader.path(), Some(file.path()));
        assert_eq!(reader.read_units().unwrap().len(), 2);
    }

    #[test]
    fn test_columns_by_name_with_spaces() {
        let input = "tot, time, side, channel, rpc, sm, sm_type, unit\n 4.0 , 2.5, 1, 3, 0, 0, 0, 9\n";
        let units = DigiReader::from_reader(Cursor::new(input)).read_units().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, 9);
        let d = units[0].digis[0];
        assert_eq!(d.address, TofAddress::new(0, 0, 0, 3, 1).unwrap());
        assert!((d.time - 2.5).abs() < 1e-12);
        assert!((d.tot - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_header() {
        let err = DigiReader::from_reader(Cursor::new("0,0,0,0,0,0,1.0,1.0\n"))
            .read_units()
            .unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));

        let units = DigiReader::from_reader(Cursor::new("")).read_units().unwrap();
        assert!(units.is_empty());
    }

    fn csv_error_line(err: &Error) -> Option<u64> {
        match err {
            Error::Csv(e) => e.position().map(csv::Position::line),
            _ => None,
        }
    }

    #[test]
    fn test_bad_rows_report_line() {
        let input = format!("{DIGI_CSV_HEADER}\n0,0,0,0,0,0,1.0\n");
        let err = DigiReader::from_reader(Cursor::new(input)).read_units().unwrap_err();
        assert_eq!(csv_error_line(&err), Some(2));

        let input = format!("{DIGI_CSV_HEADER}\n0,0,0,0,0,0,1.0,1.0\n0,0,0,0,0,0,abc,1.0\n");
        let err = DigiReader::from_reader(Cursor::new(input)).read_units().unwrap_err();
        assert_eq!(csv_error_line(&err), Some(3));
    }

    #[test]
    fn test_out_of_range_address_skipped() {
        let input = format!(
            "{DIGI_CSV_HEADER}\n0,0,0,1,5,0,10.0,5.0\n0,20,0,0,0,0,1.0,1.0\n1,0,0,1,5,1,10.2,6.0\n2,0,300,0,0,0,1.0,1.0\n"
        );
        let mut reader = DigiReader::from_reader(Cursor::new(input));
        let units = reader.read_units().unwrap();
        assert_eq!(reader.skipped_rows(), 2);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].len(), 1);
        assert_eq!(units[1].id, 1);
        assert_eq!(units[1].digis[0].side(), 1);
    }

    #[test]
    fn test_summary() {
        let units = DigiReader::from_reader(Cursor::new(SAMPLE)).read_units().unwrap();
        let summary = DigiFileSummary::from_units(&units);
        assert_eq!(summary.n_units, 2);
        assert_eq!(summary.n_digis, 4);
        assert_eq!(summary.max_unit_size, 3);
        assert_eq!(summary.time_range, Some((3.5, 11.0)));
        assert_eq!(summary.per_type.get(&0), Some(&3));
        assert_eq!(summary.per_type.get(&5), Some(&1));
        assert_eq!(summary.per_side, [3, 1]);
        assert!(summary.to_string().contains("digis:          4"));
    }
}
