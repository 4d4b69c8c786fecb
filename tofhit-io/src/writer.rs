//! Hit and digi match writers.

use crate::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tofhit_core::{DigiMatch, TofHit};

/// Size of one binary hit record in bytes.
///
/// Layout: u64 (unit) + u32 (packed address) + 3 x f64 (x, y, z) + f64 (time)
/// + f64 (tot) + u32 (n_digis), little endian.
pub const HIT_RECORD_SIZE: usize = 56;

const HITS_HEADER: &str = "unit,hit,sm_type,sm,rpc,channel,x,y,z,dx,dy,dz,time,tot,n_digis";
const MATCHES_HEADER: &str = "unit,hit,digi,weight";

/// Writer for reconstructed hits and their match records.
///
/// Output is appended unit by unit; CSV headers are written before the first
/// rows. One writer handles one table.
pub struct HitWriter<W: Write = BufWriter<File>> {
    writer: W,
    header_written: bool,
}

impl HitWriter {
    /// Creates a new file writer.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W: Write> HitWriter<W> {
    /// Wraps any writer.
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    fn header(&mut self, header: &str) -> Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{header}")?;
            self.header_written = true;
        }
        Ok(())
    }

    /// Writes the hits of one unit as CSV.
    pub fn write_hits_csv(&mut self, unit: u64, hits: &[TofHit]) -> Result<()> {
        self.header(HITS_HEADER)?;
        for h in hits {
            let a = h.address;
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                unit,
                h.index,
                a.sm_type,
                a.sm,
                a.rpc,
                a.channel,
                h.position[0],
                h.position[1],
                h.position[2],
                h.position_error[0],
                h.position_error[1],
                h.position_error[2],
                h.time,
                h.tot,
                h.n_digis
            )?;
        }
        Ok(())
    }

    /// Writes the hits of one unit as binary records of
    /// [`HIT_RECORD_SIZE`] bytes.
    pub fn write_hits_binary(&mut self, unit: u64, hits: &[TofHit]) -> Result<()> {
        for h in hits {
            self.writer.write_all(&unit.to_le_bytes())?;
            self.writer.write_all(&h.address.pack().to_le_bytes())?;
            for p in h.position {
                self.writer.write_all(&p.to_le_bytes())?;
            }
            self.writer.write_all(&h.time.to_le_bytes())?;
            self.writer.write_all(&h.tot.to_le_bytes())?;
            let n_digis = u32::try_from(h.n_digis).unwrap_or(u32::MAX);
            self.writer.write_all(&n_digis.to_le_bytes())?;
        }
        Ok(())
    }

    /// Writes the digi match records of one unit as CSV, one row per link.
    pub fn write_matches_csv(&mut self, unit: u64, matches: &[DigiMatch]) -> Result<()> {
        self.header(MATCHES_HEADER)?;
        for (hit, m) in matches.iter().enumerate() {
            for link in &m.links {
                writeln!(self.writer, "{},{},{},{}", unit, hit, link.digi, link.weight)?;
            }
        }
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use tofhit_core::TofAddress;

    fn hit(channel: u8, time: f64) -> TofHit {
        TofHit {
            address: TofAddress::new(0, 1, 2, channel, 0).unwrap(),
            position: [1.5, -2.0, 100.0],
            position_error: [0.5; 3],
            time,
            tot: 11.0,
            n_digis: 2,
            index: 0,
        }
    }

    #[test]
    fn test_write_hits_csv() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = HitWriter::create(file.path()).unwrap();
        writer.write_hits_csv(0, &[hit(5, 10.1)]).unwrap();
        writer.write_hits_csv(1, &[hit(6, 20.5)]).unwrap();
        writer.flush().unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HITS_HEADER);
        assert_eq!(lines[1], "0,0,0,1,2,5,1.5,-2,100,0.5,0.5,0.5,10.1,11,2");
        assert!(lines[2].starts_with("1,0,0,1,2,6,"));
    }

    #[test]
    fn test_write_hits_binary() {
        let mut writer = HitWriter::from_writer(Vec::new());
        writer.write_hits_binary(3, &[hit(5, 10.1), hit(6, 12.0)]).unwrap();
        let data = writer.into_inner().unwrap();
        assert_eq!(data.len(), 2 * HIT_RECORD_SIZE);

        let unit = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let address = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let time = f64::from_le_bytes(data[36..44].try_into().unwrap());
        let n_digis = u32::from_le_bytes(data[52..56].try_into().unwrap());
        assert_eq!(unit, 3);
        assert_eq!(TofAddress::unpack(address).unwrap().channel, 5);
        assert!((time - 10.1).abs() < 1e-12);
        assert_eq!(n_digis, 2);
    }

    #[test]
    fn test_write_matches_csv() {
        let mut m = DigiMatch::new();
        m.add_link(5.0, 0);
        m.add_link(6.0, 1);
        let mut writer = HitWriter::from_writer(Vec::new());
        writer.write_matches_csv(4, &[DigiMatch::new(), m]).unwrap();
        let content = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(content, "unit,hit,digi,weight\n4,1,0,5\n4,1,1,6\n");
    }
}
