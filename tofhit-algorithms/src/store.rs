//! Per-channel digi buckets.
//!
//! The store owns one bucket per configured channel in a flat arena laid out
//! like [`DetectorLayout`]: the channels of a counter are contiguous, counters
//! follow in slot order. Buckets hold lightweight copies of calibrated digis
//! together with their index in the calibrated collection.

use std::borrow::Cow;
use tofhit_core::{ClusterizerStatistics, Digi, DetectorLayout};

/// A calibrated digi buffered in its channel bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StoredDigi {
    /// Index into the calibrated digis of the processing unit.
    pub index: usize,
    pub side: u8,
    pub time: f64,
    pub tot: f64,
}

impl StoredDigi {
    #[inline]
    pub fn new(index: usize, digi: &Digi) -> Self {
        Self {
            index,
            side: digi.side(),
            time: digi.time,
            tot: digi.tot,
        }
    }
}

/// Bucket storage for one processing unit.
#[derive(Clone, Debug)]
pub struct DigiStore {
    buckets: Vec<Vec<StoredDigi>>,
    duplicate_beam_counter: bool,
}

impl DigiStore {
    /// Allocate one empty bucket per channel of `layout`.
    pub fn new(layout: &DetectorLayout) -> Self {
        Self {
            buckets: vec![Vec::new(); layout.n_channels_total()],
            duplicate_beam_counter: true,
        }
    }

    /// Whether beam counter digis are still mirrored to the opposite side.
    pub fn duplicates_beam_counter(&self) -> bool {
        self.duplicate_beam_counter
    }

    /// Append an opposite-side copy of every beam counter digi.
    ///
    /// The beam counter is read out on side 0 only but paired like a strip.
    /// As soon as a beam counter digi shows up on side 1 the detector is known
    /// to deliver both sides and the duplication is switched off for good.
    pub fn duplicate_beam_counter<'a>(
        &mut self,
        layout: &DetectorLayout,
        raw: &'a [Digi],
        stats: &mut ClusterizerStatistics,
    ) -> Cow<'a, [Digi]> {
        if !self.duplicate_beam_counter {
            return Cow::Borrowed(raw);
        }
        let beam_type = layout.beam_counter_type();
        let is_beam = |d: &&Digi| d.address.sm_type == beam_type;

        if raw.iter().filter(is_beam).any(|d| d.side() == 1) {
            log::info!(
                "beam counter (type {beam_type}) delivers both sides, digi duplication disabled"
            );
            self.duplicate_beam_counter = false;
            return Cow::Borrowed(raw);
        }

        let twins: Vec<Digi> = raw.iter().filter(is_beam).map(Digi::mirrored).collect();
        if twins.is_empty() {
            return Cow::Borrowed(raw);
        }
        stats.beam_counter_duplicates += twins.len();
        let mut expanded = Vec::with_capacity(raw.len() + twins.len());
        expanded.extend_from_slice(raw);
        expanded.extend(twins);
        Cow::Owned(expanded)
    }

    /// Route calibrated digis into their buckets.
    ///
    /// Digis outside the configured layout are skipped and counted; they never
    /// abort the unit.
    pub fn ingest(
        &mut self,
        layout: &DetectorLayout,
        calibrated: &[Digi],
        stats: &mut ClusterizerStatistics,
    ) {
        for (index, digi) in calibrated.iter().enumerate() {
            match layout.locate(digi.address) {
                Some((_, channel)) => self.buckets[channel].push(StoredDigi::new(index, digi)),
                None => {
                    log::info!(
                        "skip digi {index} at t={:.3}: address {} outside configured layout",
                        digi.time,
                        digi.address
                    );
                    stats.config_mismatches += 1;
                }
            }
        }
    }

    /// Empty every bucket, keeping allocations.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Bucket at flat channel `index`.
    pub fn bucket(&self, index: usize) -> &[StoredDigi] {
        self.buckets.get(index).map_or(&[][..], Vec::as_slice)
    }

    /// Total number of buffered digis.
    pub fn buffered(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Split the arena into the channel buckets of each counter, in slot order.
    pub fn counter_buckets(&mut self, layout: &DetectorLayout) -> Vec<&mut [Vec<StoredDigi>]> {
        let mut rest = self.buckets.as_mut_slice();
        let mut split = Vec::with_capacity(layout.n_counters());
        for counter in layout.counters() {
            let n = usize::from(counter.n_channels).min(rest.len());
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(n);
            split.push(head);
            rest = tail;
        }
        split
    }

    /// Forget the beam counter mode decision.
    pub fn reset(&mut self) {
        self.clear();
        self.duplicate_beam_counter = true;
    }
}
