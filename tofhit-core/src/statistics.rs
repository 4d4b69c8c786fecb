//! Diagnostic counters for offline quality monitoring.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// Counters accumulated over all processed units.
///
/// Every recoverable condition (skipped, discarded or dropped digis,
/// anomaly resolutions) is reported here rather than as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterizerStatistics {
    /// Processing units handed to the clusterizer.
    pub units_processed: usize,
    /// Units skipped for exceeding the digi limit.
    pub oversized_units: usize,
    /// Units aborted by an error.
    pub units_aborted: usize,
    /// Raw digis received (before beam counter duplication).
    pub digis_received: usize,
    /// Synthetic opposite-side beam counter digis added.
    pub beam_counter_duplicates: usize,
    /// Digis whose address lies outside the configured layout.
    pub config_mismatches: usize,
    /// Digis with non-finite time or Tot.
    pub invalid_digis: usize,
    /// Digis discarded inside the channel deadtime.
    pub deadtime_discarded: usize,
    /// Digis dropped while resolving same-side runs.
    pub same_side_dropped: usize,
    /// Digis replaced by a better partner.
    pub partner_replacements: usize,
    /// Digis dropped because their pair lies outside the strip.
    pub out_of_window_dropped: usize,
    /// Digis left unpaired at the end of a channel scan.
    pub unpaired_dropped: usize,
    /// Digis on channels masked as dead.
    pub dead_strip_dropped: usize,
    /// Strip hits formed from digi pairs.
    pub strip_hits: usize,
    /// Hits emitted by the cluster builder.
    pub hits_built: usize,
    /// Hits absorbed by the cross-module merger.
    pub hits_merged: usize,
    /// Hits stored in the bounded history.
    pub history_stored: usize,
    /// Hits rejected by the history as duplicates.
    pub history_duplicates: usize,
    /// Hits evicted from the history.
    pub history_evicted: usize,
}

impl ClusterizerStatistics {
    /// Hits delivered to the output.
    pub fn hits_out(&self) -> usize {
        self.hits_built.saturating_sub(self.hits_merged)
    }

    /// Buffered digis that did not end up in a strip hit.
    pub fn digis_dropped(&self) -> usize {
        self.same_side_dropped
            + self.partner_replacements
            + self.out_of_window_dropped
            + self.unpaired_dropped
            + self.dead_strip_dropped
    }
}

impl AddAssign for ClusterizerStatistics {
    fn add_assign(&mut self, other: Self) {
        self.units_processed += other.units_processed;
        self.oversized_units += other.oversized_units;
        self.units_aborted += other.units_aborted;
        self.digis_received += other.digis_received;
        self.beam_counter_duplicates += other.beam_counter_duplicates;
        self.config_mismatches += other.config_mismatches;
        self.invalid_digis += other.invalid_digis;
        self.deadtime_discarded += other.deadtime_discarded;
        self.same_side_dropped += other.same_side_dropped;
        self.partner_replacements += other.partner_replacements;
        self.out_of_window_dropped += other.out_of_window_dropped;
        self.unpaired_dropped += other.unpaired_dropped;
        self.dead_strip_dropped += other.dead_strip_dropped;
        self.strip_hits += other.strip_hits;
        self.hits_built += other.hits_built;
        self.hits_merged += other.hits_merged;
        self.history_stored += other.history_stored;
        self.history_duplicates += other.history_duplicates;
        self.history_evicted += other.history_evicted;
    }
}

impl fmt::Display for ClusterizerStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Units processed:        {}", self.units_processed)?;
        writeln!(f, "  oversized (skipped):  {}", self.oversized_units)?;
        writeln!(f, "  aborted:              {}", self.units_aborted)?;
        writeln!(f, "Digis received:         {}", self.digis_received)?;
        writeln!(f, "  beam duplicates:      {}", self.beam_counter_duplicates)?;
        writeln!(f, "  config mismatches:    {}", self.config_mismatches)?;
        writeln!(f, "  invalid values:       {}", self.invalid_digis)?;
        writeln!(f, "  deadtime discarded:   {}", self.deadtime_discarded)?;
        writeln!(f, "  same-side dropped:    {}", self.same_side_dropped)?;
        writeln!(f, "  partner replaced:     {}", self.partner_replacements)?;
        writeln!(f, "  out of strip:         {}", self.out_of_window_dropped)?;
        writeln!(f, "  unpaired:             {}", self.unpaired_dropped)?;
        writeln!(f, "  dead strips:          {}", self.dead_strip_dropped)?;
        writeln!(f, "Strip hits:             {}", self.strip_hits)?;
        writeln!(f, "Hits built:             {}", self.hits_built)?;
        writeln!(f, "  merged across RPCs:   {}", self.hits_merged)?;
        writeln!(f, "History stored:         {}", self.history_stored)?;
        writeln!(f, "  duplicates:           {}", self.history_duplicates)?;
        write!(f, "  evicted:              {}", self.history_evicted)
    }
}
