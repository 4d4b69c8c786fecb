//! Strip pair matching: turning two-ended digis into strip hits.
//!
//! A strip is read out at both ends. The mean of the two end times is the hit
//! time; their difference, scaled by the signal velocity, is the position
//! along the strip:
//!
//! `along = 0.5 * v * (t_side1 - t_side0)`
//!
//! Buckets are time ordered, so the matcher always works on the head of the
//! bucket and consumes it from the front.

use crate::store::StoredDigi;
use tofhit_core::{ClusterizerStatistics, CounterLayout};

/// Hit on a single strip, built from one digi per side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StripHit {
    /// Mean of the two end times (ns).
    pub time: f64,
    /// Position along the strip relative to its centre.
    pub along: f64,
    /// Sum of the two Tot values.
    pub weight: f64,
    /// Indices of the two digis in the calibrated collection.
    pub digis: [usize; 2],
}

impl StripHit {
    fn from_pair(a: &StoredDigi, b: &StoredDigi, along: f64) -> Self {
        Self {
            time: 0.5 * (a.time + b.time),
            along,
            weight: a.tot + b.tot,
            digis: [a.index, b.index],
        }
    }
}

/// Strip properties needed for pairing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StripGeometry {
    pub signal_velocity: f64,
    /// Largest accepted |along|.
    pub max_along: f64,
}

impl StripGeometry {
    /// `pos_max_scale` scales the half length of the strip.
    pub fn for_counter(counter: &CounterLayout, pos_max_scale: f64) -> Self {
        Self {
            signal_velocity: counter.signal_velocity,
            max_along: 0.5 * counter.strip_length() * pos_max_scale,
        }
    }

    /// Position along the strip of a pair of opposite-side digis.
    #[inline]
    pub fn position(&self, a: &StoredDigi, b: &StoredDigi) -> f64 {
        let (side0, side1) = if a.side == 1 { (b, a) } else { (a, b) };
        0.5 * self.signal_velocity * (side1.time - side0.time)
    }

    #[inline]
    fn contains(&self, along: f64) -> bool {
        along.abs() <= self.max_along
    }
}

/// Correlation window around an open cluster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterWindow {
    pub mean_time: f64,
    pub mean_along: f64,
    pub max_time: f64,
    pub max_space: f64,
}

/// Drop digis until the head of the bucket holds two opposite sides.
///
/// Three same-side digis in a row drop the first one. Otherwise the one of the
/// two leading digis that lies further in time from the third (the candidate
/// partner) is dropped; on a tie the second one goes.
fn resolve_same_side(bucket: &mut Vec<StoredDigi>, stats: &mut ClusterizerStatistics) {
    while bucket.len() >= 2 && bucket[0].side == bucket[1].side {
        let drop = match bucket.get(2) {
            Some(third) if third.side == bucket[0].side => 0,
            Some(third) if third.time - bucket[0].time > third.time - bucket[1].time => 0,
            Some(_) => 1,
            None => 0,
        };
        log::trace!(
            "same-side digis at t={:.3}/{:.3}, dropping index {drop}",
            bucket[0].time,
            bucket[1].time
        );
        bucket.remove(drop);
        stats.same_side_dropped += 1;
    }
}

/// Take the next strip hit from the head of `bucket`.
///
/// Returns `None` once fewer than two digis remain. Pairs that fall outside
/// the strip are first offered a better partner (the third digi, if it gives
/// a strictly smaller |along|) and are otherwise discarded.
pub fn next_strip_hit(
    bucket: &mut Vec<StoredDigi>,
    strip: &StripGeometry,
    stats: &mut ClusterizerStatistics,
) -> Option<StripHit> {
    loop {
        resolve_same_side(bucket, stats);
        if bucket.len() < 2 {
            return None;
        }

        let mut along = strip.position(&bucket[0], &bucket[1]);
        while !strip.contains(along) && bucket.len() > 2 {
            let candidate = bucket[2];
            let (replaced, better) = if candidate.side == bucket[0].side {
                (0, strip.position(&candidate, &bucket[1]))
            } else {
                (1, strip.position(&bucket[0], &candidate))
            };
            if better.abs() >= along.abs() {
                break;
            }
            bucket.remove(replaced);
            stats.partner_replacements += 1;
            along = better;
        }

        if !strip.contains(along) {
            log::trace!("pair at t={:.3} outside strip (along={along:.2})", bucket[0].time);
            bucket.drain(..2);
            stats.out_of_window_dropped += 2;
            continue;
        }

        let hit = StripHit::from_pair(&bucket[0], &bucket[1], along);
        bucket.drain(..2);
        stats.strip_hits += 1;
        return Some(hit);
    }
}

/// Remove and return the first opposite-side pair of `bucket` that fits into
/// `window`.
///
/// Candidates are scanned in time order; the scan stops once the first digi is
/// later than the window.
pub fn take_matching_pair(
    bucket: &mut Vec<StoredDigi>,
    strip: &StripGeometry,
    window: &ClusterWindow,
    stats: &mut ClusterizerStatistics,
) -> Option<StripHit> {
    let t_low = window.mean_time - window.max_time;
    let t_high = window.mean_time + window.max_time;

    for i1 in 0..bucket.len() {
        let a = bucket[i1];
        if a.time > t_high {
            break;
        }
        for i2 in i1 + 1..bucket.len() {
            let b = bucket[i2];
            if b.side == a.side {
                continue;
            }
            let time = 0.5 * (a.time + b.time);
            if time <= t_low {
                continue;
            }
            if time >= t_high {
                break;
            }
            let along = strip.position(&a, &b);
            if !strip.contains(along) {
                break;
            }
            if (along - window.mean_along).abs() >= window.max_space {
                continue;
            }
            bucket.remove(i2);
            bucket.remove(i1);
            stats.strip_hits += 1;
            return Some(StripHit::from_pair(&a, &b, along));
        }
    }
    None
}
