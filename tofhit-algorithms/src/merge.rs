//! Merging of hits across neighbouring counters.
//!
//! Pad-like station types (diamonds, pads) are built from several small
//! counters; a particle crossing the seam between two of them leaves one hit
//! in each. Such pairs are merged into one Tot-weighted hit. The second hit
//! and its match record are removed so hits and matches stay index aligned.

use tofhit_core::{
    ClusterizerStatistics, DetectorLayout, Digi, DigiMatch, Error, Result, TofHit,
};

/// Sum of the link weights of `m`, checking that every link points into
/// `calibrated`.
fn link_weight(m: &DigiMatch, calibrated: &[Digi]) -> Result<f64> {
    for link in &m.links {
        if link.digi >= calibrated.len() {
            return Err(Error::InvalidDigiIndex {
                index: link.digi,
                len: calibrated.len(),
            });
        }
    }
    Ok(m.total_weight())
}

/// Whether `b` sits on a counter next to the one of `a`.
fn neighbours(layout: &DetectorLayout, a: &TofHit, b: &TofHit) -> bool {
    let (a, b) = (a.address, b.address);
    if a.sm_type != b.sm_type {
        return false;
    }
    let module_ok = b.sm == a.sm || layout.is_beam_counter(a.sm_type);
    let rpc_ok = a.rpc.abs_diff(b.rpc) == 1 || b.sm != a.sm;
    module_ok && rpc_ok
}

/// Merge hits of pad-like station types that sit on neighbouring counters.
///
/// Windows are taken from the counter of the first hit of a pair: the time
/// difference must be below its time window, x and y differences below twice
/// `merge_space_dist` (or twice its space window when not given).
pub fn merge_hits(
    layout: &DetectorLayout,
    merge_space_dist: Option<f64>,
    hits: &mut Vec<TofHit>,
    matches: &mut Vec<DigiMatch>,
    calibrated: &[Digi],
    stats: &mut ClusterizerStatistics,
) -> Result<()> {
    if hits.len() != matches.len() {
        return Err(Error::Config(format!(
            "{} hits but {} match records",
            hits.len(),
            matches.len()
        )));
    }

    let mut i = 0;
    while i < hits.len() {
        let sm_type = hits[i].address.sm_type;
        if !layout.is_pad_like(sm_type) || layout.n_rpc(sm_type) <= 1 {
            i += 1;
            continue;
        }
        let Some(counter) = layout.slot(hits[i].address).and_then(|s| layout.counter(s)) else {
            i += 1;
            continue;
        };
        let max_time = counter.max_time_dist;
        let max_space = 2.0 * merge_space_dist.unwrap_or(counter.max_space_dist);

        let mut j = i + 1;
        while j < hits.len() {
            let (a, b) = (&hits[i], &hits[j]);
            let close = (b.x() - a.x()).abs() < max_space
                && (b.y() - a.y()).abs() < max_space
                && (b.time - a.time).abs() < max_time;
            if !(neighbours(layout, a, b) && close) {
                j += 1;
                continue;
            }

            let w_a = link_weight(&matches[i], calibrated)?;
            let w_b = link_weight(&matches[j], calibrated)?;
            let total = w_a + w_b;
            if total <= 0.0 {
                j += 1;
                continue;
            }
            log::debug!(
                "merge hit {} ({}) into hit {} ({}), dt={:.3}",
                j,
                b.address,
                i,
                a.address,
                b.time - a.time
            );

            let absorbed = hits.remove(j);
            let links = matches.remove(j);
            let merged = &mut hits[i];
            for (p, q) in merged.position.iter_mut().zip(absorbed.position) {
                *p = (*p * w_a + q * w_b) / total;
            }
            merged.time = (merged.time * w_a + absorbed.time * w_b) / total;
            merged.tot = total;
            matches[i].absorb(links);
            merged.n_digis = matches[i].len();
            stats.hits_merged += 1;
            // `j` now points at the next candidate.
        }
        i += 1;
    }

    for (index, hit) in hits.iter_mut().enumerate() {
        hit.index = index;
    }
    Ok(())
}
