//! Cluster building across adjacent strips of one counter.
//!
//! Channels are scanned in increasing order. A strip hit opens a cluster when
//! none is open or when it does not continue the open one; a continuing hit
//! sits on the next live channel and lies within the time and space windows
//! of the cluster's Tot-weighted mean. Dead strips never break adjacency. After every strip hit the cluster greedily
//! absorbs matching pairs from the following channels before the scan
//! resumes.

use crate::pairing::{next_strip_hit, take_matching_pair, ClusterWindow, StripGeometry, StripHit};
use crate::store::StoredDigi;
use tofhit_core::{ChannelLayout, ClusterizerStatistics, CounterLayout, Error, Result};

/// A finalized cluster, in counter-local coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    /// Slot of the counter.
    pub slot: usize,
    /// Representative channel.
    pub channel: u8,
    /// Local position (cm).
    pub local: [f64; 3],
    /// Tot-weighted mean time (ns).
    pub time: f64,
    /// Sum of the strip hit weights.
    pub weight: f64,
    /// Number of strip hits.
    pub n_strips: usize,
    /// Indices of all contributing calibrated digis.
    pub digis: Vec<usize>,
}

/// Running sums of an open cluster.
///
/// Sums are only normalized on [`PendingCluster::finalize`].
#[derive(Clone, Debug)]
struct PendingCluster {
    sum_time: f64,
    sum_along: f64,
    sum_across: f64,
    weight: f64,
    // Unweighted sums, used when all weights vanish.
    plain_time: f64,
    plain_along: f64,
    plain_across: f64,
    n_strips: usize,
    last_channel: u8,
    digis: Vec<usize>,
}

impl PendingCluster {
    fn open(channel: u8, hit: &StripHit, across: f64) -> Self {
        let mut cluster = Self {
            sum_time: 0.0,
            sum_along: 0.0,
            sum_across: 0.0,
            weight: 0.0,
            plain_time: 0.0,
            plain_along: 0.0,
            plain_across: 0.0,
            n_strips: 0,
            last_channel: channel,
            digis: Vec::with_capacity(8),
        };
        cluster.add(channel, hit, across);
        cluster
    }

    fn add(&mut self, channel: u8, hit: &StripHit, across: f64) {
        self.sum_time += hit.weight * hit.time;
        self.sum_along += hit.weight * hit.along;
        self.sum_across += hit.weight * across;
        self.weight += hit.weight;
        self.plain_time += hit.time;
        self.plain_along += hit.along;
        self.plain_across += across;
        self.n_strips += 1;
        self.last_channel = channel;
        self.digis.extend(hit.digis);
    }

    #[allow(clippy::cast_precision_loss)]
    fn means(&self) -> (f64, f64, f64) {
        if self.weight > 0.0 {
            (
                self.sum_time / self.weight,
                self.sum_along / self.weight,
                self.sum_across / self.weight,
            )
        } else {
            let n = self.n_strips.max(1) as f64;
            (self.plain_time / n, self.plain_along / n, self.plain_across / n)
        }
    }

    fn window(&self, counter: &CounterLayout) -> ClusterWindow {
        let (mean_time, mean_along, _) = self.means();
        ClusterWindow {
            mean_time,
            mean_along,
            max_time: counter.max_time_dist,
            max_space: counter.max_space_dist,
        }
    }

    fn accepts(&self, channel: u8, hit: &StripHit, counter: &CounterLayout) -> bool {
        let window = self.window(counter);
        next_live_channel(counter, self.last_channel) == Some(channel)
            && (hit.time - window.mean_time).abs() < window.max_time
            && (hit.along - window.mean_along).abs() < window.max_space
    }

    fn finalize(self, counter: &CounterLayout) -> Cluster {
        let (time, along, across) = self.means();
        Cluster {
            slot: counter.slot,
            channel: counter.representative_channel(across),
            local: counter.local_position(along, across),
            time,
            weight: self.weight,
            n_strips: self.n_strips,
            digis: self.digis,
        }
    }
}

/// First live channel after `channel`.
fn next_live_channel(counter: &CounterLayout, channel: u8) -> Option<u8> {
    (channel.checked_add(1)?..counter.n_channels).find(|&c| !counter.is_dead(c))
}

/// Absorb matching pairs from the channels following the cluster.
///
/// Returns true when the cluster has to be finalized now: the next live
/// channel held digis but no further match was found, or the scan ran past
/// an absorbed channel. Returns false (cluster stays open) when the very next
/// live channel is missing or empty.
fn absorb_forward(
    cluster: &mut PendingCluster,
    counter: &CounterLayout,
    buckets: &mut [Vec<StoredDigi>],
    strip: &StripGeometry,
    stats: &mut ClusterizerStatistics,
) -> bool {
    let mut absorbed = false;
    loop {
        let next = next_live_channel(counter, cluster.last_channel)
            .filter(|&c| buckets.get(usize::from(c)).is_some_and(|b| !b.is_empty()));
        let Some(channel) = next else {
            return absorbed;
        };
        let window = cluster.window(counter);
        match take_matching_pair(&mut buckets[usize::from(channel)], strip, &window, stats) {
            Some(hit) => {
                cluster.add(channel, &hit, counter.across_position(channel));
                absorbed = true;
            }
            None => return true,
        }
    }
}

/// Build all clusters of one counter from its channel buckets.
///
/// Buckets are drained; digis that end up in no strip hit are counted and
/// discarded. Pad counters cannot be clustered: asking for it with digis
/// present is an error.
pub fn build_counter_clusters(
    counter: &CounterLayout,
    buckets: &mut [Vec<StoredDigi>],
    pos_max_scale: f64,
    stats: &mut ClusterizerStatistics,
) -> Result<Vec<Cluster>> {
    if buckets.iter().all(Vec::is_empty) {
        return Ok(Vec::new());
    }
    match counter.layout {
        ChannelLayout::VerticalStrip | ChannelLayout::HorizontalStrip => {}
        ChannelLayout::Pad => {
            return Err(Error::UnsupportedChannelLayout {
                sm_type: counter.address.sm_type,
                sm: counter.address.sm,
                rpc: counter.address.rpc,
            })
        }
    }

    let strip = StripGeometry::for_counter(counter, pos_max_scale);
    let mut clusters = Vec::new();
    let mut open: Option<PendingCluster> = None;

    for channel in 0..counter.n_channels {
        let index = usize::from(channel);
        if index >= buckets.len() {
            break;
        }
        if counter.is_dead(channel) {
            stats.dead_strip_dropped += buckets[index].len();
            buckets[index].clear();
            continue;
        }
        let across = counter.across_position(channel);

        while let Some(hit) = next_strip_hit(&mut buckets[index], &strip, stats) {
            let continues = open
                .as_ref()
                .is_some_and(|cluster| cluster.accepts(channel, &hit, counter));
            if continues {
                if let Some(cluster) = open.as_mut() {
                    cluster.add(channel, &hit, across);
                }
            } else {
                if let Some(done) = open.take() {
                    clusters.push(done.finalize(counter));
                }
                open = Some(PendingCluster::open(channel, &hit, across));
            }

            if let Some(cluster) = open.as_mut() {
                if absorb_forward(cluster, counter, buckets, &strip, stats) {
                    if let Some(done) = open.take() {
                        clusters.push(done.finalize(counter));
                    }
                }
            }
        }

        stats.unpaired_dropped += buckets[index].len();
        buckets[index].clear();
    }

    if let Some(done) = open.take() {
        clusters.push(done.finalize(counter));
    }
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tofhit_core::{CounterPar, DetectorLayout, DetectorSetup, RpcPar, SmTypePar};

    fn counter(layout: ChannelLayout, dead_strips: u64) -> CounterLayout {
        let rpc = RpcPar::default()
            .with_channels(8)
            .with_layout(layout)
            .with_signal_velocity(10.0)
            .with_cell_size(2.0, 20.0)
            .with_windows(0.2, 0.5);
        let setup = DetectorSetup::default().with_sm_type(
            SmTypePar::uniform(1, 1, &rpc).with_counter(CounterPar {
                dead_strips,
                ..CounterPar::default()
            }),
        );
        DetectorLayout::new(&setup).unwrap().counters()[0].clone()
    }

    fn pair(buckets: &mut [Vec<StoredDigi>], channel: usize, first: usize, t0: f64, t1: f64, tot: f64) {
        buckets[channel].push(StoredDigi {
            index: first,
            side: 0,
            time: t0,
            tot,
        });
        buckets[channel].push(StoredDigi {
            index: first + 1,
            side: 1,
            time: t1,
            tot,
        });
    }

    #[test]
    fn test_adjacent_strips_merge() {
        let counter = counter(ChannelLayout::VerticalStrip, 0);
        let mut buckets = vec![Vec::new(); 8];
        // along = 5 * (t1 - t0): 0.0 and 0.25
        pair(&mut buckets, 3, 0, 1.0, 1.0, 2.0);
        pair(&mut buckets, 4, 2, 1.05, 1.1, 3.0);
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();

        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_eq!(c.digis.len(), 4);
        assert_eq!(c.n_strips, 2);
        let (w1, w2) = (4.0, 6.0);
        assert_relative_eq!(c.weight, w1 + w2);
        assert_relative_eq!(c.time, (w1 * 1.0 + w2 * 1.075) / 10.0, max_relative = 1e-9);
        let x = (w1 * counter.across_position(3) + w2 * counter.across_position(4)) / 10.0;
        assert_relative_eq!(c.local[0], x, max_relative = 1e-9);
        assert_relative_eq!(c.local[1], w2 * 0.25 / 10.0, max_relative = 1e-9);
        assert_eq!(c.channel, 4);
        assert_eq!(stats.strip_hits, 2);
        assert!(buckets.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_time_gap_splits_clusters() {
        let counter = counter(ChannelLayout::VerticalStrip, 0);
        let mut buckets = vec![Vec::new(); 8];
        pair(&mut buckets, 3, 0, 1.0, 1.0, 2.0);
        pair(&mut buckets, 4, 2, 2.0, 2.0, 2.0);
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].channel, 3);
        assert_eq!(clusters[1].channel, 4);
    }

    #[test]
    fn test_non_adjacent_strips_split() {
        let counter = counter(ChannelLayout::VerticalStrip, 0);
        let mut buckets = vec![Vec::new(); 8];
        pair(&mut buckets, 1, 0, 1.0, 1.0, 2.0);
        pair(&mut buckets, 3, 2, 1.0, 1.0, 2.0);
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_absorption_skips_dead_strip() {
        let counter = counter(ChannelLayout::VerticalStrip, 1 << 4);
        let mut buckets = vec![Vec::new(); 8];
        pair(&mut buckets, 3, 0, 1.0, 1.0, 2.0);
        pair(&mut buckets, 4, 2, 1.0, 1.0, 2.0);
        pair(&mut buckets, 5, 4, 1.0, 1.0, 2.0);
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].digis, vec![0, 1, 4, 5]);
        assert_eq!(stats.dead_strip_dropped, 2);
    }

    #[test]
    fn test_continuation_steps_over_dead_strip() {
        let hit = StripHit {
            time: 1.0,
            along: 0.0,
            weight: 2.0,
            digis: [0, 1],
        };
        let live = counter(ChannelLayout::VerticalStrip, 0);
        let cluster = PendingCluster::open(3, &hit, live.across_position(3));
        assert!(cluster.accepts(4, &hit, &live));
        assert!(!cluster.accepts(5, &hit, &live));
        assert!(!cluster.accepts(3, &hit, &live));

        let dead = counter(ChannelLayout::VerticalStrip, 1 << 4);
        assert!(cluster.accepts(5, &hit, &dead));
        assert!(!cluster.accepts(6, &hit, &dead));
    }

    #[test]
    fn test_horizontal_layout_swaps_axes() {
        let counter = counter(ChannelLayout::HorizontalStrip, 0);
        let mut buckets = vec![Vec::new(); 8];
        pair(&mut buckets, 0, 0, 1.0, 1.1, 1.0);
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_relative_eq!(c.local[0], 0.5, max_relative = 1e-9);
        assert_relative_eq!(c.local[1], counter.across_position(0));
        assert_eq!(c.channel, 0);
    }

    #[test]
    fn test_pad_layout_is_rejected() {
        let counter = counter(ChannelLayout::Pad, 0);
        let mut buckets = vec![Vec::new(); 8];
        let mut stats = ClusterizerStatistics::default();
        assert!(build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats)
            .unwrap()
            .is_empty());
        pair(&mut buckets, 0, 0, 1.0, 1.0, 1.0);
        assert!(matches!(
            build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats),
            Err(Error::UnsupportedChannelLayout { .. })
        ));
    }

    #[test]
    fn test_leftovers_counted() {
        let counter = counter(ChannelLayout::VerticalStrip, 0);
        let mut buckets = vec![Vec::new(); 8];
        pair(&mut buckets, 2, 0, 1.0, 1.0, 1.0);
        buckets[2].push(StoredDigi {
            index: 2,
            side: 0,
            time: 3.0,
            tot: 1.0,
        });
        let mut stats = ClusterizerStatistics::default();
        let clusters = build_counter_clusters(&counter, &mut buckets, 1.0, &mut stats).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(stats.unpaired_dropped, 1);
    }
}
