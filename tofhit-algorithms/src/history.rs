//! Bounded per-channel history of emitted hits.
//!
//! Hits are kept in strict time order per (counter, channel). Emission order
//! across counters is not time monotonic, so insertion searches for the
//! right place instead of appending. The history owns copies of the hits.

use std::collections::VecDeque;
use tofhit_core::{DetectorLayout, Error, Result, TofHit};

/// Last hits per channel.
#[derive(Clone, Debug)]
pub struct HitHistory {
    /// Indexed by slot, then channel.
    channels: Vec<Vec<VecDeque<TofHit>>>,
}

impl HitHistory {
    pub fn new(layout: &DetectorLayout) -> Self {
        Self {
            channels: layout
                .counters()
                .iter()
                .map(|c| vec![VecDeque::new(); usize::from(c.n_channels)])
                .collect(),
        }
    }

    /// Insert `hit` into the list of (`slot`, `channel`).
    ///
    /// Returns false if the list already holds a hit with the same address and
    /// time, or if the slot/channel does not exist.
    #[allow(clippy::float_cmp)]
    pub fn store(&mut self, slot: usize, channel: u8, hit: TofHit) -> bool {
        let Some(list) = self
            .channels
            .get_mut(slot)
            .and_then(|c| c.get_mut(usize::from(channel)))
        else {
            return false;
        };

        let Some(back) = list.back().copied() else {
            list.push_back(hit);
            return true;
        };
        let front_time = list.front().map_or(back.time, |h| h.time);

        if hit.time >= back.time {
            if hit.time == back.time && hit.address == back.address {
                return false;
            }
            list.push_back(hit);
        } else if hit.time >= front_time {
            let at = list.partition_point(|h| h.time <= hit.time);
            if list
                .range(..at)
                .rev()
                .take_while(|h| h.time == hit.time)
                .any(|h| h.address == hit.address)
            {
                return false;
            }
            list.insert(at, hit);
        } else {
            list.push_front(hit);
        }
        true
    }

    /// Drop every hit older than `horizon`. Returns the number dropped.
    pub fn expire(&mut self, horizon: f64) -> usize {
        let mut dropped = 0;
        for list in self.channels.iter_mut().flatten() {
            while list.front().is_some_and(|h| h.time < horizon) {
                list.pop_front();
                dropped += 1;
            }
        }
        dropped
    }

    /// Verify the history against `layout`: matching shape, every hit in the
    /// list of its own channel, and strict time order.
    pub fn check(&self, layout: &DetectorLayout) -> Result<()> {
        if self.channels.len() != layout.n_counters() {
            return Err(Error::HistoryMismatch(format!(
                "{} counters stored, layout has {}",
                self.channels.len(),
                layout.n_counters()
            )));
        }
        for (counter, lists) in layout.counters().iter().zip(&self.channels) {
            if lists.len() != usize::from(counter.n_channels) {
                return Err(Error::HistoryMismatch(format!(
                    "counter {}: {} channels stored, layout has {}",
                    counter.address,
                    lists.len(),
                    counter.n_channels
                )));
            }
            for (channel, list) in (0..counter.n_channels).zip(lists) {
                let expected = counter.channel_address(channel);
                if let Some(hit) = list.iter().find(|h| h.address != expected) {
                    return Err(Error::HistoryMismatch(format!(
                        "hit with address {} stored under {expected}",
                        hit.address
                    )));
                }
                if list.iter().zip(list.iter().skip(1)).any(|(a, b)| a.time > b.time) {
                    return Err(Error::HistoryMismatch(format!(
                        "list of {expected} not time ordered"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remove all stored hits. Returns the number removed.
    pub fn clean(&mut self) -> usize {
        let mut removed = 0;
        for list in self.channels.iter_mut().flatten() {
            removed += list.len();
            list.clear();
        }
        removed
    }

    /// Hits of one channel, oldest first.
    pub fn channel(&self, slot: usize, channel: u8) -> Option<&VecDeque<TofHit>> {
        self.channels.get(slot)?.get(usize::from(channel))
    }

    /// Number of stored hits.
    pub fn len(&self) -> usize {
        self.channels.iter().flatten().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tofhit_core::{DetectorSetup, RpcPar, SmTypePar, TofAddress};

    fn layout() -> DetectorLayout {
        let setup = DetectorSetup::default()
            .with_sm_type(SmTypePar::uniform(1, 2, &RpcPar::default().with_channels(4)));
        DetectorLayout::new(&setup).unwrap()
    }

    fn hit(rpc: u8, channel: u8, time: f64) -> TofHit {
        TofHit {
            address: TofAddress::new(0, 0, rpc, channel, 0).unwrap(),
            position: [0.0; 3],
            position_error: [0.5; 3],
            time,
            tot: 1.0,
            n_digis: 2,
            index: 0,
        }
    }

    fn times(history: &HitHistory, slot: usize, channel: u8) -> Vec<f64> {
        history
            .channel(slot, channel)
            .unwrap()
            .iter()
            .map(|h| h.time)
            .collect()
    }

    #[test]
    fn test_store_keeps_time_order() {
        let mut history = HitHistory::new(&layout());
        for t in [5.0, 7.0, 6.0, 1.0, 6.5, 7.0 + 1e-9] {
            assert!(history.store(1, 2, hit(1, 2, t)));
        }
        assert_eq!(times(&history, 1, 2), vec![1.0, 5.0, 6.0, 6.5, 7.0, 7.0 + 1e-9]);
        assert_eq!(history.len(), 6);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut history = HitHistory::new(&layout());
        assert!(history.store(0, 0, hit(0, 0, 2.0)));
        assert!(history.store(0, 0, hit(0, 0, 4.0)));
        assert!(!history.store(0, 0, hit(0, 0, 4.0)));
        assert!(!history.store(0, 0, hit(0, 0, 2.0)));
        assert!(!history.store(5, 0, hit(0, 0, 2.0)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_expire_and_clean() {
        let mut history = HitHistory::new(&layout());
        history.store(0, 1, hit(0, 1, 1.0));
        history.store(0, 1, hit(0, 1, 3.0));
        history.store(1, 3, hit(1, 3, 2.0));
        assert_eq!(history.expire(2.5), 2);
        assert_eq!(times(&history, 0, 1), vec![3.0]);
        assert_eq!(history.clean(), 1);
        assert!(history.is_empty());
    }

    #[test]
    fn test_check_detects_misfiled_hit() {
        let layout = layout();
        let mut history = HitHistory::new(&layout);
        history.store(0, 1, hit(0, 1, 1.0));
        assert!(history.check(&layout).is_ok());
        history.store(0, 2, hit(1, 2, 1.0));
        assert!(matches!(
            history.check(&layout),
            Err(Error::HistoryMismatch(_))
        ));
    }

    #[test]
    fn test_check_detects_shape_change() {
        let history = HitHistory::new(&layout());
        let other = DetectorLayout::new(
            &DetectorSetup::default()
                .with_sm_type(SmTypePar::uniform(1, 3, &RpcPar::default().with_channels(4))),
        )
        .unwrap();
        assert!(history.check(&other).is_err());
    }
}
