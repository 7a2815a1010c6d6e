//! Epoch-based reclamation of retired extents.
//!
//! Copy-on-write leaves the old version of every changed node on disk. Those
//! extents are *retired* rather than freed, because a reader may still be
//! walking an older root, and because the previous superblock slot still
//! references them until the next checkpoint overwrites it.
//!
//! # Design
//!
//! - The epoch counts completed checkpoints since open.
//! - Readers pin the current epoch for as long as they may load nodes.
//! - An extent retired in epoch `e` is reusable once the epoch reaches `e + 2`
//!   (neither superblock slot references it) and no pin at or below `e` remains.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::storage::page::Extent;

#[derive(Debug, Default)]
struct ReclaimState {
    epoch: u64,
    /// Pinned epoch to number of live pins.
    pins: BTreeMap<u64, usize>,
    /// Retired extents tagged with the epoch they were retired in.
    retired: Vec<(u64, Extent)>,
}

/// Shared reclamation state.
#[derive(Debug, Clone, Default)]
#[allow(clippy::disallowed_methods)] // Clone shares the Arc
pub struct Reclaimer {
    state: Arc<Mutex<ReclaimState>>,
}

impl Reclaimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current epoch until the returned guard is dropped.
    pub fn pin(&self) -> Result<EpochPin> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let epoch = state.epoch;
        *state.pins.entry(epoch).or_default() += 1;
        Ok(EpochPin {
            reclaimer: self.clone(),
            epoch,
        })
    }

    /// Retire extents that are no longer reachable from the published roots.
    pub fn retire(&self, extents: impl IntoIterator<Item = Extent>) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let epoch = state.epoch;
        state
            .retired
            .extend(extents.into_iter().map(|extent| (epoch, extent)));
        Ok(())
    }

    /// Remove and return every retired extent that is safe to reuse.
    pub fn take_reclaimable(&self) -> Result<Vec<Extent>> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let epoch = state.epoch;
        let oldest_pin = state.pins.keys().next().copied();

        let (ready, waiting): (Vec<_>, Vec<_>) =
            state.retired.drain(..).partition(|&(retired_in, _)| {
                retired_in + 2 <= epoch && oldest_pin.is_none_or(|pin| pin > retired_in)
            });
        state.retired = waiting;

        Ok(ready.into_iter().map(|(_, extent)| extent).collect())
    }

    /// Mark the end of a checkpoint.
    pub fn advance(&self) -> Result<u64> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.epoch += 1;
        Ok(state.epoch)
    }

    /// Number of retired extents waiting for reuse.
    #[cfg(test)]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().map_or(0, |state| state.retired.len())
    }

    fn unpin(&self, epoch: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(count) = state.pins.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&epoch);
            }
        }
    }
}

/// Keeps extents reachable from the roots of one epoch from being reused.
#[derive(Debug)]
pub struct EpochPin {
    reclaimer: Reclaimer,
    epoch: u64,
}

impl EpochPin {
    #[cfg(test)]
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochPin {
    fn drop(&mut self) {
        self.reclaimer.unpin(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_waits_two_checkpoints() {
        let reclaimer = Reclaimer::new();
        reclaimer
            .retire([Extent::new(10, 1)])
            .expect("retire");

        assert!(reclaimer.take_reclaimable().expect("take").is_empty());
        reclaimer.advance().expect("advance");
        assert!(reclaimer.take_reclaimable().expect("take").is_empty());
        reclaimer.advance().expect("advance");
        assert_eq!(
            reclaimer.take_reclaimable().expect("take"),
            vec![Extent::new(10, 1)]
        );
        assert_eq!(reclaimer.pending(), 0);
    }

    #[test]
    fn test_pin_holds_back_reclamation() {
        let reclaimer = Reclaimer::new();
        let pin = reclaimer.pin().expect("pin");
        reclaimer.retire([Extent::new(7, 2)]).expect("retire");

        reclaimer.advance().expect("advance");
        reclaimer.advance().expect("advance");
        assert!(reclaimer.take_reclaimable().expect("take").is_empty());
        assert_eq!(reclaimer.pending(), 1);

        drop(pin);
        assert_eq!(reclaimer.take_reclaimable().expect("take").len(), 1);
    }

    #[test]
    fn test_newer_pin_does_not_block_older_retirement() {
        let reclaimer = Reclaimer::new();
        reclaimer.retire([Extent::new(3, 1)]).expect("retire");
        reclaimer.advance().expect("advance");

        let pin = reclaimer.pin().expect("pin");
        assert_eq!(pin.epoch(), 1);
        reclaimer.advance().expect("advance");

        assert_eq!(reclaimer.take_reclaimable().expect("take").len(), 1);
    }
}
