use std::ops::Index;

use anyhow::{bail, Result};
use derive_more::{From, Into};
use typed_index_collections::TiVec;

/// Index into the `TimeAxis`. Signal changes refer to time by this rather
/// than by absolute time.
#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeIndex(pub usize);

/// Every `#<time>` marker in the dump, in file order. Never decreases.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimeAxis {
    times: TiVec<TimeIndex, u64>,
}

impl TimeAxis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last(&self) -> Option<u64> {
        self.times.raw.last().copied()
    }

    pub fn get(&self, index: TimeIndex) -> Option<u64> {
        self.times.get(index).copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.times.raw
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.times.raw.iter().copied()
    }

    /// Append a time marker. The same time may appear more than once but time
    /// can't go backwards.
    pub fn push(&mut self, time: u64) -> Result<TimeIndex> {
        if let Some(last) = self.last() {
            if time < last {
                bail!("Time went backwards from #{last} to #{time}");
            }
        }
        Ok(self.times.push_and_get_key(time))
    }

    /// Append several markers. Nothing is appended unless all of them are
    /// in order.
    pub fn extend_from_slice(&mut self, times: &[u64]) -> Result<()> {
        let mut last = self.last();
        for &time in times {
            if let Some(last) = last {
                if time < last {
                    bail!("Time went backwards from #{last} to #{time}");
                }
            }
            last = Some(time);
        }
        self.times.raw.extend_from_slice(times);
        Ok(())
    }

    /// The index of the last marker at or before `time`.
    pub fn index_at_or_before(&self, time: u64) -> Option<TimeIndex> {
        let n = self.times.raw.partition_point(|&t| t <= time);
        n.checked_sub(1).map(TimeIndex)
    }
}

impl Index<TimeIndex> for TimeAxis {
    type Output = u64;

    fn index(&self, index: TimeIndex) -> &u64 {
        &self.times[index]
    }
}
