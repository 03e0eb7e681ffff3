//! Container compaction.
//!
//! Rewrites the container as `[header][index][reserve][live bytes...]`,
//! dropping every superseded or deleted range. The index stores absolute
//! offsets, and the offsets depend on where the index ends, so the layout
//! is found by fixed-point iteration.

use std::time::Duration;

use strata_types::{VfsError, VfsResult};

use super::index::{Extent, Index};
use super::store::{BinaryStore, HEADER_LEN};

/// Upper bound on layout iterations before giving up.
pub const MAX_LAYOUT_ITERATIONS: usize = 16;

/// How soon a compaction should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Not enough waste to bother.
    None,
    /// Debounced, then deferred to an idle moment.
    Scheduled,
    /// Synchronously, before the mutation returns.
    Urgent,
}

/// Thresholds and timings for compaction.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    /// Wasted bytes at which a compaction is scheduled.
    pub low_water: u64,
    /// Wasted bytes at which a compaction runs immediately.
    pub high_water: u64,
    /// Quiet period before a scheduled compaction becomes due.
    pub debounce: Duration,
    /// How long the store must be untouched to count as idle.
    pub idle_window: Duration,
    /// Run a due compaction after this long even if never idle.
    pub idle_timeout: Duration,
    /// Slack left after the index so it can grow without a rewrite.
    pub index_reserve: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            low_water: 1024 * 1024,
            high_water: 16 * 1024 * 1024,
            debounce: Duration::from_millis(1000),
            idle_window: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(5000),
            index_reserve: 4096,
        }
    }
}

impl CompactionPolicy {
    /// Classify the current amount of waste.
    pub fn assess(&self, wasted: u64) -> Urgency {
        if wasted >= self.high_water {
            Urgency::Urgent
        } else if wasted >= self.low_water {
            Urgency::Scheduled
        } else {
            Urgency::None
        }
    }
}

/// A converged container layout.
#[derive(Debug)]
pub struct Layout {
    /// The index with every extent moved to its new offset.
    pub index: Index,
    /// Its serialized form.
    pub index_bytes: Vec<u8>,
    /// Where file data begins.
    pub data_start: u64,
    /// New end of the container.
    pub end: u64,
}

/// Outcome of a compaction, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub before: u64,
    pub after: u64,
    pub live_bytes: u64,
}

impl CompactionReport {
    /// Container bytes given back.
    pub fn reclaimed(&self) -> u64 {
        self.before.saturating_sub(self.after)
    }
}

/// Pack every extent contiguously from `start` in path order.
fn relocate(index: &Index, start: u64) -> (Index, u64) {
    let mut packed = index.clone();
    let mut offset = start;
    for extent in packed.files.values_mut() {
        *extent = Extent {
            offset,
            size: extent.size,
        };
        offset += extent.size;
    }
    (packed, offset)
}

/// Find a layout whose header+index size is consistent with the offsets it encodes.
pub fn plan_layout(index: &Index, reserve: u64) -> VfsResult<Layout> {
    let mut data_start = HEADER_LEN + reserve;
    for _ in 0..MAX_LAYOUT_ITERATIONS {
        let (packed, end) = relocate(index, data_start);
        let index_bytes = packed.encode()?;
        let needed = HEADER_LEN + index_bytes.len() as u64 + reserve;
        if needed == data_start {
            return Ok(Layout {
                index: packed,
                index_bytes,
                data_start,
                end,
            });
        }
        data_start = needed;
    }
    Err(VfsError::corruption("compaction layout did not converge"))
}

/// Rewrite the container so only live bytes remain.
///
/// Reads every live extent into memory first, so the rewrite may overlap
/// the old ranges freely. On success `index` holds the new offsets.
pub fn compact(
    store: &mut BinaryStore,
    index: &mut Index,
    reserve: u64,
) -> VfsResult<CompactionReport> {
    let before = store.len();
    let layout = plan_layout(index, reserve)?;

    let mut blobs = Vec::with_capacity(index.files.len());
    for (path, extent) in &index.files {
        let bytes = store.read_at(extent.offset, extent.size)?;
        let target = layout.index.files.get(path).copied().ok_or_else(|| {
            VfsError::corruption(format!("{path} vanished from compaction layout"))
        })?;
        blobs.push((target, bytes));
    }

    store.write_index(&layout.index_bytes)?;
    for (target, bytes) in &blobs {
        store.write_at(target.offset, bytes)?;
    }
    store.set_len(layout.end)?;
    store.sync()?;

    let live_bytes = layout.index.live_bytes();
    *index = layout.index;
    Ok(CompactionReport {
        before,
        after: layout.end,
        live_bytes,
    })
}
