//! Balanced subdivision of sort-index ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FanoutConfig;
use crate::error::SweepError;

/// Half-open range `[start, end)` over sort indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: u64,
    pub end: u64,
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Result<Self, SweepError> {
        if start > end {
            return Err(SweepError::PartitionInvariant(format!(
                "range start {} is past its end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Whether a node executes its range directly instead of splitting it
pub fn is_base_case(range: IndexRange, depth: u32, fanout: &FanoutConfig) -> bool {
    range.len() <= fanout.leaf_batch_size as u64 || depth >= fanout.max_depth
}

/// Split a range into `min(branching_factor, len)` contiguous children
///
/// Sizes differ by at most one; with `len = q * k + r` the first `r` children
/// get `q + 1` records and the rest get `q`.
pub fn split_range(range: IndexRange, branching_factor: usize) -> Vec<IndexRange> {
    let len = range.len();
    let count = (branching_factor as u64).min(len);
    if count == 0 {
        return Vec::new();
    }

    let base = len / count;
    let remainder = len % count;

    let mut children = Vec::with_capacity(count as usize);
    let mut start = range.start;
    for i in 0..count {
        let size = base + u64::from(i < remainder);
        children.push(IndexRange {
            start,
            end: start + size,
        });
        start += size;
    }
    children
}

/// Check that `children` tile `parent` exactly, in order, without empties
pub fn verify_partition(parent: IndexRange, children: &[IndexRange]) -> Result<(), SweepError> {
    let violation = |message: String| {
        Err(SweepError::PartitionInvariant(format!(
            "children of {}: {}",
            parent, message
        )))
    };

    let mut cursor = parent.start;
    for child in children {
        if child.start != cursor {
            let kind = if child.start > cursor { "gap" } else { "overlap" };
            return violation(format!("{} at {} before child {}", kind, cursor, child));
        }
        if child.is_empty() {
            return violation(format!("empty child {}", child));
        }
        cursor = child.end;
    }

    if cursor != parent.end {
        return violation(format!("coverage ends at {} instead of {}", cursor, parent.end));
    }
    Ok(())
}
