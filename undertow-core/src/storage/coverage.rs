//! Received-byte bookkeeping for a partially written piece.

use std::ops::Range;

/// Sorted, non-overlapping, non-adjacent byte ranges written so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    ranges: Vec<Range<u32>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `range` as written, merging with neighbours.
    pub fn insert(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.end < merged.start || existing.start > merged.end {
                kept.push(existing);
            } else {
                merged = merged.start.min(existing.start)..merged.end.max(existing.end);
            }
        }
        let position = kept
            .iter()
            .position(|r| r.start > merged.start)
            .unwrap_or(kept.len());
        kept.insert(position, merged);
        self.ranges = kept;
    }

    /// Total bytes covered.
    pub fn covered(&self) -> u32 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_complete(&self, length: u32) -> bool {
        matches!(self.ranges.as_slice(), [only] if only.start == 0 && only.end >= length)
    }

    /// Gaps in `[0, length)`, split into chunks of at most `block` bytes.
    pub fn missing(&self, length: u32, block: u32) -> Vec<Range<u32>> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for range in self.ranges.iter().chain(std::iter::once(&(length..length))) {
            let gap_end = range.start.min(length);
            while cursor < gap_end {
                let end = (cursor + block).min(gap_end);
                gaps.push(cursor..end);
                cursor = end;
            }
            cursor = cursor.max(range.end);
        }
        gaps
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
