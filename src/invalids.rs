//! Tracks tombstoned byte ranges in the log and decides when garbage
//! collection pays off.

use itertools::Itertools as _;

/// Garbage-collect once this many tombstoned records accumulate,
/// regardless of their byte volume.
pub const BASE_GC_KEYS_THRESHOLD: usize = 80;

/// A half-open tombstoned byte range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

/// The ordered list of tombstoned ranges plus their total byte count.
/// Every tombstoned record in the log is covered by exactly one segment;
/// `bytes` always equals the sum of the segment lengths.
#[derive(Default)]
pub struct Invalids {
    segments: Vec<Segment>,
    bytes: usize,
}

impl Invalids {
    /// Records a newly tombstoned range.
    pub fn count(&mut self, start: usize, end: usize) {
        self.segments.push(Segment { start, end });
        self.bytes += end - start;
    }

    /// Sorts segments by start and coalesces adjacent ones. Idempotent;
    /// the covered byte set and total are unchanged.
    pub fn merge(&mut self) {
        self.segments.sort_unstable_by_key(|segment| segment.start);
        self.segments = std::mem::take(&mut self.segments)
            .into_iter()
            .coalesce(|a, b| {
                if a.end == b.start {
                    Ok(Segment { start: a.start, end: b.end })
                } else {
                    Err((a, b))
                }
            })
            .collect();
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.bytes = 0;
    }

    /// Whether the accumulated garbage justifies a collection, by segment
    /// count or by byte volume relative to the current log size.
    pub fn should_gc(&self, data_end: usize) -> bool {
        self.len() >= BASE_GC_KEYS_THRESHOLD || self.bytes >= gc_bytes_threshold(data_end)
    }
}

/// The byte-volume GC threshold scales with the log size: small logs
/// collect at 4 KiB of garbage, mid-size at 8 KiB, large at 16 KiB.
pub fn gc_bytes_threshold(data_end: usize) -> usize {
    if data_end <= 16 << 10 {
        4 << 10
    } else if data_end <= 64 << 10 {
        8 << 10
    } else {
        16 << 10
    }
}
