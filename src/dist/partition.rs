//! Splitting an index domain into tasks.

use std::fmt;
use std::ops::Range;

/// Half-open index range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Task {
    /// First index.
    pub start: u64,
    /// One past the last index.
    pub end: u64,
}

impl Task {
    /// Create a task. `end` is clamped to be at least `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Number of indices.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the task covers no index.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// As a `Range`.
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<Range<u64>> for Task {
    fn from(r: Range<u64>) -> Self {
        Self::new(r.start, r.end)
    }
}

/// Split `[start, end)` into at most `parts` contiguous, disjoint, non-empty
/// tasks whose union is the whole range. Sizes differ by at most one.
///
/// `parts == 0` is treated as 1; an empty range yields no task.
pub fn partition(start: u64, end: u64, parts: usize) -> Vec<Task> {
    if end <= start {
        return Vec::new();
    }
    let total = end - start;
    let parts = (parts.max(1) as u64).min(total);
    let base = total / parts;
    let extra = total % parts;

    let mut tasks = Vec::with_capacity(parts as usize);
    let mut cursor = start;
    for i in 0..parts {
        let len = base + u64::from(i < extra);
        tasks.push(Task::new(cursor, cursor + len));
        cursor += len;
    }
    tasks
}

/// Split `[start, end)` into tasks of at most `chunk` indices.
pub fn chunks(start: u64, end: u64, chunk: u64) -> Vec<Task> {
    let chunk = chunk.max(1);
    let mut tasks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor.saturating_add(chunk).min(end);
        tasks.push(Task::new(cursor, next));
        cursor = next;
    }
    tasks
}
