use serde::{Deserialize, Serialize};

/// Half-open index range `[start, end)` selected for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub start: u64,
    pub end: u64,
    pub has_work: bool,
}

impl CursorRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> Vec<u64> {
        (self.start..self.end).collect()
    }
}

/// Next contiguous slice of an append-only list to process.
///
/// `cursor` is the last persisted progress (the next index to read). The
/// caller must persist `cursor = end` in the same transaction as the batch's
/// writes. A zero `chunk_size` is treated as one.
pub fn next_range(network_total: u64, cursor: u64, chunk_size: u64) -> CursorRange {
    if cursor >= network_total {
        return CursorRange {
            start: cursor,
            end: cursor,
            has_work: false,
        };
    }

    let end = network_total.min(cursor.saturating_add(chunk_size.max(1)));
    CursorRange {
        start: cursor,
        end,
        has_work: true,
    }
}
