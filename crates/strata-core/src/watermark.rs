//! Per-level "last rolled up" hints
//!
//! Process-local and monotonic. The work queue stays the source of truth;
//! these only let the read path skip a coarse level that cannot contain
//! the requested range yet.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct RollupWatermarks {
    levels: Vec<AtomicI64>,
}

impl RollupWatermarks {
    pub fn new(level_count: usize) -> Self {
        Self {
            levels: (0..level_count).map(|_| AtomicI64::new(i64::MIN)).collect(),
        }
    }

    /// Record that `boundary` was rolled up at `level`. Never moves backwards.
    pub fn advance(&self, level: usize, boundary: i64) {
        if let Some(slot) = self.levels.get(level) {
            slot.fetch_max(boundary, Ordering::AcqRel);
        }
    }

    /// Latest boundary rolled up at `level` by this process.
    pub fn get(&self, level: usize) -> Option<i64> {
        self.levels
            .get(level)
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|v| *v != i64::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let marks = RollupWatermarks::new(3);
        assert_eq!(marks.get(1), None);
        marks.advance(1, 600_000);
        marks.advance(1, 300_000);
        assert_eq!(marks.get(1), Some(600_000));
        assert_eq!(marks.get(2), None);
    }

    #[test]
    fn unknown_level_is_ignored() {
        let marks = RollupWatermarks::new(2);
        marks.advance(9, 1);
        assert_eq!(marks.get(9), None);
    }
}
