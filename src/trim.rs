use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Inclusive range of zero-based input frame indices to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: u64,
    pub end: u64,
}

/// Disjoint, sorted set of frame ranges. An empty set keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimRanges {
    ranges: Vec<TrimRange>,
}

impl TrimRanges {
    pub fn new(mut ranges: Vec<TrimRange>) -> PipelineResult<Self> {
        if let Some(bad) = ranges.iter().find(|r| r.start > r.end) {
            return Err(PipelineError::InvalidConfig(format!(
                "trim range {}..={} is reversed",
                bad.start, bad.end
            )));
        }
        ranges.sort_by_key(|r| r.start);
        if let Some(pair) = ranges.windows(2).find(|pair| pair[1].start <= pair[0].end) {
            return Err(PipelineError::InvalidConfig(format!(
                "trim ranges {}..={} and {}..={} overlap",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            )));
        }
        Ok(Self { ranges })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[TrimRange] {
        &self.ranges
    }

    pub fn keeps(&self, index: u64) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let position = self.ranges.partition_point(|r| r.end < index);
        self.ranges
            .get(position)
            .is_some_and(|range| range.start <= index)
    }

    pub fn kept_count(&self, total: u64) -> u64 {
        if self.ranges.is_empty() {
            return total;
        }
        self.ranges
            .iter()
            .filter(|r| r.start < total)
            .map(|r| r.end.min(total - 1) - r.start + 1)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(pairs: &[(u64, u64)]) -> TrimRanges {
        TrimRanges::new(
            pairs
                .iter()
                .map(|&(start, end)| TrimRange { start, end })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn keeps_only_indices_inside_ranges() {
        let trim = ranges(&[(10, 12), (2, 4)]);
        let kept: Vec<u64> = (0..15).filter(|i| trim.keeps(*i)).collect();
        assert_eq!(kept, vec![2, 3, 4, 10, 11, 12]);
        assert_eq!(trim.kept_count(15), 6);
        assert_eq!(trim.kept_count(11), 4);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let err = TrimRanges::new(vec![
            TrimRange { start: 0, end: 5 },
            TrimRange { start: 5, end: 8 },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }
}
