use std::path::Path;
use std::sync::Arc;

/// A `[begin, end)` range of the torrent space backed by `path` starting at `offset`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct WorkingRange {
    pub(crate) begin: u64,
    pub(crate) end: u64,
    pub(crate) offset: u64,
    pub(crate) path: Arc<Path>,
}

/// A `[begin, end)` range within a file, which starts at `pos` in the torrent space.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Segment {
    pub(crate) pos: u64,
    pub(crate) path: Arc<Path>,
    pub(crate) begin: u64,
    pub(crate) end: u64,
}

/// Translates torrent ranges into file ranges.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct RangeMap {
    ranges: Vec<WorkingRange>,
    /// `begins[i] == ranges[i].begin`, for binary search.
    begins: Vec<u64>,
}

impl WorkingRange {
    pub(crate) fn new(begin: u64, end: u64, offset: u64, path: Arc<Path>) -> Self {
        assert!(begin < end, "expect non-empty range: {begin}..{end}");
        Self {
            begin,
            end,
            offset,
            path,
        }
    }

    /// Returns the file offset of the range end.
    pub(crate) fn file_end(&self) -> u64 {
        self.offset + (self.end - self.begin)
    }
}

impl Segment {
    pub(crate) fn len(&self) -> u64 {
        self.end - self.begin
    }
}

impl RangeMap {
    /// Creates a map from ranges sorted by `begin`.
    pub(crate) fn new(ranges: impl IntoIterator<Item = WorkingRange>) -> Self {
        let ranges: Vec<_> = ranges.into_iter().collect();
        assert!(
            ranges.windows(2).all(|w| w[0].end <= w[1].begin),
            "expect sorted and disjoint ranges: {ranges:?}",
        );
        let begins = ranges.iter().map(|range| range.begin).collect();
        Self { ranges, begins }
    }

    #[cfg(test)]
    pub(crate) fn ranges(&self) -> &[WorkingRange] {
        &self.ranges
    }

    /// Returns the file segments of the torrent range `[pos, pos + size)`, in torrent order.
    ///
    /// Parts of the torrent range not covered by any working range (holes) are skipped.
    pub(crate) fn intervals(&self, pos: u64, size: u64) -> Vec<Segment> {
        let stop = pos + size;
        let mut segments = Vec::new();
        if size == 0 {
            return segments;
        }
        let start = self.begins.partition_point(|begin| *begin <= pos).saturating_sub(1);
        for range in &self.ranges[start..] {
            if range.begin >= stop {
                break;
            }
            if range.end <= pos {
                continue;
            }
            segments.push(Segment {
                pos: pos.max(range.begin),
                path: range.path.clone(),
                begin: range.offset + pos.max(range.begin) - range.begin,
                end: range.offset + range.end.min(stop) - range.begin,
            });
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> Arc<Path> {
        Path::new(name).into()
    }

    fn r(begin: u64, end: u64, offset: u64, name: &str) -> WorkingRange {
        WorkingRange::new(begin, end, offset, path(name))
    }

    fn s(pos: u64, name: &str, begin: u64, end: u64) -> Segment {
        Segment {
            pos,
            path: path(name),
            begin,
            end,
        }
    }

    fn new_map() -> RangeMap {
        RangeMap::new([r(0, 10, 0, "a"), r(10, 30, 0, "b"), r(30, 36, 0, "c")])
    }

    #[test]
    fn new() {
        let map = new_map();
        assert_eq!(map.begins, &[0, 10, 30]);
        assert_eq!(map.ranges().len(), 3);
        assert_eq!(map.ranges()[1].file_end(), 20);

        assert_eq!(RangeMap::new([]), RangeMap::default());
    }

    #[test]
    #[should_panic(expected = "expect sorted and disjoint ranges")]
    fn new_unsorted() {
        let _ = RangeMap::new([r(10, 30, 0, "b"), r(0, 10, 0, "a")]);
    }

    #[test]
    fn intervals() {
        let map = new_map();
        assert_eq!(
            map.intervals(0, 36),
            &[s(0, "a", 0, 10), s(10, "b", 0, 20), s(30, "c", 0, 6)],
        );
        assert_eq!(map.intervals(8, 4), &[s(8, "a", 8, 10), s(10, "b", 0, 2)]);
        assert_eq!(map.intervals(10, 20), &[s(10, "b", 0, 20)]);
        assert_eq!(map.intervals(12, 3), &[s(12, "b", 2, 5)]);
        assert_eq!(
            map.intervals(29, 2),
            &[s(29, "b", 19, 20), s(30, "c", 0, 1)],
        );
        assert_eq!(map.intervals(35, 1), &[s(35, "c", 5, 6)]);
        assert!(map.intervals(36, 0).is_empty());
        assert!(map.intervals(5, 0).is_empty());

        for pos in 0..36 {
            for size in 0..=(36 - pos) {
                let segments = map.intervals(pos, size);
                let total: u64 = segments.iter().map(Segment::len).sum();
                assert_eq!(total, size, "pos={pos} size={size}");
                let mut expect = pos;
                for segment in &segments {
                    assert_eq!(segment.pos, expect);
                    expect += segment.len();
                }
            }
        }
    }

    #[test]
    fn intervals_redirected() {
        // File "b" redirected to a prefix and a suffix buffer with an interior part.
        let map = RangeMap::new([
            r(0, 10, 0, "a"),
            r(10, 16, 0, "1b"),
            r(16, 20, 6, "b"),
            r(20, 30, 0, "1e"),
            r(30, 36, 0, "c"),
        ]);
        assert_eq!(
            map.intervals(8, 20),
            &[
                s(8, "a", 8, 10),
                s(10, "1b", 0, 6),
                s(16, "b", 6, 10),
                s(20, "1e", 0, 8),
            ],
        );

        let map = RangeMap::new([r(0, 10, 0, "a"), r(20, 36, 0, "c")]);
        assert!(map.intervals(12, 4).is_empty());
        assert_eq!(
            map.intervals(8, 14),
            &[s(8, "a", 8, 10), s(20, "c", 0, 2)],
        );
    }
}
