use std::ops::Range;

//
// A torrent is a contiguous byte space divided into pieces of equal size, except the last one.
//

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PieceIndex(pub u32);

/// A byte range within one piece: `(index, offset, size)`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockRange(pub PieceIndex, pub u64, pub u64);

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Layout {
    size: u64,
    piece_size: u64,
}

impl Layout {
    pub(crate) fn new(size: u64, piece_size: u64) -> Self {
        assert!(piece_size > 0);
        Self { size, piece_size }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn piece_size(&self) -> u64 {
        self.piece_size
    }

    pub(crate) fn num_pieces(&self) -> u32 {
        self.size
            .div_ceil(self.piece_size)
            .try_into()
            .expect("num_pieces")
    }

    /// Returns the offset relative to the start of the torrent.
    pub(crate) fn piece_offset(&self, PieceIndex(index): PieceIndex) -> u64 {
        u64::from(index) * self.piece_size
    }

    /// Translates a torrent offset into a piece index and an offset within that piece.
    ///
    /// It accepts `offset` not only less than but also equal to the torrent size.
    pub(crate) fn to_piece_index(&self, offset: u64) -> (PieceIndex, u64) {
        assert!(offset <= self.size, "torrent offset out of range: {offset}");
        (
            PieceIndex((offset / self.piece_size).try_into().expect("piece index")),
            offset % self.piece_size,
        )
    }

    pub(crate) fn is_aligned(&self, offset: u64) -> bool {
        offset % self.piece_size == 0
    }

    /// Returns the pieces overlapping the torrent range `[start, end)`.
    pub(crate) fn index_range(&self, start: u64, end: u64) -> Range<PieceIndex> {
        if start >= end {
            return PieceIndex(0)..PieceIndex(0);
        }
        let (first, _) = self.to_piece_index(start);
        let (last, _) = self.to_piece_index(end - 1);
        first..PieceIndex(last.0 + 1)
    }
}

pub(crate) fn pieces(range: Range<PieceIndex>) -> impl Iterator<Item = PieceIndex> {
    (range.start.0..range.end.0).map(PieceIndex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(index: u32) -> PieceIndex {
        PieceIndex(index)
    }

    #[test]
    fn num_pieces() {
        assert_eq!(Layout::new(0, 16).num_pieces(), 0);
        assert_eq!(Layout::new(1, 16).num_pieces(), 1);
        assert_eq!(Layout::new(16, 16).num_pieces(), 1);
        assert_eq!(Layout::new(17, 16).num_pieces(), 2);
        assert_eq!(Layout::new(36, 16).num_pieces(), 3);
    }

    #[test]
    fn to_piece_index() {
        let layout = Layout::new(12, 5);
        assert_eq!(layout.to_piece_index(0), (i(0), 0));
        assert_eq!(layout.to_piece_index(4), (i(0), 4));
        assert_eq!(layout.to_piece_index(5), (i(1), 0));
        assert_eq!(layout.to_piece_index(11), (i(2), 1));
        assert_eq!(layout.to_piece_index(12), (i(2), 2));

        assert_eq!(layout.piece_offset(i(0)), 0);
        assert_eq!(layout.piece_offset(i(2)), 10);
    }

    #[test]
    #[should_panic(expected = "torrent offset out of range: 13")]
    fn to_piece_index_panic() {
        let _ = Layout::new(12, 5).to_piece_index(13);
    }

    #[test]
    fn index_range() {
        let layout = Layout::new(36, 16);
        assert_eq!(layout.index_range(0, 10), i(0)..i(1));
        assert_eq!(layout.index_range(10, 30), i(0)..i(2));
        assert_eq!(layout.index_range(30, 36), i(1)..i(3));
        assert_eq!(layout.index_range(16, 32), i(1)..i(2));
        assert_eq!(layout.index_range(0, 36), i(0)..i(3));
        assert_eq!(layout.index_range(10, 10), i(0)..i(0));

        assert_eq!(
            pieces(layout.index_range(10, 30)).collect::<Vec<_>>(),
            &[i(0), i(1)],
        );
    }
}
