//! Redirects the cross-piece parts of disabled files to partial files.
//!
//! When a file is disabled, the pieces it shares with its neighbors should remain downloadable and
//! verifiable.  We redirect the shared parts -- the prefix before the first piece boundary and the
//! suffix after the last piece boundary -- to small files in a buffer directory:
//!
//! * `"{index}"`: The whole file, when it lies within one piece.
//! * `"{index}b"`: The prefix, when the file does not start on a piece boundary.
//! * `"{index}e"`: The suffix, when the file does not end on a piece boundary.
//!
//! The last file never has a suffix, as there is no piece after it to share with.  A file within
//! one piece gets no partial file only when it starts and ends on piece boundaries.
//!
//! The interior of a disabled file keeps pointing to the original file.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Error;
use crate::layout::{BlockRange, Layout, PieceIndex};

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Target {
    /// A partial file in the buffer directory.
    Partial(String),
    /// The original file, starting at the given offset.
    Original(u64),
}

/// A `[begin, end)` range of the torrent space and where it is redirected to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Redirect {
    pub(crate) begin: u64,
    pub(crate) end: u64,
    pub(crate) target: Target,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct DisabledRanges {
    /// Sorted by `begin`.
    pub(crate) redirects: Vec<Redirect>,
    /// Pieces that have to be verified again when the file is enabled or disabled.
    pub(crate) piece_updates: Vec<BlockRange>,
}

#[derive(Debug, Default)]
pub(crate) struct DisabledFileRouter {
    buffer_dir: Option<PathBuf>,
    cache: HashMap<usize, Arc<DisabledRanges>>,
}

impl DisabledRanges {
    pub(crate) fn new(index: usize, Range { start, end }: Range<u64>, layout: &Layout) -> Self {
        let mut this = Self::default();
        let pieces = layout.index_range(start, end);
        if pieces.is_empty() {
            return this;
        }
        let first = pieces.start;
        let last = PieceIndex(pieces.end.0 - 1);

        if first == last {
            if !(layout.is_aligned(start) && layout.is_aligned(end)) {
                this.push_partial(index.to_string(), start, end);
                this.piece_updates.push(BlockRange(
                    first,
                    start - layout.piece_offset(first),
                    end - start,
                ));
            }
            return this;
        }

        let mut interior = start..end;

        if !layout.is_aligned(start) {
            let prefix_end = layout.piece_offset(PieceIndex(first.0 + 1));
            this.push_partial(format!("{index}b"), start, prefix_end);
            this.piece_updates.push(BlockRange(
                first,
                start - layout.piece_offset(first),
                prefix_end - start,
            ));
            interior.start = prefix_end;
        }

        let suffix_start = layout.piece_offset(last);
        let has_suffix = !layout.is_aligned(end) && end != layout.size();
        if has_suffix {
            interior.end = suffix_start;
        }

        if !interior.is_empty() {
            this.redirects.push(Redirect {
                begin: interior.start,
                end: interior.end,
                target: Target::Original(interior.start - start),
            });
        }

        if has_suffix {
            this.push_partial(format!("{index}e"), suffix_start, end);
            this.piece_updates
                .push(BlockRange(last, 0, end - suffix_start));
        }

        this
    }

    fn push_partial(&mut self, name: String, begin: u64, end: u64) {
        self.redirects.push(Redirect {
            begin,
            end,
            target: Target::Partial(name),
        });
    }

    /// Returns the names and the torrent ranges of the partial files.
    #[cfg(test)]
    pub(crate) fn partial_files(&self) -> impl Iterator<Item = (&str, Range<u64>)> {
        self.redirects
            .iter()
            .filter_map(|redirect| match &redirect.target {
                Target::Partial(name) => Some((name.as_str(), redirect.begin..redirect.end)),
                Target::Original(_) => None,
            })
    }
}

impl DisabledFileRouter {
    pub(crate) fn new(buffer_dir: Option<PathBuf>) -> Self {
        Self {
            buffer_dir,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn buffer_dir(&self) -> Option<&Path> {
        self.buffer_dir.as_deref()
    }

    pub(crate) fn set_buffer_dir(&mut self, buffer_dir: PathBuf) {
        self.buffer_dir = Some(buffer_dir);
    }

    /// Returns the (memoized) disabled ranges of a file, where `range` is its torrent range.
    pub(crate) fn get(
        &mut self,
        index: usize,
        range: Option<Range<u64>>,
        layout: &Layout,
    ) -> Arc<DisabledRanges> {
        self.cache
            .entry(index)
            .or_insert_with(|| {
                Arc::new(
                    range
                        .map(|range| DisabledRanges::new(index, range, layout))
                        .unwrap_or_default(),
                )
            })
            .clone()
    }

    pub(crate) fn partial_path(&self, name: &str) -> Result<PathBuf, Error> {
        self.buffer_dir
            .as_ref()
            .map(|buffer_dir| buffer_dir.join(name))
            .ok_or(Error::BufferDirUnset)
    }
}
