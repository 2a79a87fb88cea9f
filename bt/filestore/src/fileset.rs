use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use snafu::prelude::*;

use crate::config::Config;
use crate::error::{
    AbortedSnafu, BadGeometrySnafu, Error, ExpectNonZeroPieceSizeSnafu, InvalidDisabledListSnafu,
    InvalidFileIndexSnafu, InvalidRangeSnafu, IoSnafu, OpenSnafu, ReadSnafu, ShortReadSnafu,
    WriteSnafu,
};
use crate::handle::{HandleCache, Mode};
use crate::layout::{self, BlockRange, Layout, PieceIndex};
use crate::lock::LockStrategy;
use crate::partial::{DisabledFileRouter, Target};
use crate::range_map::{RangeMap, Segment, WorkingRange};
use crate::resume::{FileRecord, PartialFileRecord, Recorded, ResumeRecord};
use crate::stat::{FileStat, FileStats};

const MAX_READ_CHUNK: u64 = 32 * 1024;

pub(crate) const TOP_OFF_BYTE: u8 = 0xff;

#[derive(Debug)]
struct FileEntry {
    path: Arc<Path>,
    length: u64,
    /// Torrent range; `None` for empty files.
    range: Option<Range<u64>>,
}

/// Partial file installed for a disabled file.
#[derive(Debug)]
struct Installed {
    name: String,
    path: Arc<Path>,
}

/// The file table and everything derived from it.
///
/// Every method expects the caller to hold the storage-wide lock.
#[derive(Debug)]
pub(crate) struct FileSet {
    files: Vec<FileEntry>,
    disabled: Vec<bool>,
    /// Working ranges per file.
    working: Vec<Vec<WorkingRange>>,
    partials: Vec<Vec<Installed>>,
    map: RangeMap,
    layout: Layout,
    stats: FileStats,
    handles: HandleCache,
    router: DisabledFileRouter,
}

impl FileSet {
    pub(crate) fn open(
        files: &[(PathBuf, u64)],
        piece_size: u64,
        done: &AtomicBool,
        disabled: Option<&[bool]>,
        config: &Config,
    ) -> Result<Self, Error> {
        ensure!(piece_size > 0, ExpectNonZeroPieceSizeSnafu);
        let disabled = match disabled {
            Some(disabled) => {
                ensure!(
                    disabled.len() == files.len(),
                    InvalidDisabledListSnafu {
                        len: disabled.len(),
                        expect: files.len(),
                    },
                );
                disabled.to_vec()
            }
            None => vec![false; files.len()],
        };

        let mut stats = FileStats::new(config.mtime_tolerance);
        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0;
        for ((path, length), disabled) in files.iter().zip(&disabled) {
            ensure!(!done.load(Ordering::SeqCst), AbortedSnafu);

            let path: Arc<Path> = path.as_path().into();
            let length = *length;
            let range = (length > 0).then(|| offset..offset + length);
            offset += length;

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
            }
            stats.insert(path.clone(), FileStat::new(length));
            if !disabled {
                prepare(&path, length)?;
                stats.refresh(&path)?;
            }

            entries.push(FileEntry {
                path,
                length,
                range,
            });
        }

        let num_nonempty = entries.iter().filter(|entry| entry.length > 0).count();
        let max_open =
            NonZeroUsize::new(config.max_files_open).filter(|max| num_nonempty > max.get());
        let handles = HandleCache::new(
            max_open,
            LockStrategy::new(config.lock_files),
            config.lock_while_reading,
        );

        let working: Vec<Vec<_>> = entries
            .iter()
            .map(|entry| entry.original_range().into_iter().collect())
            .collect();
        let mut this = Self {
            partials: entries.iter().map(|_| Vec::new()).collect(),
            files: entries,
            disabled: vec![false; disabled.len()],
            working,
            map: RangeMap::default(),
            layout: Layout::new(offset, piece_size),
            stats,
            handles,
            router: DisabledFileRouter::new(config.buffer_dir.clone()),
        };
        for (index, disabled) in disabled.into_iter().enumerate() {
            if disabled {
                this.install_disabled(index)?;
                this.disabled[index] = true;
            }
        }
        this.rebuild();

        tracing::info!(
            num_files = this.files.len(),
            total = this.layout.size(),
            piece_size,
            bounded = this.handles.is_bounded(),
            "open",
        );
        Ok(this)
    }

    //
    // Queries.
    //

    pub(crate) fn num_files(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn total_length(&self) -> u64 {
        self.layout.size()
    }

    pub(crate) fn piece_size(&self) -> u64 {
        self.layout.piece_size()
    }

    pub(crate) fn num_pieces(&self) -> u32 {
        self.layout.num_pieces()
    }

    pub(crate) fn file_range(&self, index: usize) -> Result<Option<Range<u64>>, Error> {
        Ok(self.entry(index)?.range.clone())
    }

    pub(crate) fn piece_range(&self, index: usize) -> Result<Range<PieceIndex>, Error> {
        Ok(self.pieces_of(self.entry(index)?))
    }

    pub(crate) fn is_disabled(&self, index: usize) -> Result<bool, Error> {
        self.entry(index)?;
        Ok(self.disabled[index])
    }

    fn entry(&self, index: usize) -> Result<&FileEntry, Error> {
        self.files.get(index).context(InvalidFileIndexSnafu {
            index,
            len: self.files.len(),
        })
    }

    fn pieces_of(&self, entry: &FileEntry) -> Range<PieceIndex> {
        match &entry.range {
            Some(range) => self.layout.index_range(range.start, range.end),
            None => PieceIndex(0)..PieceIndex(0),
        }
    }

    fn check_range(&self, pos: u64, size: u64) -> Result<(), Error> {
        let total = self.layout.size();
        ensure!(
            pos.checked_add(size).is_some_and(|end| end <= total),
            InvalidRangeSnafu { pos, size, total },
        );
        Ok(())
    }

    pub(crate) fn intervals(&self, pos: u64, size: u64) -> Result<Vec<Segment>, Error> {
        self.check_range(pos, size)?;
        Ok(self.map.intervals(pos, size))
    }

    //
    // I/O.
    //

    /// Appends the content of the segment to `buffer`.
    pub(crate) fn read_segment(
        &mut self,
        segment: &Segment,
        flush_first: bool,
        buffer: &mut BytesMut,
    ) -> Result<(), Error> {
        let path = &segment.path;
        if flush_first {
            self.handles.flush(path)?;
        }
        let handle = self.handles.get(path, Mode::Read, &mut self.stats)?;
        handle
            .file
            .seek(SeekFrom::Start(segment.begin))
            .context(ReadSnafu {
                path: path.to_path_buf(),
            })?;
        let mut offset = segment.begin;
        while offset < segment.end {
            let size = (segment.end - offset).min(MAX_READ_CHUNK) as usize;
            let start = buffer.len();
            buffer.resize(start + size, 0);
            let actual = read_full(&mut handle.file, &mut buffer[start..]).context(ReadSnafu {
                path: path.to_path_buf(),
            })?;
            if actual < size {
                buffer.truncate(start + actual);
                return ShortReadSnafu {
                    path: path.to_path_buf(),
                    offset,
                    size,
                    actual,
                }
                .fail();
            }
            offset += size as u64;
        }
        Ok(())
    }

    pub(crate) fn write_segment(&mut self, segment: &Segment, data: &[u8]) -> Result<(), Error> {
        assert_eq!(data.len() as u64, segment.len());
        let path = &segment.path;
        let handle = self.handles.get(path, Mode::ReadWrite, &mut self.stats)?;
        handle
            .file
            .seek(SeekFrom::Start(segment.begin))
            .and_then(|_| handle.file.write_all(data))
            .context(WriteSnafu {
                path: path.to_path_buf(),
            })
    }

    pub(crate) fn flush(&mut self) -> Result<(), Error> {
        self.handles.flush_all()
    }

    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.handles.sync_all_writers(&mut self.stats)
    }

    pub(crate) fn close(&mut self) {
        self.handles.close_all(&mut self.stats);
    }

    pub(crate) fn was_preallocated(&self, pos: u64, size: u64) -> Result<bool, Error> {
        Ok(self
            .intervals(pos, size)?
            .iter()
            .all(|segment| self.stats.size(&segment.path) >= segment.end))
    }

    /// Extends every backing file to the length the torrent expects.
    ///
    /// The original file of a disabled file is created when its interior needs it.
    pub(crate) fn top_off(&mut self) -> Result<(), Error> {
        let mut targets = Vec::new();
        for (index, ranges) in self.working.iter().enumerate() {
            let entry = &self.files[index];
            for range in ranges {
                let interior = self.disabled[index] && range.path == entry.path;
                let create = interior.then_some(entry.length);
                targets.push((range.path.clone(), range.file_end(), create));
            }
        }

        for (path, end, create) in targets {
            if self.stats.size(&path) >= end {
                continue;
            }
            if let Some(length) = create.filter(|_| !path.exists()) {
                prepare(&path, length)?;
                self.stats.refresh(&path)?;
            }
            let handle = self.handles.get(&path, Mode::ReadWrite, &mut self.stats)?;
            // The recorded size might be stale when there are unsynced writes.
            let size = handle
                .file
                .metadata()
                .context(IoSnafu {
                    path: path.to_path_buf(),
                })?
                .len();
            if size < end {
                tracing::debug!(path = %path.display(), size, end, "top_off");
                handle
                    .file
                    .seek(SeekFrom::Start(end - 1))
                    .and_then(|_| handle.file.write_all(&[TOP_OFF_BYTE]))
                    .context(WriteSnafu {
                        path: path.to_path_buf(),
                    })?;
            }
            self.stats.extend(&path, end);
        }
        Ok(())
    }

    //
    // Enable and disable.
    //

    pub(crate) fn enable(&mut self, index: usize) -> Result<(), Error> {
        let entry = self.entry(index)?;
        if !self.disabled[index] {
            return Ok(());
        }
        let (path, length) = (entry.path.clone(), entry.length);
        let original = entry.original_range();

        for Installed { path, .. } in std::mem::take(&mut self.partials[index]) {
            self.handles.close(&path, &mut self.stats)?;
        }
        prepare(&path, length)?;
        self.stats.refresh(&path)?;

        self.working[index] = original.into_iter().collect();
        self.disabled[index] = false;
        self.rebuild();
        tracing::info!(index, path = %path.display(), "enable");
        Ok(())
    }

    pub(crate) fn disable(&mut self, index: usize) -> Result<(), Error> {
        let path = self.entry(index)?.path.clone();
        if self.disabled[index] {
            return Ok(());
        }
        self.handles.close_writer(&path, &mut self.stats)?;
        self.install_disabled(index)?;
        self.disabled[index] = true;
        self.rebuild();
        tracing::info!(index, path = %path.display(), "disable");
        Ok(())
    }

    /// Redirects the working ranges of a file to its partial files, creating them as needed.
    fn install_disabled(&mut self, index: usize) -> Result<(), Error> {
        let FileEntry { path, range, .. } = &self.files[index];
        let path = path.clone();
        let ranges = self.router.get(index, range.clone(), &self.layout);

        let mut working = Vec::with_capacity(ranges.redirects.len());
        let mut partials = Vec::new();
        for redirect in &ranges.redirects {
            let (target, offset) = match &redirect.target {
                Target::Partial(name) => {
                    let partial: Arc<Path> = self.router.partial_path(name)?.into();
                    partials.push((
                        Installed {
                            name: name.clone(),
                            path: partial.clone(),
                        },
                        redirect.end - redirect.begin,
                    ));
                    (partial, 0)
                }
                Target::Original(offset) => (path.clone(), *offset),
            };
            working.push(WorkingRange::new(
                redirect.begin,
                redirect.end,
                offset,
                target,
            ));
        }

        if let Some(buffer_dir) = self.router.buffer_dir().filter(|_| !partials.is_empty()) {
            fs::create_dir_all(buffer_dir).context(IoSnafu { path: buffer_dir })?;
        }
        let mut installed = Vec::with_capacity(partials.len());
        for (partial, length) in partials {
            prepare(&partial.path, length)?;
            self.stats
                .insert(partial.path.clone(), FileStat::new(length));
            self.stats.refresh(&partial.path)?;
            tracing::debug!(index, path = %partial.path.display(), length, "partial");
            installed.push(partial);
        }

        self.working[index] = working;
        self.partials[index] = installed;
        Ok(())
    }

    pub(crate) fn piece_update_list(&mut self, index: usize) -> Result<Vec<BlockRange>, Error> {
        let range = self.entry(index)?.range.clone();
        Ok(self
            .router
            .get(index, range, &self.layout)
            .piece_updates
            .clone())
    }

    pub(crate) fn set_buffer_dir(&mut self, buffer_dir: PathBuf) {
        tracing::info!(buffer_dir = %buffer_dir.display(), "set_buffer_dir");
        self.router.set_buffer_dir(buffer_dir);
    }

    fn rebuild(&mut self) {
        self.map = RangeMap::new(self.working.iter().flatten().cloned());
    }

    //
    // Miscellaneous.
    //

    /// Closes the write handles of a file, or of all files when `index` is `None`.
    pub(crate) fn set_readonly(&mut self, index: Option<usize>) -> Result<(), Error> {
        let Some(index) = index else {
            return self.sync();
        };
        let path = self.entry(index)?.path.clone();
        self.handles.close_writer(&path, &mut self.stats)?;
        for Installed { path, .. } in &self.partials[index] {
            self.handles.close_writer(path, &mut self.stats)?;
        }
        Ok(())
    }

    /// Removes a file from disk, ignoring errors.
    pub(crate) fn delete_file(&mut self, index: usize) -> Result<(), Error> {
        let entry = self.entry(index)?;
        let (path, length) = (entry.path.clone(), entry.length);
        if let Err(error) = self.handles.close(&path, &mut self.stats) {
            tracing::warn!(path = %path.display(), %error, "delete_file: close");
        }
        match fs::remove_file(&path) {
            Ok(()) => tracing::info!(index, path = %path.display(), "delete_file"),
            Err(error) => tracing::warn!(path = %path.display(), %error, "delete_file"),
        }
        self.stats.insert(path, FileStat::new(length));
        Ok(())
    }

    //
    // Resume record.
    //

    pub(crate) fn pickle(&self) -> ResumeRecord {
        let mut record = ResumeRecord::default();
        for (index, entry) in self.files.iter().enumerate() {
            if entry.length == 0 {
                continue;
            }
            if self.disabled[index] {
                for Installed { name, path } in &self.partials[index] {
                    let (size, mtime) = self.recorded(path);
                    record
                        .partial_files
                        .push(PartialFileRecord(name.clone(), size, mtime));
                }
            } else {
                let (size, mtime) = self.recorded(&entry.path);
                let index = u32::try_from(index).expect("file index");
                record.files.push(FileRecord(index, size, mtime));
            }
        }
        record
    }

    fn recorded(&self, path: &Path) -> (u64, f64) {
        self.stats
            .get(path)
            .map_or((0, 0.0), |stat| (stat.size, stat.mtime.unwrap_or(0.0)))
    }

    /// Returns the pieces that can be trusted without rehashing.
    pub(crate) fn validate(&self, record: &ResumeRecord) -> BTreeSet<PieceIndex> {
        let recorded = Recorded::new(record);

        let mut valid: BTreeSet<_> = self
            .files
            .iter()
            .zip(&self.disabled)
            .filter(|(_, disabled)| !**disabled)
            .flat_map(|(entry, _)| layout::pieces(self.pieces_of(entry)))
            .collect();

        for (index, entry) in self.files.iter().enumerate() {
            if entry.length == 0 {
                continue;
            }
            let ok = if self.disabled[index] {
                self.partials[index].iter().all(|Installed { name, path }| {
                    recorded.partial_file_matches(name, path, &self.stats)
                })
            } else {
                recorded.file_matches(index, &entry.path, &self.stats)
            };
            if !ok {
                tracing::debug!(index, path = %entry.path.display(), "invalidate");
                for piece in layout::pieces(self.pieces_of(entry)) {
                    valid.remove(&piece);
                }
            }
        }

        valid
    }
}

impl FileEntry {
    fn original_range(&self) -> Option<WorkingRange> {
        self.range
            .as_ref()
            .map(|range| WorkingRange::new(range.start, range.end, 0, self.path.clone()))
    }
}

/// Creates the file when it is missing, and truncates it when it is longer than `length`.
fn prepare(path: &Path, length: u64) -> Result<(), Error> {
    match fs::metadata(path) {
        Ok(metadata) => {
            let size = metadata.len();
            if size > length {
                tracing::info!(path = %path.display(), size, length, "truncate");
                OpenOptions::new()
                    .write(true)
                    .open(path)
                    .and_then(|file| file.set_len(length))
                    .context(BadGeometrySnafu { path, size, length })?;
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "create");
            File::create(path).context(OpenSnafu { path })?;
        }
        Err(error) => return Err(error).context(IoSnafu { path }),
    }
    Ok(())
}

fn read_full(file: &mut File, buffer: &mut [u8]) -> Result<usize, io::Error> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}
