//! Multi-file piece storage.
//!
//! A torrent is a linear byte space on top of a list of files.  `Storage` serves byte-range reads
//! and writes against that space, lets files be disabled (with the pieces shared with neighboring
//! files redirected to partial files), and produces a resume record that tells a restarted client
//! which pieces it can trust without rehashing.

mod config;
mod error;
mod fileset;
mod handle;
mod layout;
mod lock;
mod partial;
mod pool;
mod range_map;
mod resume;
mod stat;
mod sync;

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

use crate::fileset::FileSet;
use crate::pool::BufferPool;
use crate::range_map::Segment;
use crate::sync::MutexExt;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::layout::{BlockRange, PieceIndex};
pub use crate::resume::{FileRecord, PartialFileRecord, ResumeRecord};

#[derive(Debug)]
pub struct Storage {
    // Implementer's Notes: A request spanning several files takes the lock once per segment, not
    // once per request.  Callers operate on piece boundaries and pass `flush_first` when they need
    // to observe their own writes.
    files: Mutex<FileSet>,
    pool: BufferPool,
}

impl Storage {
    /// Opens the storage, creating missing files and truncating oversized ones.
    ///
    /// `done` is polled between files; when it is set, this returns `Error::Aborted`.
    pub fn open(
        files: &[(PathBuf, u64)],
        piece_size: u64,
        done: &AtomicBool,
        disabled: Option<&[bool]>,
        config: Config,
    ) -> Result<Self, Error> {
        Ok(Self {
            files: Mutex::new(FileSet::open(
                files, piece_size, done, disabled, &config,
            )?),
            pool: BufferPool::default(),
        })
    }

    pub fn num_files(&self) -> usize {
        self.files.must_lock().num_files()
    }

    pub fn total_length(&self) -> u64 {
        self.files.must_lock().total_length()
    }

    pub fn piece_size(&self) -> u64 {
        self.files.must_lock().piece_size()
    }

    pub fn num_pieces(&self) -> u32 {
        self.files.must_lock().num_pieces()
    }

    /// Returns the torrent range of a file, or `None` if the file is empty.
    pub fn file_range(&self, index: usize) -> Result<Option<Range<u64>>, Error> {
        self.files.must_lock().file_range(index)
    }

    pub fn piece_range(&self, index: usize) -> Result<Range<PieceIndex>, Error> {
        self.files.must_lock().piece_range(index)
    }

    pub fn is_disabled(&self, index: usize) -> Result<bool, Error> {
        self.files.must_lock().is_disabled(index)
    }

    /// Reads `[pos, pos + size)`.
    ///
    /// Parts of a disabled file that are not backed by any file read as zeros.  The returned
    /// buffer may be handed back with `recycle`.
    pub fn read(&self, pos: u64, size: usize, flush_first: bool) -> Result<BytesMut, Error> {
        let segments = self.files.must_lock().intervals(pos, size as u64)?;
        let mut buffer = self.pool.get(size);
        match self.read_segments(pos, &segments, flush_first, &mut buffer) {
            Ok(()) => {
                buffer.resize(size, 0);
                Ok(buffer)
            }
            Err(error) => {
                self.pool.recycle(buffer);
                Err(error)
            }
        }
    }

    fn read_segments(
        &self,
        pos: u64,
        segments: &[Segment],
        flush_first: bool,
        buffer: &mut BytesMut,
    ) -> Result<(), Error> {
        for segment in segments {
            buffer.resize((segment.pos - pos) as usize, 0);
            self.files.must_lock().read_segment(segment, flush_first, buffer)?;
        }
        Ok(())
    }

    pub fn recycle(&self, buffer: BytesMut) {
        self.pool.recycle(buffer);
    }

    /// Writes `data` at `pos`.
    ///
    /// Nothing is flushed.  When an error occurs midway, the segments written so far are left on
    /// disk.
    pub fn write(&self, pos: u64, data: &[u8]) -> Result<(), Error> {
        let segments = self.files.must_lock().intervals(pos, data.len() as u64)?;
        for segment in &segments {
            let start = (segment.pos - pos) as usize;
            let end = start + segment.len() as usize;
            self.files.must_lock().write_segment(segment, &data[start..end])?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.files.must_lock().flush()
    }

    /// Closes all write handles, which records the sizes and mtimes that `pickle` reports.
    pub fn sync(&self) -> Result<(), Error> {
        self.files.must_lock().sync()
    }

    /// Closes all handles, ignoring errors.
    pub fn close(&self) {
        self.files.must_lock().close();
    }

    pub fn was_preallocated(&self, pos: u64, size: u64) -> Result<bool, Error> {
        self.files.must_lock().was_preallocated(pos, size)
    }

    pub fn top_off(&self) -> Result<(), Error> {
        self.files.must_lock().top_off()
    }

    pub fn enable_file(&self, index: usize) -> Result<(), Error> {
        self.files.must_lock().enable(index)
    }

    pub fn disable_file(&self, index: usize) -> Result<(), Error> {
        self.files.must_lock().disable(index)
    }

    /// Returns the piece blocks that should be rehashed after the file is enabled or disabled.
    pub fn piece_update_list(&self, index: usize) -> Result<Vec<BlockRange>, Error> {
        self.files.must_lock().piece_update_list(index)
    }

    pub fn set_readonly(&self, index: Option<usize>) -> Result<(), Error> {
        self.files.must_lock().set_readonly(index)
    }

    pub fn set_buffer_dir(&self, buffer_dir: PathBuf) {
        self.files.must_lock().set_buffer_dir(buffer_dir);
    }

    pub fn delete_file(&self, index: usize) -> Result<(), Error> {
        self.files.must_lock().delete_file(index)
    }

    /// Snapshots the recorded sizes and mtimes; call `sync` first to include pending writes.
    pub fn pickle(&self) -> ResumeRecord {
        self.files.must_lock().pickle()
    }

    /// Decodes and validates a resume record.  A record that cannot be decoded validates nothing.
    pub fn unpickle(&self, data: &[u8]) -> BTreeSet<PieceIndex> {
        match ResumeRecord::decode(data) {
            Ok(record) => self.validate(&record),
            Err(error) => {
                tracing::warn!(%error, "unpickle");
                BTreeSet::new()
            }
        }
    }

    /// Returns the pieces whose underlying files have not changed since the record was made.
    pub fn validate(&self, record: &ResumeRecord) -> BTreeSet<PieceIndex> {
        self.files.must_lock().validate(record)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.files
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
    }
}

#[cfg(test)]
mod testing {
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;

    /// Moves the mtime of a file forward.
    pub(crate) fn shift_mtime(path: &Path, delta: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        let modified = file.metadata().unwrap().modified().unwrap();
        file.set_modified(modified + delta).unwrap();
    }
}
