use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use snafu::prelude::*;

use crate::error::{Error, IoSnafu, LockSnafu, OpenSnafu};
use crate::lock::LockStrategy;
use crate::stat::FileStats;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
    Read,
    ReadWrite,
}

#[derive(Debug)]
pub(crate) struct Handle {
    pub(crate) file: File,
    mode: Mode,
    locked: bool,
}

/// Pool of open file handles, at most one per path.
///
/// The pool is bounded only when it is constructed with `max_open`, in which case the least
/// recently used handle is closed on overflow, and a file is checked for modification every time
/// it is re-opened (while a handle stays open, it is the authoritative reference to the file).
#[derive(Debug)]
pub(crate) struct HandleCache {
    handles: LruCache<Arc<Path>, Handle>,
    bounded: bool,
    locking: LockStrategy,
    lock_while_reading: bool,
}

impl Handle {
    #[cfg(test)]
    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }
}

impl HandleCache {
    pub(crate) fn new(
        max_open: Option<NonZeroUsize>,
        locking: LockStrategy,
        lock_while_reading: bool,
    ) -> Self {
        Self {
            handles: match max_open {
                Some(max_open) => LruCache::new(max_open),
                None => LruCache::unbounded(),
            },
            bounded: max_open.is_some(),
            locking,
            lock_while_reading,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_bounded(&self) -> bool {
        self.bounded
    }

    pub(crate) fn has_writer(&self, path: &Path) -> bool {
        self.handles
            .peek(path)
            .is_some_and(|handle| handle.mode == Mode::ReadWrite)
    }

    /// Returns a handle of the file, opening it when necessary.
    ///
    /// A read-only handle is re-opened in read-write mode when `mode` is `ReadWrite`, whereas a
    /// read-write handle is returned as is for any `mode`.
    pub(crate) fn get(
        &mut self,
        path: &Arc<Path>,
        mode: Mode,
        stats: &mut FileStats,
    ) -> Result<&mut Handle, Error> {
        let upgrade = match self.handles.get(path) {
            Some(handle) => mode == Mode::ReadWrite && handle.mode == Mode::Read,
            None => {
                self.open(path, mode, stats)?;
                false
            }
        };
        if upgrade {
            tracing::debug!(path = %path.display(), "upgrade");
            let handle = self.handles.pop(path).expect("handle");
            self.close_handle(path, handle, stats)?;
            self.open(path, Mode::ReadWrite, stats)?;
        }
        Ok(self.handles.get_mut(path).expect("handle"))
    }

    fn open(&mut self, path: &Arc<Path>, mode: Mode, stats: &mut FileStats) -> Result<(), Error> {
        if self.bounded {
            stats.check(path)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(mode == Mode::ReadWrite)
            .open(path)
            .context(OpenSnafu {
                path: path.to_path_buf(),
            })?;

        let locked = self.locking.is_enabled()
            && (mode == Mode::ReadWrite || self.lock_while_reading);
        if locked {
            self.locking
                .lock(&file, mode, stats.length(path))
                .context(LockSnafu {
                    path: path.to_path_buf(),
                })?;
        }

        tracing::debug!(path = %path.display(), ?mode, locked, "open");
        let handle = Handle { file, mode, locked };
        // We never push a path that is already in the cache; so anything returned is evicted.
        if let Some((evicted_path, evicted)) = self.handles.push(path.clone(), handle) {
            tracing::debug!(path = %evicted_path.display(), "evict");
            self.close_handle(&evicted_path, evicted, stats)?;
        }
        Ok(())
    }

    fn close_handle(
        &self,
        path: &Arc<Path>,
        handle: Handle,
        stats: &mut FileStats,
    ) -> Result<(), Error> {
        let Handle {
            mut file,
            mode,
            locked,
        } = handle;
        if mode == Mode::ReadWrite {
            file.flush()
                .and_then(|()| file.sync_all())
                .context(IoSnafu {
                    path: path.to_path_buf(),
                })?;
        }
        if locked {
            self.locking
                .unlock(&file, stats.length(path))
                .context(LockSnafu {
                    path: path.to_path_buf(),
                })?;
        }
        drop(file);
        tracing::debug!(path = %path.display(), ?mode, "close");
        if mode == Mode::ReadWrite {
            stats.refresh(path)?;
        }
        Ok(())
    }

    /// Closes the handle of the file, if any.
    pub(crate) fn close(&mut self, path: &Arc<Path>, stats: &mut FileStats) -> Result<(), Error> {
        match self.handles.pop(path) {
            Some(handle) => self.close_handle(path, handle, stats),
            None => Ok(()),
        }
    }

    pub(crate) fn close_writer(
        &mut self,
        path: &Arc<Path>,
        stats: &mut FileStats,
    ) -> Result<(), Error> {
        if self.has_writer(path) {
            self.close(path, stats)?;
        }
        Ok(())
    }

    /// Flushes the writer of the file, if any, and syncs its data to disk.
    pub(crate) fn flush(&mut self, path: &Path) -> Result<(), Error> {
        if let Some(handle) = self.handles.peek_mut(path) {
            if handle.mode == Mode::ReadWrite {
                handle
                    .file
                    .flush()
                    .and_then(|()| handle.file.sync_data())
                    .context(IoSnafu { path })?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush_all(&mut self) -> Result<(), Error> {
        for (path, handle) in self.handles.iter_mut() {
            if handle.mode == Mode::ReadWrite {
                handle.file.flush().context(IoSnafu {
                    path: path.to_path_buf(),
                })?;
            }
        }
        Ok(())
    }

    /// Closes all read-write handles, which refreshes their sizes and mtimes.
    pub(crate) fn sync_all_writers(&mut self, stats: &mut FileStats) -> Result<(), Error> {
        let writers: Vec<_> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.mode == Mode::ReadWrite)
            .map(|(path, _)| path.clone())
            .collect();
        for path in writers {
            self.close(&path, stats)?;
        }
        Ok(())
    }

    /// Closes all handles, ignoring errors.
    pub(crate) fn close_all(&mut self, stats: &mut FileStats) {
        while let Some((path, handle)) = self.handles.pop_lru() {
            if let Err(error) = self.close_handle(&path, handle, stats) {
                tracing::warn!(path = %path.display(), %error, "close_all");
            }
        }
    }
}
