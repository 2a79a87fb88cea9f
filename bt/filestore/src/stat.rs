use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use snafu::prelude::*;

use crate::error::{Error, IoSnafu, ModifiedDuringRunSnafu};

/// What we know about a file on disk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileStat {
    /// The length the torrent (or the partial-file layout) expects.
    pub(crate) length: u64,
    /// Bytes actually present on disk.
    pub(crate) size: u64,
    /// Last observed mtime, in seconds since the Unix epoch.
    pub(crate) mtime: Option<f64>,
}

#[derive(Debug)]
pub(crate) struct FileStats {
    stats: HashMap<Arc<Path>, FileStat>,
    tolerance: f64,
}

/// Returns the size and mtime of a file.
pub(crate) fn probe(path: &Path) -> Result<(u64, f64), io::Error> {
    let metadata = fs::metadata(path)?;
    Ok((metadata.len(), mtime(&metadata)?))
}

pub(crate) fn mtime(metadata: &Metadata) -> Result<f64, io::Error> {
    Ok(match metadata.modified()?.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs_f64(),
        Err(error) => -error.duration().as_secs_f64(),
    })
}

impl FileStat {
    pub(crate) fn new(length: u64) -> Self {
        Self {
            length,
            size: 0,
            mtime: None,
        }
    }
}

impl FileStats {
    pub(crate) fn new(tolerance: f64) -> Self {
        Self {
            stats: HashMap::new(),
            tolerance,
        }
    }

    pub(crate) fn get(&self, path: &Path) -> Option<&FileStat> {
        self.stats.get(path)
    }

    pub(crate) fn insert(&mut self, path: Arc<Path>, stat: FileStat) {
        self.stats.insert(path, stat);
    }

    pub(crate) fn length(&self, path: &Path) -> u64 {
        self.stats.get(path).map_or(0, |stat| stat.length)
    }

    pub(crate) fn size(&self, path: &Path) -> u64 {
        self.stats.get(path).map_or(0, |stat| stat.size)
    }

    /// Records that the file is at least `size` bytes long.
    pub(crate) fn extend(&mut self, path: &Arc<Path>, size: u64) {
        let stat = self
            .stats
            .entry(path.clone())
            .or_insert_with(|| FileStat::new(size));
        stat.size = stat.size.max(size);
    }

    /// Re-reads the size and mtime of a file from disk.
    pub(crate) fn refresh(&mut self, path: &Arc<Path>) -> Result<(), Error> {
        let (size, mtime) = probe(path).context(IoSnafu {
            path: path.to_path_buf(),
        })?;
        let stat = self
            .stats
            .entry(path.clone())
            .or_insert_with(|| FileStat::new(size));
        stat.size = size;
        stat.mtime = Some(mtime);
        Ok(())
    }

    /// Checks that a file has not been modified behind our back.
    pub(crate) fn check(&self, path: &Path) -> Result<(), Error> {
        let Some(FileStat {
            size,
            mtime: Some(mtime),
            ..
        }) = self.stats.get(path).copied()
        else {
            return Ok(());
        };
        let (actual_size, actual_mtime) = probe(path).context(IoSnafu {
            path: path.to_path_buf(),
        })?;
        ensure!(
            self.matches((size, mtime), (actual_size, actual_mtime)),
            ModifiedDuringRunSnafu {
                path: path.to_path_buf(),
            },
        );
        Ok(())
    }

    /// The predicate shared by the drift check and the resume record validation.
    pub(crate) fn matches(
        &self,
        (size, mtime): (u64, f64),
        (actual_size, actual_mtime): (u64, f64),
    ) -> bool {
        size == actual_size && (actual_mtime - mtime).abs() <= self.tolerance
    }
}
