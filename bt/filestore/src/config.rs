use std::path::PathBuf;

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Holds OS range locks on write handles.
    pub lock_files: bool,
    /// Also holds OS range locks on read handles.  Has no effect without `lock_files`.
    pub lock_while_reading: bool,
    /// Zero means unbounded.  The LRU cache is only engaged when this is less than the number of
    /// non-empty files.
    pub max_files_open: usize,
    /// Where the partial files of disabled files are stored.
    pub buffer_dir: Option<PathBuf>,
    /// Tolerance (in seconds) when comparing a file's mtime against a recorded one.
    ///
    /// NOTE: Filesystems with a 2-second mtime resolution (FAT) need a wider tolerance.
    pub mtime_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_files: true,
            lock_while_reading: false,
            max_files_open: 50,
            buffer_dir: None,
            mtime_tolerance: 1.0,
        }
    }
}
