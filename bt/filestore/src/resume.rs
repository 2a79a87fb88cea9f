//! Resume record, which lets a restarted client skip rehashing files that have not changed.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{DecodeSnafu, EncodeSnafu, Error};
use crate::stat::{self, FileStats};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ResumeRecord {
    /// Enabled, non-empty files.
    pub files: Vec<FileRecord>,
    /// Partial files of disabled files.
    #[serde(default)]
    pub partial_files: Vec<PartialFileRecord>,
}

/// `(index, size, mtime)`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FileRecord(pub u32, pub u64, pub f64);

/// `(basename, size, mtime)`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PartialFileRecord(pub String, pub u64, pub f64);

impl ResumeRecord {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).context(EncodeSnafu)
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).context(DecodeSnafu)
    }
}

/// Record entries indexed for validation.
#[derive(Debug)]
pub(crate) struct Recorded<'a> {
    files: HashMap<u32, (u64, f64)>,
    partial_files: HashMap<&'a str, (u64, f64)>,
}

impl<'a> Recorded<'a> {
    pub(crate) fn new(record: &'a ResumeRecord) -> Self {
        Self {
            files: record
                .files
                .iter()
                .map(|FileRecord(index, size, mtime)| (*index, (*size, *mtime)))
                .collect(),
            partial_files: record
                .partial_files
                .iter()
                .map(|PartialFileRecord(name, size, mtime)| (name.as_str(), (*size, *mtime)))
                .collect(),
        }
    }

    /// True if the file at `path` still matches its entry.  A missing entry never matches.
    pub(crate) fn file_matches(&self, index: usize, path: &Path, stats: &FileStats) -> bool {
        let recorded = u32::try_from(index)
            .ok()
            .and_then(|index| self.files.get(&index));
        matches(recorded.copied(), path, stats)
    }

    pub(crate) fn partial_file_matches(&self, name: &str, path: &Path, stats: &FileStats) -> bool {
        matches(self.partial_files.get(name).copied(), path, stats)
    }
}

fn matches(recorded: Option<(u64, f64)>, path: &Path, stats: &FileStats) -> bool {
    let Some(recorded) = recorded else {
        return false;
    };
    match stat::probe(path) {
        Ok(actual) => stats.matches(recorded, actual),
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "probe");
            false
        }
    }
}
