use std::io;
use std::path::PathBuf;

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("aborted"))]
    Aborted,

    #[snafu(display(
        "cannot truncate file to its declared length: {} {size} > {length}: {source}",
        path.display(),
    ))]
    BadGeometry {
        path: PathBuf,
        size: u64,
        length: u64,
        source: io::Error,
    },

    #[snafu(display("buffer dir is not set"))]
    BufferDirUnset,

    #[snafu(display("resume record decode error: {source}"))]
    Decode { source: serde_json::Error },
    #[snafu(display("resume record encode error: {source}"))]
    Encode { source: serde_json::Error },

    ExpectNonZeroPieceSize,

    #[snafu(display("expect disabled list of {expect} entries: {len}"))]
    InvalidDisabledList { len: usize, expect: usize },
    #[snafu(display("expect file index < {len}: {index}"))]
    InvalidFileIndex { index: usize, len: usize },
    #[snafu(display("expect pos + size <= {total}: pos={pos} size={size}"))]
    InvalidRange { pos: u64, size: u64, total: u64 },

    #[snafu(display("io error: {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("cannot lock file: {}: {source}", path.display()))]
    Lock { path: PathBuf, source: io::Error },

    #[snafu(display("file modified during run: {}", path.display()))]
    ModifiedDuringRun { path: PathBuf },

    #[snafu(display("cannot open file: {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("cannot read data from file: {}: {source}", path.display()))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display(
        "short read: {}: offset={offset} expect={size} actual={actual}",
        path.display(),
    ))]
    ShortRead {
        path: PathBuf,
        offset: u64,
        size: usize,
        actual: usize,
    },

    #[snafu(display("cannot write data to file: {}: {source}", path.display()))]
    Write { path: PathBuf, source: io::Error },
}

impl Error {
    /// Returns the backing file that the error refers to, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::BadGeometry { path, .. }
            | Self::Io { path, .. }
            | Self::Lock { path, .. }
            | Self::ModifiedDuringRun { path }
            | Self::Open { path, .. }
            | Self::Read { path, .. }
            | Self::ShortRead { path, .. }
            | Self::Write { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io { source, .. }
            | Error::Open { source, .. }
            | Error::Read { source, .. }
            | Error::Write { source, .. } => source,
            _ => io::Error::other(error),
        }
    }
}
