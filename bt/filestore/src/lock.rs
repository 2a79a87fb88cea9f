use std::fs::File;
use std::io;

use crate::handle::Mode;

/// Only the first 4 GiB of a file is locked.
const LOCK_RANGE: u64 = 4 << 30;
/// Some systems cap the size of a single lock region.
const LOCK_CHUNK: u64 = 1 << 30;

/// How backing files are locked, chosen once at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LockStrategy {
    #[cfg(unix)]
    PosixFcntl,
    #[cfg(windows)]
    WinLockRange,
    NoOp,
}

impl LockStrategy {
    pub(crate) fn new(lock_files: bool) -> Self {
        if !lock_files {
            return Self::NoOp;
        }
        #[cfg(unix)]
        let strategy = Self::PosixFcntl;
        #[cfg(windows)]
        let strategy = Self::WinLockRange;
        #[cfg(not(any(unix, windows)))]
        let strategy = Self::NoOp;
        strategy
    }

    pub(crate) fn is_enabled(&self) -> bool {
        *self != Self::NoOp
    }

    /// Locks the regions of a file without blocking.
    ///
    /// On failure, the regions locked so far are released.
    pub(crate) fn lock(&self, file: &File, mode: Mode, length: u64) -> Result<(), io::Error> {
        let mut locked = Vec::new();
        for (start, len) in regions(length) {
            if let Err(error) = self.lock_region(file, mode, start, len) {
                for (start, len) in locked {
                    if let Err(error) = self.unlock_region(file, start, len) {
                        tracing::debug!(%error, "unlock");
                    }
                }
                return Err(error);
            }
            locked.push((start, len));
        }
        Ok(())
    }

    pub(crate) fn unlock(&self, file: &File, length: u64) -> Result<(), io::Error> {
        for (start, len) in regions(length) {
            self.unlock_region(file, start, len)?;
        }
        Ok(())
    }

    // `LockFile` only supports exclusive locks; so `mode` is unused on Windows.
    #[cfg_attr(not(unix), allow(unused_variables))]
    fn lock_region(
        &self,
        file: &File,
        mode: Mode,
        start: u64,
        len: u64,
    ) -> Result<(), io::Error> {
        match self {
            #[cfg(unix)]
            Self::PosixFcntl => posix::set_lock(
                file,
                match mode {
                    Mode::Read => libc::F_RDLCK as libc::c_short,
                    Mode::ReadWrite => libc::F_WRLCK as libc::c_short,
                },
                start,
                len,
            ),
            #[cfg(windows)]
            Self::WinLockRange => win::lock(file, start, len),
            Self::NoOp => Ok(()),
        }
    }

    #[cfg_attr(not(any(unix, windows)), allow(unused_variables))]
    fn unlock_region(&self, file: &File, start: u64, len: u64) -> Result<(), io::Error> {
        match self {
            #[cfg(unix)]
            Self::PosixFcntl => {
                posix::set_lock(file, libc::F_UNLCK as libc::c_short, start, len)
            }
            #[cfg(windows)]
            Self::WinLockRange => win::unlock(file, start, len),
            Self::NoOp => Ok(()),
        }
    }
}

fn regions(length: u64) -> impl Iterator<Item = (u64, u64)> {
    let end = length.min(LOCK_RANGE);
    (0..end)
        .step_by(LOCK_CHUNK.try_into().expect("LOCK_CHUNK"))
        .map(move |start| (start, LOCK_CHUNK.min(end - start)))
}

#[cfg(unix)]
mod posix {
    use std::fs::File;
    use std::io;
    use std::mem;
    use std::os::fd::AsRawFd;

    pub(super) fn set_lock(
        file: &File,
        kind: libc::c_short,
        start: u64,
        len: u64,
    ) -> Result<(), io::Error> {
        // SAFETY: `flock` is a plain C struct, for which all-zero is a valid value.
        let mut flock: libc::flock = unsafe { mem::zeroed() };
        flock.l_type = kind;
        flock.l_whence = libc::SEEK_SET.try_into().expect("SEEK_SET");
        flock.l_start = start.try_into().expect("l_start");
        flock.l_len = len.try_into().expect("l_len");
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &raw const flock) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod win {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{LockFile, UnlockFile};

    fn split(x: u64) -> (u32, u32) {
        (x as u32, (x >> 32) as u32)
    }

    pub(super) fn lock(file: &File, start: u64, len: u64) -> Result<(), io::Error> {
        let (start_low, start_high) = split(start);
        let (len_low, len_high) = split(len);
        unsafe {
            LockFile(
                HANDLE(file.as_raw_handle()),
                start_low,
                start_high,
                len_low,
                len_high,
            )
        }
        .map_err(io::Error::other)
    }

    pub(super) fn unlock(file: &File, start: u64, len: u64) -> Result<(), io::Error> {
        let (start_low, start_high) = split(start);
        let (len_low, len_high) = split(len);
        unsafe {
            UnlockFile(
                HANDLE(file.as_raw_handle()),
                start_low,
                start_high,
                len_low,
                len_high,
            )
        }
        .map_err(io::Error::other)
    }
}
