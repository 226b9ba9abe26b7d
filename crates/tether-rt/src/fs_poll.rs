// src/fs_poll.rs
//
// Polling watcher for a filesystem path. Every change the native loop
// detects is delivered as the previous and current stat of the path.

use std::ffi::{c_int, c_uint, CString};
use std::rc::Rc;

use crate::dispatch::{dispatch, pin_callback};
use crate::error::{translate, ErrorCode, HostError, LoopResult};
use crate::event_loop::Loop;
use crate::handle::{HandleCell, HandleState};
use crate::native::{HandleKind, NativeStat, NativeTimespec, RawHandle};

/// Payload of a poll event: the stat before and after the change.
pub type FsPollEvent = LoopResult<(Stat, Stat)>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Link,
    Fifo,
    Socket,
    #[default]
    Unknown,
}

const S_IFMT: u64 = 0o170_000;

impl FileKind {
    fn from_mode(mode: u64) -> FileKind {
        match mode & S_IFMT {
            0o100_000 => FileKind::Regular,
            0o040_000 => FileKind::Directory,
            0o020_000 => FileKind::CharDevice,
            0o060_000 => FileKind::BlockDevice,
            0o120_000 => FileKind::Link,
            0o010_000 => FileKind::Fifo,
            0o140_000 => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl From<NativeTimespec> for Timespec {
    fn from(ts: NativeTimespec) -> Self {
        Timespec {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        }
    }
}

/// Owned copy of a native stat buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub kind: FileKind,
    /// Permission bits (`mode & 0o7777`).
    pub perm: u32,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub ino: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub flags: u64,
    pub gen: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub birthtime: Timespec,
}

impl From<&NativeStat> for Stat {
    fn from(st: &NativeStat) -> Self {
        Stat {
            dev: st.st_dev,
            kind: FileKind::from_mode(st.st_mode),
            perm: (st.st_mode & 0o7777) as u32,
            nlink: st.st_nlink,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev,
            ino: st.st_ino,
            size: st.st_size,
            blksize: st.st_blksize,
            blocks: st.st_blocks,
            flags: st.st_flags,
            gen: st.st_gen,
            atime: st.st_atim.into(),
            mtime: st.st_mtim.into(),
            ctime: st.st_ctim.into(),
            birthtime: st.st_birthtim.into(),
        }
    }
}

/// Checks a host path before it reaches the native loop.
pub(crate) fn native_path(path: &[u8]) -> LoopResult<CString> {
    if path.is_empty() {
        return Err(ErrorCode::EINVAL);
    }
    CString::new(path).map_err(|_| ErrorCode::ECHARSET)
}

/// A started filesystem poller.
#[derive(Debug, Clone)]
pub struct FsPoll {
    handle: Rc<HandleCell>,
}

impl FsPoll {
    /// Starts polling `path` every `interval_ms` milliseconds.
    ///
    /// The path must be non-empty (`EINVAL`) and free of NUL bytes
    /// (`ECHARSET`); the interval must fit the native unsigned width
    /// (`EINVAL`). These are checked before anything is allocated.
    pub fn start<F>(lp: &Loop, path: impl AsRef<[u8]>, interval_ms: i64, cb: F) -> LoopResult<FsPoll>
    where
        F: FnMut(&FsPoll, FsPollEvent) -> Result<(), HostError> + 'static,
    {
        let inner = lp.inner();
        let path = native_path(path.as_ref())?;
        let interval = c_uint::try_from(interval_ms).map_err(|_| ErrorCode::EINVAL)?;

        let cell = HandleCell::create(inner, HandleKind::FsPoll)?;
        cell.init(inner, |native, raw| unsafe { native.fs_poll_init(raw) })?;
        cell.start(inner, pin_callback::<FsPoll, FsPollEvent>(cb), |native, raw| unsafe {
            native.fs_poll_start(raw, on_fs_poll, &path, interval)
        })?;
        Ok(FsPoll { handle: cell })
    }

    /// Stops polling and releases the callback. Idempotent.
    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }
}

unsafe fn copy_stat(st: *const NativeStat) -> Stat {
    st.as_ref().map(Stat::from).unwrap_or_default()
}

unsafe extern "C" fn on_fs_poll(
    raw: *mut RawHandle,
    status: c_int,
    prev: *const NativeStat,
    curr: *const NativeStat,
) {
    dispatch::<FsPoll, FsPollEvent>(
        raw,
        |handle| FsPoll { handle },
        || translate(status, || (copy_stat(prev), copy_stat(curr))),
    );
}
