// src/native/mod.rs
//
// The boundary with the native event loop. Everything here is shaped like a C
// API: handles are raw pointers, callbacks are `extern "C"` functions and
// failures are negative `c_int` statuses. A libuv binding implements
// `NativeLoop` directly; `sim::SimLoop` is the scripted implementation the
// crate ships.

pub mod sim;

use std::cell::Cell;
use std::ffi::{c_int, c_uint, c_void, CStr};
use std::ptr;

/// Kind tag stored in every native handle struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    FsPoll = 1,
    Tty = 2,
    Timer = 3,
}

/// Fixed-size native handle struct.
///
/// `data` points back at the wrapper that owns this struct. It is cleared
/// as soon as close is requested, so a callback that still arrives for a
/// closing handle can tell there is nobody left to deliver to.
#[repr(C)]
#[derive(Debug)]
pub struct RawHandle {
    pub kind: HandleKind,
    pub data: *mut c_void,
    /// Reserved for the native loop's own bookkeeping.
    pub native_id: u64,
}

thread_local! {
    static RAW_ALLOCATED: Cell<u64> = Cell::new(0);
    static RAW_FREED: Cell<u64> = Cell::new(0);
}

/// Allocation counters for native handle structs on this thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStats {
    pub allocated: u64,
    pub freed: u64,
}

impl RawStats {
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.freed
    }
}

pub fn raw_stats() -> RawStats {
    RawStats {
        allocated: RAW_ALLOCATED.with(Cell::get),
        freed: RAW_FREED.with(Cell::get),
    }
}

impl RawHandle {
    pub(crate) fn alloc(kind: HandleKind) -> *mut RawHandle {
        RAW_ALLOCATED.with(|n| n.set(n.get() + 1));
        Box::into_raw(Box::new(RawHandle {
            kind,
            data: ptr::null_mut(),
            native_id: 0,
        }))
    }

    /// # Safety
    /// `handle` must come from [`RawHandle::alloc`] and must not be used
    /// afterwards. Each allocation is freed exactly once.
    pub(crate) unsafe fn free(handle: *mut RawHandle) {
        // May run from registry destructors at thread exit.
        let _ = RAW_FREED.try_with(|n| n.set(n.get() + 1));
        drop(Box::from_raw(handle));
    }
}

/// Close callback handed to the native loop. Frees the struct.
pub(crate) unsafe extern "C" fn on_native_close(handle: *mut RawHandle) {
    if handle.is_null() {
        return;
    }
    log::trace!("Native close completed for {:?} handle.", (*handle).kind);
    RawHandle::free(handle);
}

// --- Native payloads ---

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// Stat buffer as the native loop fills it. Only valid for the duration of
/// the callback it is passed to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeStat {
    pub st_dev: u64,
    pub st_mode: u64,
    pub st_nlink: u64,
    pub st_uid: u64,
    pub st_gid: u64,
    pub st_rdev: u64,
    pub st_ino: u64,
    pub st_size: u64,
    pub st_blksize: u64,
    pub st_blocks: u64,
    pub st_flags: u64,
    pub st_gen: u64,
    pub st_atim: NativeTimespec,
    pub st_mtim: NativeTimespec,
    pub st_ctim: NativeTimespec,
    pub st_birthtim: NativeTimespec,
}

/// Terminal modes understood by the native loop.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtyMode {
    Normal = 0,
    Raw = 1,
    Io = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run until no handle is alive or `stop` is called.
    Default,
    /// Run a single iteration.
    Once,
    /// Run a single iteration without waiting for new events.
    NoWait,
}

pub type FsPollCb = unsafe extern "C" fn(
    handle: *mut RawHandle,
    status: c_int,
    prev: *const NativeStat,
    curr: *const NativeStat,
);
pub type TimerCb = unsafe extern "C" fn(handle: *mut RawHandle);
pub type CloseCb = unsafe extern "C" fn(handle: *mut RawHandle);

/// Operations of a callback-based native event loop.
///
/// Statuses follow the native convention: negative is an error code,
/// anything else is success. Implementations must not hold internal borrows
/// while invoking a callback, since callbacks re-enter the loop (closing
/// handles, starting new ones).
///
/// # Safety
/// Every `handle` passed to an `unsafe` method was produced by the crate's
/// handle allocator and stays valid until the loop invokes the close
/// callback given to [`NativeLoop::close`]. After that callback the loop must
/// not touch the pointer again.
pub trait NativeLoop {
    fn run(&self, mode: RunMode) -> c_int;
    fn stop(&self);
    fn alive(&self) -> bool;
    /// Completes pending closes and releases loop resources. Returns
    /// `EBUSY` while handles are still open.
    fn close_loop(&self) -> c_int;

    unsafe fn close(&self, handle: *mut RawHandle, cb: CloseCb);

    unsafe fn fs_poll_init(&self, handle: *mut RawHandle) -> c_int;
    unsafe fn fs_poll_start(
        &self,
        handle: *mut RawHandle,
        cb: FsPollCb,
        path: &CStr,
        interval: c_uint,
    ) -> c_int;

    unsafe fn tty_init(&self, handle: *mut RawHandle, fd: c_int, readable: bool) -> c_int;
    unsafe fn tty_set_mode(&self, handle: *mut RawHandle, mode: TtyMode) -> c_int;
    unsafe fn tty_get_winsize(
        &self,
        handle: *mut RawHandle,
        width: &mut c_int,
        height: &mut c_int,
    ) -> c_int;
    fn tty_reset_mode(&self) -> c_int;

    unsafe fn timer_init(&self, handle: *mut RawHandle) -> c_int;
    unsafe fn timer_start(
        &self,
        handle: *mut RawHandle,
        cb: TimerCb,
        timeout: u64,
        repeat: u64,
    ) -> c_int;
    unsafe fn timer_get_repeat(&self, handle: *const RawHandle) -> u64;
}
