// src/native/sim.rs
//
// Scripted implementation of the native loop. Nothing here touches the
// filesystem or a terminal: filesystem changes are injected with
// `emit_fs_poll`, time only moves with `advance`, and any native call can be
// made to fail once with `fail_next`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::{c_int, c_uint, CStr, CString};
use std::rc::Rc;

use super::{
    CloseCb, FsPollCb, HandleKind, NativeLoop, NativeStat, RawHandle, RunMode, TimerCb, TtyMode,
};

const DEFAULT_WINSIZE: (c_int, c_int) = (80, 24);

/// Native operations whose status can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    FsPollInit,
    FsPollStart,
    TtyInit,
    TtySetMode,
    TtyGetWinsize,
    TtyResetMode,
    TimerInit,
    TimerStart,
}

/// A native call as recorded by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCall {
    Op(SimOp),
    Close(HandleKind),
}

enum Detail {
    FsPoll {
        path: CString,
        interval: c_uint,
        cb: Option<FsPollCb>,
    },
    Tty {
        fd: c_int,
        mode: TtyMode,
    },
    Timer {
        cb: Option<TimerCb>,
        due: u64,
        repeat: u64,
    },
}

struct SimHandle {
    raw: *mut RawHandle,
    active: bool,
    detail: Detail,
}

struct FsEvent {
    id: u64,
    raw: *mut RawHandle,
    status: c_int,
    prev: NativeStat,
    curr: NativeStat,
}

#[derive(Default)]
struct SimState {
    now: Cell<u64>,
    next_id: Cell<u64>,
    handles: RefCell<BTreeMap<u64, SimHandle>>,
    events: RefCell<VecDeque<FsEvent>>,
    closing: RefCell<VecDeque<(*mut RawHandle, CloseCb)>>,
    faults: RefCell<HashMap<SimOp, VecDeque<c_int>>>,
    rejected_modes: RefCell<HashMap<TtyMode, c_int>>,
    winsizes: RefCell<HashMap<c_int, (c_int, c_int)>>,
    calls: RefCell<Vec<SimCall>>,
    stopped: Cell<bool>,
    closed: Cell<bool>,
}

/// Deterministic native loop with virtual time.
///
/// Cloning shares the same loop, so a test can keep a clone for scripting
/// while the [`Loop`](crate::Loop) owns another.
#[derive(Clone, Default)]
pub struct SimLoop {
    state: Rc<SimState>,
}

impl SimLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` return `status` instead of running.
    pub fn fail_next(&self, op: SimOp, status: c_int) {
        self.state
            .faults
            .borrow_mut()
            .entry(op)
            .or_default()
            .push_back(status);
    }

    /// Makes every attempt to switch a terminal into `mode` fail with `status`.
    pub fn reject_tty_mode(&self, mode: TtyMode, status: c_int) {
        self.state.rejected_modes.borrow_mut().insert(mode, status);
    }

    pub fn set_winsize(&self, fd: c_int, width: c_int, height: c_int) {
        self.state.winsizes.borrow_mut().insert(fd, (width, height));
    }

    /// Queues a change notification for every active poller watching `path`.
    /// Returns the number of pollers that will be notified.
    pub fn emit_fs_poll(&self, path: impl AsRef<[u8]>, prev: NativeStat, curr: NativeStat) -> usize {
        self.queue_fs_event(path.as_ref(), 0, prev, curr)
    }

    /// Queues a failed poll (`status < 0`) for every active poller watching `path`.
    pub fn emit_fs_poll_error(&self, path: impl AsRef<[u8]>, status: c_int) -> usize {
        debug_assert!(status < 0);
        self.queue_fs_event(path.as_ref(), status, NativeStat::default(), NativeStat::default())
    }

    /// Moves virtual time forward. Timers that become due fire on the next run.
    pub fn advance(&self, ms: u64) {
        self.state.now.set(self.state.now.get().saturating_add(ms));
    }

    pub fn now(&self) -> u64 {
        self.state.now.get()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.borrow_mut().clear();
    }

    /// Handles initialized and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.handles.borrow().len()
    }

    pub fn active_handles(&self) -> usize {
        self.state.handles.borrow().values().filter(|h| h.active).count()
    }

    pub fn pending_events(&self) -> usize {
        self.state.events.borrow().len()
    }

    pub fn pending_closes(&self) -> usize {
        self.state.closing.borrow().len()
    }

    /// Current mode of the first open terminal on `fd`.
    pub fn tty_mode(&self, fd: c_int) -> Option<TtyMode> {
        self.state.handles.borrow().values().find_map(|h| match h.detail {
            Detail::Tty { fd: tty_fd, mode } if tty_fd == fd => Some(mode),
            _ => None,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    // --- Internals ---

    fn record(&self, call: SimCall) {
        self.state.calls.borrow_mut().push(call);
    }

    /// Records `op` and returns a scripted failure, if one is queued.
    fn enter(&self, op: SimOp) -> Option<c_int> {
        self.record(SimCall::Op(op));
        let status = self
            .state
            .faults
            .borrow_mut()
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(status) = status {
            log::debug!("SimLoop: injected status {} for {:?}.", status, op);
        }
        status
    }

    unsafe fn insert(&self, raw: *mut RawHandle, detail: Detail) {
        let id = self.state.next_id.get() + 1;
        self.state.next_id.set(id);
        (*raw).native_id = id;
        self.state.handles.borrow_mut().insert(
            id,
            SimHandle {
                raw,
                active: false,
                detail,
            },
        );
    }

    /// Runs `f` on the entry for `raw`, or returns `EBADF` if it is not open.
    unsafe fn with_handle(&self, raw: *const RawHandle, f: impl FnOnce(&mut SimHandle) -> c_int) -> c_int {
        let id = (*raw).native_id;
        match self.state.handles.borrow_mut().get_mut(&id) {
            Some(handle) => f(handle),
            None => -libc::EBADF,
        }
    }

    fn queue_fs_event(&self, path: &[u8], status: c_int, prev: NativeStat, curr: NativeStat) -> usize {
        let targets: Vec<(u64, *mut RawHandle)> = self
            .state
            .handles
            .borrow()
            .iter()
            .filter(|(_, h)| {
                h.active
                    && matches!(&h.detail, Detail::FsPoll { path: watched, .. } if watched.as_bytes() == path)
            })
            .map(|(id, h)| (*id, h.raw))
            .collect();
        let mut events = self.state.events.borrow_mut();
        for (id, raw) in &targets {
            events.push_back(FsEvent {
                id: *id,
                raw: *raw,
                status,
                prev,
                curr,
            });
        }
        targets.len()
    }

    fn run_timers(&self) -> bool {
        let now = self.state.now.get();
        let mut due: Vec<(u64, u64)> = self
            .state
            .handles
            .borrow()
            .iter()
            .filter_map(|(id, h)| match h.detail {
                Detail::Timer { cb: Some(_), due, .. } if h.active && due <= now => Some((due, *id)),
                _ => None,
            })
            .collect();
        due.sort_unstable();

        let mut fired = false;
        for (_, id) in due {
            // An earlier callback in this batch may have closed the timer.
            let next = {
                let mut handles = self.state.handles.borrow_mut();
                match handles.get_mut(&id) {
                    Some(handle) if handle.active => {
                        let raw = handle.raw;
                        match &mut handle.detail {
                            Detail::Timer { cb: Some(cb), due, repeat } => {
                                if *repeat > 0 {
                                    *due = now + *repeat;
                                } else {
                                    handle.active = false;
                                }
                                Some((*cb, raw))
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                }
            };
            if let Some((cb, raw)) = next {
                fired = true;
                unsafe { cb(raw) };
            }
            if self.state.stopped.get() {
                break;
            }
        }
        fired
    }

    fn run_events(&self, limit: usize) -> bool {
        let mut delivered = 0;
        while delivered < limit {
            let Some(event) = self.state.events.borrow_mut().pop_front() else {
                break;
            };
            delivered += 1;
            let cb = match self.state.handles.borrow().get(&event.id) {
                Some(SimHandle {
                    raw,
                    active: true,
                    detail: Detail::FsPoll { cb: Some(cb), .. },
                }) if *raw == event.raw => *cb,
                _ => continue,
            };
            let (prev, curr) = (event.prev, event.curr);
            unsafe { cb(event.raw, event.status, &prev, &curr) };
            if self.state.stopped.get() {
                break;
            }
        }
        delivered > 0
    }

    fn run_closing(&self) -> bool {
        let pending: Vec<(*mut RawHandle, CloseCb)> = self.state.closing.borrow_mut().drain(..).collect();
        for (raw, cb) in &pending {
            unsafe { cb(*raw) };
        }
        !pending.is_empty()
    }
}

impl NativeLoop for SimLoop {
    fn run(&self, mode: RunMode) -> c_int {
        if self.state.closed.get() {
            return -libc::EINVAL;
        }
        self.state.stopped.set(false);
        loop {
            let batch = self.state.events.borrow().len();
            let mut progressed = self.run_timers();
            progressed |= self.run_events(batch);
            progressed |= self.run_closing();
            if mode != RunMode::Default || !progressed || self.state.stopped.get() {
                break;
            }
        }
        c_int::from(self.alive())
    }

    fn stop(&self) {
        self.state.stopped.set(true);
    }

    fn alive(&self) -> bool {
        self.active_handles() > 0 || self.pending_closes() > 0
    }

    fn close_loop(&self) -> c_int {
        self.run_closing();
        if self.open_handles() > 0 {
            return -libc::EBUSY;
        }
        self.state.closed.set(true);
        0
    }

    unsafe fn close(&self, handle: *mut RawHandle, cb: CloseCb) {
        self.record(SimCall::Close((*handle).kind));
        let id = (*handle).native_id;
        self.state.handles.borrow_mut().remove(&id);
        self.state.events.borrow_mut().retain(|event| event.id != id);
        self.state.closing.borrow_mut().push_back((handle, cb));
    }

    unsafe fn fs_poll_init(&self, handle: *mut RawHandle) -> c_int {
        if let Some(status) = self.enter(SimOp::FsPollInit) {
            return status;
        }
        self.insert(
            handle,
            Detail::FsPoll {
                path: CString::default(),
                interval: 0,
                cb: None,
            },
        );
        0
    }

    unsafe fn fs_poll_start(
        &self,
        handle: *mut RawHandle,
        cb: FsPollCb,
        path: &CStr,
        interval: c_uint,
    ) -> c_int {
        if let Some(status) = self.enter(SimOp::FsPollStart) {
            return status;
        }
        self.with_handle(handle, |h| match &mut h.detail {
            Detail::FsPoll {
                path: watched,
                interval: every,
                cb: slot,
            } => {
                *watched = path.to_owned();
                *every = interval;
                *slot = Some(cb);
                h.active = true;
                0
            }
            _ => -libc::EINVAL,
        })
    }

    unsafe fn tty_init(&self, handle: *mut RawHandle, fd: c_int, _readable: bool) -> c_int {
        if let Some(status) = self.enter(SimOp::TtyInit) {
            return status;
        }
        if fd < 0 {
            return -libc::EBADF;
        }
        self.insert(
            handle,
            Detail::Tty {
                fd,
                mode: TtyMode::Normal,
            },
        );
        0
    }

    unsafe fn tty_set_mode(&self, handle: *mut RawHandle, mode: TtyMode) -> c_int {
        if let Some(status) = self.enter(SimOp::TtySetMode) {
            return status;
        }
        if let Some(&status) = self.state.rejected_modes.borrow().get(&mode) {
            return status;
        }
        self.with_handle(handle, |h| match &mut h.detail {
            Detail::Tty { mode: current, .. } => {
                *current = mode;
                0
            }
            _ => -libc::EINVAL,
        })
    }

    unsafe fn tty_get_winsize(
        &self,
        handle: *mut RawHandle,
        width: &mut c_int,
        height: &mut c_int,
    ) -> c_int {
        if let Some(status) = self.enter(SimOp::TtyGetWinsize) {
            return status;
        }
        let winsizes = self.state.winsizes.borrow();
        self.with_handle(handle, |h| match h.detail {
            Detail::Tty { fd, .. } => {
                let (w, hgt) = winsizes.get(&fd).copied().unwrap_or(DEFAULT_WINSIZE);
                *width = w;
                *height = hgt;
                0
            }
            _ => -libc::EINVAL,
        })
    }

    fn tty_reset_mode(&self) -> c_int {
        if let Some(status) = self.enter(SimOp::TtyResetMode) {
            return status;
        }
        for handle in self.state.handles.borrow_mut().values_mut() {
            if let Detail::Tty { mode, .. } = &mut handle.detail {
                *mode = TtyMode::Normal;
            }
        }
        0
    }

    unsafe fn timer_init(&self, handle: *mut RawHandle) -> c_int {
        if let Some(status) = self.enter(SimOp::TimerInit) {
            return status;
        }
        self.insert(
            handle,
            Detail::Timer {
                cb: None,
                due: 0,
                repeat: 0,
            },
        );
        0
    }

    unsafe fn timer_start(
        &self,
        handle: *mut RawHandle,
        cb: TimerCb,
        timeout: u64,
        repeat: u64,
    ) -> c_int {
        if let Some(status) = self.enter(SimOp::TimerStart) {
            return status;
        }
        let now = self.state.now.get();
        self.with_handle(handle, |h| match &mut h.detail {
            Detail::Timer {
                cb: slot,
                due,
                repeat: every,
            } => {
                *slot = Some(cb);
                *due = now.saturating_add(timeout);
                *every = repeat;
                h.active = true;
                0
            }
            _ => -libc::EINVAL,
        })
    }

    unsafe fn timer_get_repeat(&self, handle: *const RawHandle) -> u64 {
        let id = (*handle).native_id;
        match self.state.handles.borrow().get(&id) {
            Some(SimHandle {
                detail: Detail::Timer { repeat, .. },
                ..
            }) => *repeat,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::raw_stats;

    thread_local! {
        static FIRED: RefCell<Vec<(u64, c_int)>> = RefCell::new(Vec::new());
    }

    unsafe extern "C" fn record_poll(
        handle: *mut RawHandle,
        _status: c_int,
        _prev: *const NativeStat,
        curr: *const NativeStat,
    ) {
        FIRED.with(|f| f.borrow_mut().push(((*handle).native_id, (*curr).st_size as c_int)));
    }

    unsafe extern "C" fn record_timer(handle: *mut RawHandle) {
        FIRED.with(|f| f.borrow_mut().push(((*handle).native_id, -1)));
    }

    unsafe extern "C" fn free_on_close(handle: *mut RawHandle) {
        RawHandle::free(handle);
    }

    fn fired() -> Vec<(u64, c_int)> {
        FIRED.with(|f| f.borrow().clone())
    }

    #[test]
    fn injected_fault_is_consumed_once() {
        let sim = SimLoop::new();
        sim.fail_next(SimOp::TimerInit, -libc::ENOMEM);
        let raw = RawHandle::alloc(HandleKind::Timer);
        unsafe {
            assert_eq!(sim.timer_init(raw), -libc::ENOMEM);
            assert_eq!(sim.open_handles(), 0);
            assert_eq!(sim.timer_init(raw), 0);
            assert_eq!(sim.open_handles(), 1);
            sim.close(raw, free_on_close);
        }
        assert_eq!(sim.close_loop(), 0);
        assert_eq!(raw_stats().outstanding(), 0);
    }

    #[test]
    fn close_drops_queued_events() {
        let sim = SimLoop::new();
        let raw = RawHandle::alloc(HandleKind::FsPoll);
        let path = CString::new("/tmp/x").unwrap();
        unsafe {
            assert_eq!(sim.fs_poll_init(raw), 0);
            assert_eq!(sim.fs_poll_start(raw, record_poll, &path, 10), 0);
        }
        assert_eq!(sim.emit_fs_poll("/tmp/x", NativeStat::default(), NativeStat::default()), 1);
        assert_eq!(sim.pending_events(), 1);
        unsafe { sim.close(raw, free_on_close) };
        assert_eq!(sim.pending_events(), 0);
        assert_eq!(sim.run(RunMode::Default), 0);
        assert!(fired().is_empty());
        assert_eq!(raw_stats().outstanding(), 0);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let sim = SimLoop::new();
        let late = RawHandle::alloc(HandleKind::Timer);
        let early = RawHandle::alloc(HandleKind::Timer);
        unsafe {
            sim.timer_init(late);
            sim.timer_init(early);
            sim.timer_start(late, record_timer, 50, 0);
            sim.timer_start(early, record_timer, 10, 0);
        }
        sim.advance(100);
        sim.run(RunMode::Default);
        let ids: Vec<u64> = fired().into_iter().map(|(id, _)| id).collect();
        unsafe {
            assert_eq!(ids, vec![(*early).native_id, (*late).native_id]);
            sim.close(late, free_on_close);
            sim.close(early, free_on_close);
        }
        assert_eq!(sim.close_loop(), 0);
        assert!(sim.is_closed());
    }

    #[test]
    fn close_loop_reports_busy_while_handles_are_open() {
        let sim = SimLoop::new();
        let raw = RawHandle::alloc(HandleKind::Tty);
        unsafe {
            assert_eq!(sim.tty_init(raw, 1, false), 0);
        }
        assert_eq!(sim.close_loop(), -libc::EBUSY);
        unsafe { sim.close(raw, free_on_close) };
        assert_eq!(sim.close_loop(), 0);
        assert_eq!(
            sim.calls(),
            vec![SimCall::Op(SimOp::TtyInit), SimCall::Close(HandleKind::Tty)]
        );
    }
}
