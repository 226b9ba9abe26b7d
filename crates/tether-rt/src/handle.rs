// src/handle.rs
//
// One native handle struct plus the bookkeeping that decides how it dies.
//
// A handle that never got past native init only owns memory and is freed on
// the spot. Once init succeeded the native loop knows about it and the only
// way out is a native close, whose callback frees the struct. Registry
// entries are pinned after a successful start and released when the handle
// closes, whatever the reason.

use std::any::Any;
use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::ptr;
use std::rc::{Rc, Weak};

use tether_gc::RootSlot;

use crate::error::{ErrorCode, LoopResult};
use crate::event_loop::LoopInner;
use crate::native::{on_native_close, HandleKind, NativeLoop, RawHandle};

/// Lifecycle of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Struct allocated, native init not attempted yet.
    Uninit,
    /// Native init succeeded.
    Initialized,
    /// Native start succeeded and callbacks are pinned.
    Active,
    Closed,
    /// Init or start failed. Nothing is left to tear down.
    Failed,
}

pub(crate) struct HandleCell {
    kind: HandleKind,
    state: Cell<HandleState>,
    raw: Cell<*mut RawHandle>,
    cb_read: Cell<Option<RootSlot>>,
    cb_listen: Cell<Option<RootSlot>>,
    in_callback: Cell<bool>,
    close_deferred: Cell<bool>,
    owner: Weak<LoopInner>,
    live_key: Cell<Option<usize>>,
}

impl fmt::Debug for HandleCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCell")
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .field("cb_read", &self.cb_read.get())
            .field("cb_listen", &self.cb_listen.get())
            .finish()
    }
}

impl HandleCell {
    /// Allocates the native struct and tracks the handle on `lp`.
    pub(crate) fn create(lp: &Rc<LoopInner>, kind: HandleKind) -> LoopResult<Rc<HandleCell>> {
        lp.ensure_open()?;
        let raw = RawHandle::alloc(kind);
        let cell = Rc::new(HandleCell {
            kind,
            state: Cell::new(HandleState::Uninit),
            raw: Cell::new(raw),
            cb_read: Cell::new(None),
            cb_listen: Cell::new(None),
            in_callback: Cell::new(false),
            close_deferred: Cell::new(false),
            owner: Rc::downgrade(lp),
            live_key: Cell::new(None),
        });
        unsafe {
            (*raw).data = Rc::as_ptr(&cell) as *mut c_void;
        }
        cell.live_key.set(Some(lp.track(Rc::downgrade(&cell))));
        log::trace!("Allocated {:?} handle.", kind);
        Ok(cell)
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.kind
    }

    pub(crate) fn state(&self) -> HandleState {
        self.state.get()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state.get(), HandleState::Closed | HandleState::Failed)
    }

    pub(crate) fn owner(&self) -> Option<Rc<LoopInner>> {
        self.owner.upgrade()
    }

    pub(crate) fn cb_read(&self) -> Option<RootSlot> {
        self.cb_read.get()
    }

    pub(crate) fn cb_listen(&self) -> Option<RootSlot> {
        self.cb_listen.get()
    }

    /// The owning loop and the native struct, for operations on an open handle.
    pub(crate) fn live(&self) -> LoopResult<(Rc<LoopInner>, *mut RawHandle)> {
        if !matches!(self.state.get(), HandleState::Initialized | HandleState::Active) {
            return Err(ErrorCode::EBADF);
        }
        let lp = self.owner.upgrade().ok_or(ErrorCode::EBADF)?;
        lp.ensure_open()?;
        let raw = self.raw.get();
        if raw.is_null() {
            return Err(ErrorCode::EBADF);
        }
        Ok((lp, raw))
    }

    // --- Transitions ---

    /// `Uninit -> Initialized`. On failure the struct is freed without a
    /// native close, since the native loop never saw it.
    pub(crate) fn init(
        self: &Rc<Self>,
        lp: &LoopInner,
        native_init: impl FnOnce(&dyn NativeLoop, *mut RawHandle) -> c_int,
    ) -> LoopResult<()> {
        debug_assert_eq!(self.state.get(), HandleState::Uninit);
        let status = native_init(lp.native(), self.raw.get());
        if status < 0 {
            let code = ErrorCode::from_native(status);
            log::debug!("Native init of {:?} handle failed: {}.", self.kind, code.name());
            self.fail(lp);
            return Err(code);
        }
        self.state.set(HandleState::Initialized);
        log::debug!("{:?} handle initialized.", self.kind);
        Ok(())
    }

    /// `Initialized -> Active`, pinning `callback` as `cb_read` and the handle
    /// itself as `cb_listen`.
    ///
    /// The registry is enlarged for both entries before the native start, so
    /// once the native side holds a reference the pins cannot fail halfway.
    pub(crate) fn start(
        self: &Rc<Self>,
        lp: &LoopInner,
        callback: Rc<dyn Any>,
        native_start: impl FnOnce(&dyn NativeLoop, *mut RawHandle) -> c_int,
    ) -> LoopResult<()> {
        debug_assert_eq!(self.state.get(), HandleState::Initialized);
        if let Err(err) = tether_gc::reserve(2) {
            log::warn!("Cannot pin callbacks for {:?} handle: {}.", self.kind, err);
            self.fail(lp);
            return Err(err.into());
        }

        let status = native_start(lp.native(), self.raw.get());
        if status < 0 {
            let code = ErrorCode::from_native(status);
            log::debug!("Native start of {:?} handle failed: {}.", self.kind, code.name());
            self.fail(lp);
            return Err(code);
        }
        self.state.set(HandleState::Active);

        let pinned = tether_gc::register(callback).and_then(|read| {
            self.cb_read.set(Some(read));
            tether_gc::register(Rc::clone(self) as Rc<dyn Any>)
        });
        match pinned {
            Ok(listen) => {
                self.cb_listen.set(Some(listen));
                log::debug!("{:?} handle active.", self.kind);
                Ok(())
            }
            Err(err) => {
                log::error!("Pinning {:?} handle failed after reserve: {}.", self.kind, err);
                self.close_with(lp);
                Err(ErrorCode::ENOMEM)
            }
        }
    }

    /// Requests close. Idempotent. While the handle's own callback runs the
    /// close is recorded and completed when the dispatch returns.
    pub(crate) fn close(self: &Rc<Self>) {
        if self.is_closed() {
            return;
        }
        if self.in_callback.get() {
            log::debug!("Deferring close of {:?} handle until its callback returns.", self.kind);
            self.close_deferred.set(true);
            return;
        }
        match self.owner.upgrade() {
            Some(lp) => self.close_with(&lp),
            None => self.teardown(None, HandleState::Closed),
        }
    }

    /// Closes through `lp`. Used directly by loop teardown, where the loop
    /// may no longer be reachable through the weak owner.
    pub(crate) fn close_with(self: &Rc<Self>, lp: &LoopInner) {
        if self.is_closed() {
            return;
        }
        self.teardown(Some(lp), HandleState::Closed);
    }

    fn fail(self: &Rc<Self>, lp: &LoopInner) {
        self.teardown(Some(lp), HandleState::Failed);
    }

    /// Releases everything the handle owns according to its current state and
    /// moves it to `terminal`.
    fn teardown(self: &Rc<Self>, lp: Option<&LoopInner>, terminal: HandleState) {
        let prior = self.state.replace(terminal);
        self.close_deferred.set(false);
        let released = self.release_roots();

        let raw = self.raw.replace(ptr::null_mut());
        if !raw.is_null() {
            unsafe {
                match (prior, lp) {
                    (HandleState::Initialized | HandleState::Active, Some(lp)) => {
                        (*raw).data = ptr::null_mut();
                        lp.native().close(raw, on_native_close);
                    }
                    (HandleState::Initialized | HandleState::Active, None) => {
                        log::warn!("{:?} handle outlived its loop; freeing without close.", self.kind);
                        RawHandle::free(raw);
                    }
                    _ => RawHandle::free(raw),
                }
            }
        }

        if let (Some(lp), Some(key)) = (lp, self.live_key.take()) {
            lp.untrack(key);
        }
        log::debug!("{:?} handle {:?} -> {:?}.", self.kind, prior, terminal);

        // Pinned values may hold the last strong reference to other handles,
        // so they are dropped only after every borrow above has ended.
        drop(released);
    }

    fn release_roots(&self) -> Vec<Rc<dyn Any>> {
        [self.cb_read.take(), self.cb_listen.take()]
            .into_iter()
            .flatten()
            .filter_map(|slot| match tether_gc::release(slot) {
                Ok(value) => Some(value),
                Err(err) => {
                    log::warn!("Releasing {} for {:?} handle: {}.", slot, self.kind, err);
                    None
                }
            })
            .collect()
    }

    // --- Dispatch support ---

    /// Marks the handle as running its callback. Returns false if it already is.
    pub(crate) fn enter_callback(&self) -> bool {
        !self.in_callback.replace(true)
    }

    /// Clears the callback mark and reports whether a close was requested
    /// meanwhile.
    pub(crate) fn leave_callback(&self) -> bool {
        self.in_callback.set(false);
        self.close_deferred.take()
    }

    pub(crate) fn defer_close(&self) {
        self.close_deferred.set(true);
    }
}

impl Drop for HandleCell {
    // Only reached for handles that are not pinned, so the registry is never
    // touched here: it may already be gone during thread shutdown.
    fn drop(&mut self) {
        let raw = self.raw.replace(ptr::null_mut());
        if raw.is_null() {
            return;
        }
        let lp = self.owner.upgrade();
        unsafe {
            match (self.state.get(), lp.as_ref()) {
                (HandleState::Initialized | HandleState::Active, Some(lp)) if !lp.is_closed() => {
                    log::debug!("Closing dropped {:?} handle.", self.kind);
                    (*raw).data = ptr::null_mut();
                    lp.native().close(raw, on_native_close);
                }
                _ => RawHandle::free(raw),
            }
        }
        if let (Some(lp), Some(key)) = (lp, self.live_key.take()) {
            lp.untrack(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimCall, SimLoop, SimOp};
    use crate::native::raw_stats;
    use crate::Loop;

    fn init_timer(lp: &Loop) -> Rc<HandleCell> {
        let cell = HandleCell::create(lp.inner(), HandleKind::Timer).unwrap();
        cell.init(lp.inner(), |native, raw| unsafe { native.timer_init(raw) })
            .unwrap();
        cell
    }

    unsafe extern "C" fn ignore_timer(_: *mut RawHandle) {}

    #[test]
    fn failed_init_frees_without_close() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        sim.fail_next(SimOp::TimerInit, -libc::ENOMEM);

        let cell = HandleCell::create(lp.inner(), HandleKind::Timer).unwrap();
        let result = cell.init(lp.inner(), |native, raw| unsafe { native.timer_init(raw) });

        assert_eq!(result, Err(ErrorCode::ENOMEM));
        assert_eq!(cell.state(), HandleState::Failed);
        assert!(!sim.calls().iter().any(|c| matches!(c, SimCall::Close(_))));
        assert_eq!(raw_stats().outstanding(), 0);
        assert_eq!(lp.stats().live_handles, 0);
    }

    #[test]
    fn failed_start_closes_and_pins_nothing() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        let before = tether_gc::stats().live;
        sim.fail_next(SimOp::TimerStart, -libc::EINVAL);

        let cell = init_timer(&lp);
        let result = cell.start(lp.inner(), Rc::new(()), |native, raw| unsafe {
            native.timer_start(raw, ignore_timer, 1, 0)
        });

        assert_eq!(result, Err(ErrorCode::EINVAL));
        assert_eq!(cell.state(), HandleState::Failed);
        assert_eq!(sim.calls().last(), Some(&SimCall::Close(HandleKind::Timer)));
        // Freed by the close callback, not before.
        assert_eq!(raw_stats().outstanding(), 1);
        lp.run(crate::RunMode::NoWait).unwrap();
        assert_eq!(raw_stats().outstanding(), 0);
        assert_eq!(tether_gc::stats().live, before);
    }

    #[test]
    fn start_pins_two_entries_and_close_releases_them() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        let before = tether_gc::stats().live;

        let cell = init_timer(&lp);
        cell.start(lp.inner(), Rc::new(5u8), |native, raw| unsafe {
            native.timer_start(raw, ignore_timer, 1, 0)
        })
        .unwrap();
        assert_eq!(cell.state(), HandleState::Active);
        assert_eq!(tether_gc::stats().live, before + 2);
        let listen = cell.cb_listen().unwrap();
        let pinned = tether_gc::resolve_as::<HandleCell>(listen).unwrap();
        assert!(Rc::ptr_eq(&pinned, &cell));
        drop(pinned);

        cell.close();
        cell.close();
        assert_eq!(cell.state(), HandleState::Closed);
        assert_eq!(cell.cb_read(), None);
        assert_eq!(tether_gc::stats().live, before);
        let closes = sim
            .calls()
            .iter()
            .filter(|c| matches!(c, SimCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn registry_exhaustion_closes_with_enomem() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        let live = tether_gc::stats().live;
        tether_gc::configure(&tether_gc::RootsConfig {
            initial_capacity: 4,
            max_entries: Some(live + 1),
        });

        let cell = init_timer(&lp);
        let result = cell.start(lp.inner(), Rc::new(()), |native, raw| unsafe {
            native.timer_start(raw, ignore_timer, 1, 0)
        });

        tether_gc::configure(&tether_gc::RootsConfig::default());
        assert_eq!(result, Err(ErrorCode::ENOMEM));
        assert!(cell.is_closed());
        assert_eq!(tether_gc::stats().live, live);
        assert!(!sim.calls().contains(&SimCall::Op(SimOp::TimerStart)));
    }

    #[test]
    fn close_inside_callback_is_deferred() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        let cell = init_timer(&lp);

        assert!(cell.enter_callback());
        assert!(!cell.enter_callback());
        cell.close();
        assert_eq!(cell.state(), HandleState::Initialized);
        assert!(cell.leave_callback());
        cell.close();
        assert!(cell.is_closed());
    }

    #[test]
    fn dropping_an_initialized_handle_closes_it() {
        let sim = SimLoop::new();
        let lp = Loop::new(sim.clone());
        let cell = init_timer(&lp);
        assert_eq!(sim.open_handles(), 1);
        drop(cell);
        assert_eq!(sim.open_handles(), 0);
        assert_eq!(lp.stats().live_handles, 0);
        lp.run(crate::RunMode::NoWait).unwrap();
        assert_eq!(raw_stats().outstanding(), 0);
    }
}
