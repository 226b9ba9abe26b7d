// src/event_loop.rs
//
// Host-side owner of a native loop. Tracks every handle created on it so
// that closing or dropping the loop can close them first.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use slab::Slab;
use tether_gc::RootStats;

use crate::config::{ConfigError, LoopConfig};
use crate::dispatch::panic_message;
use crate::error::{translate, ErrorCode, HostError, LoopResult};
use crate::handle::HandleCell;
use crate::native::{raw_stats, NativeLoop, RawStats, RunMode};

type ExceptionHook = Rc<dyn Fn(&HostError)>;

pub(crate) struct LoopInner {
    native: Box<dyn NativeLoop>,
    config: LoopConfig,
    closed: Cell<bool>,
    running: Cell<bool>,
    live: RefCell<Slab<Weak<HandleCell>>>,
    exception_hook: RefCell<Option<ExceptionHook>>,
}

impl LoopInner {
    pub(crate) fn native(&self) -> &dyn NativeLoop {
        &*self.native
    }

    pub(crate) fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn ensure_open(&self) -> LoopResult<()> {
        if self.closed.get() {
            Err(ErrorCode::EBADF)
        } else {
            Ok(())
        }
    }

    pub(crate) fn track(&self, cell: Weak<HandleCell>) -> usize {
        self.live.borrow_mut().insert(cell)
    }

    pub(crate) fn untrack(&self, key: usize) {
        if self.live.borrow_mut().try_remove(key).is_none() {
            log::warn!("Handle key {} was not tracked by its loop.", key);
        }
    }

    /// Hands a failed callback to the exception hook. A panic in the hook
    /// is logged and goes no further.
    pub(crate) fn report(&self, err: &HostError) {
        let hook = self.exception_hook.borrow().clone();
        let Some(hook) = hook else {
            log::error!("Uncaught error in event callback: {}", err);
            return;
        };
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook(err))) {
            log::error!(
                "Exception hook panicked ({}) while handling: {}",
                panic_message(panic.as_ref()),
                err
            );
        }
    }

    /// Closes every tracked handle and then the native loop. Runs once.
    fn teardown(&self) -> LoopResult<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        let handles: Vec<Rc<HandleCell>> = self
            .live
            .borrow()
            .iter()
            .filter_map(|(_, cell)| cell.upgrade())
            .collect();
        log::info!("Closing loop with {} live handles.", handles.len());
        for cell in &handles {
            cell.close_with(self);
        }
        drop(handles);

        let status = self.native.close_loop();
        if status < 0 {
            log::error!(
                "Native loop refused to close: {}.",
                ErrorCode::from_native(status).name()
            );
        }
        translate(status, || ())
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        // Errors were already logged by teardown.
        let _ = self.teardown();
    }
}

/// Diagnostic counters for a loop and the thread it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Handles created on this loop and not yet closed.
    pub live_handles: usize,
    /// Registry counters for the current thread.
    pub roots: RootStats,
    /// Native struct allocation counters for the current thread.
    pub raw: RawStats,
}

/// A native event loop driven from host code.
///
/// Clones share the same loop. Dropping the last clone closes every handle
/// still open and then the native loop, as [`Loop::close`] does.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("closed", &self.inner.closed.get())
            .field("running", &self.inner.running.get())
            .field("live_handles", &self.inner.live.borrow().len())
            .finish()
    }
}

impl Loop {
    /// Creates a loop with the default config. The thread's registry is
    /// left as it is.
    pub fn new(native: impl NativeLoop + 'static) -> Self {
        Self::build(Box::new(native), LoopConfig::default())
    }

    /// Creates a loop after validating `config`.
    ///
    /// `config.roots` is applied to this thread's registry, which every loop
    /// on the thread shares. A `max_entries` cap can only be lowered this
    /// way, never raised or removed.
    pub fn with_config(
        native: impl NativeLoop + 'static,
        config: LoopConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tether_gc::tighten(&config.roots);
        Ok(Self::build(Box::new(native), config))
    }

    fn build(native: Box<dyn NativeLoop>, config: LoopConfig) -> Self {
        log::info!("Loop created.");
        Self {
            inner: Rc::new(LoopInner {
                native,
                config,
                closed: Cell::new(false),
                running: Cell::new(false),
                live: RefCell::new(Slab::new()),
                exception_hook: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Runs the native loop. Returns whether handles are still alive.
    ///
    /// Fails with `EBUSY` when called from inside a callback of this loop.
    pub fn run(&self, mode: RunMode) -> LoopResult<bool> {
        self.inner.ensure_open()?;
        if self.inner.running.replace(true) {
            return Err(ErrorCode::EBUSY);
        }
        log::debug!("Running loop ({:?}).", mode);
        let status = self.inner.native.run(mode);
        self.inner.running.set(false);
        translate(status, || status > 0)
    }

    pub fn stop(&self) {
        if !self.inner.is_closed() {
            self.inner.native.stop();
        }
    }

    pub fn alive(&self) -> bool {
        !self.inner.is_closed() && self.inner.native.alive()
    }

    /// Closes every open handle, flushes pending close callbacks and
    /// releases the native loop. Closing a closed loop does nothing.
    pub fn close(&self) -> LoopResult<()> {
        if self.inner.running.get() {
            return Err(ErrorCode::EBUSY);
        }
        self.inner.teardown()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Installs the sink for errors and panics raised by host callbacks.
    /// Without a hook they are logged at error level.
    pub fn set_exception_hook(&self, hook: impl Fn(&HostError) + 'static) {
        *self.inner.exception_hook.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn clear_exception_hook(&self) {
        self.inner.exception_hook.borrow_mut().take();
    }

    pub fn stats(&self) -> LoopStats {
        LoopStats {
            live_handles: self.inner.live.borrow().len(),
            roots: tether_gc::stats(),
            raw: raw_stats(),
        }
    }
}
