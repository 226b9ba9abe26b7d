// src/dispatch.rs
//
// Entry from native callbacks into host code.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::error::HostError;
use crate::handle::{HandleCell, HandleState};
use crate::native::RawHandle;

/// How a host callback is stored in the root registry. `H` is the
/// host-visible handle type, `P` the event payload.
pub(crate) type HostCallback<H, P> = RefCell<Box<dyn FnMut(&H, P) -> Result<(), HostError>>>;

pub(crate) fn pin_callback<H: 'static, P: 'static>(
    f: impl FnMut(&H, P) -> Result<(), HostError> + 'static,
) -> Rc<dyn Any> {
    let boxed: Box<dyn FnMut(&H, P) -> Result<(), HostError>> = Box::new(f);
    let callback: Rc<HostCallback<H, P>> = Rc::new(RefCell::new(boxed));
    callback
}

/// Marks a handle as inside its callback for as long as it lives.
///
/// Dropping the scope finishes a close requested while the callback ran,
/// on every exit path.
struct DispatchScope<'a> {
    cell: &'a Rc<HandleCell>,
}

impl<'a> DispatchScope<'a> {
    fn enter(cell: &'a Rc<HandleCell>) -> Option<Self> {
        if cell.state() != HandleState::Active {
            log::debug!(
                "Dropping event for {:?} handle in state {:?}.",
                cell.kind(),
                cell.state()
            );
            return None;
        }
        if !cell.enter_callback() {
            log::warn!("Dropping re-entrant event for {:?} handle.", cell.kind());
            return None;
        }
        Some(Self { cell })
    }
}

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        if self.cell.leave_callback() {
            self.cell.close();
        }
    }
}

/// Resolves the handle behind a native struct without taking ownership of
/// the reference the struct's back-pointer stands for.
unsafe fn resolve_cell(raw: *mut RawHandle) -> Option<Rc<HandleCell>> {
    if raw.is_null() {
        return None;
    }
    let data = (*raw).data as *const HandleCell;
    if data.is_null() {
        return None;
    }
    // The back-pointer is cleared before the cell can be released, so a
    // non-null pointer always refers to a live cell.
    Rc::increment_strong_count(data);
    Some(Rc::from_raw(data))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Delivers one event to the host callback pinned for `raw`.
///
/// `wrap` builds the host-visible handle from the pinned listener and
/// `payload` builds the event value; neither runs if the event is dropped.
/// Returns the handle if the callback ran. The caller must not use `raw`
/// afterwards, since the callback may have closed the handle.
///
/// # Safety
/// `raw` is the pointer the native loop passed to the trampoline.
pub(crate) unsafe fn dispatch<H: 'static, P: 'static>(
    raw: *mut RawHandle,
    wrap: impl FnOnce(Rc<HandleCell>) -> H,
    payload: impl FnOnce() -> P,
) -> Option<Rc<HandleCell>> {
    let Some(cell) = resolve_cell(raw) else {
        log::warn!("Event for a closed handle dropped.");
        return None;
    };
    let lp = cell.owner()?;
    {
        let scope = DispatchScope::enter(&cell)?;

        let (Some(read), Some(listen)) = (cell.cb_read(), cell.cb_listen()) else {
            log::error!("Active {:?} handle has no pinned callback.", cell.kind());
            scope.cell.defer_close();
            return None;
        };
        let resolved = tether_gc::resolve_as::<HostCallback<H, P>>(read)
            .and_then(|callback| Ok((callback, tether_gc::resolve_as::<HandleCell>(listen)?)));
        let (callback, listener) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("Cannot resolve callbacks of {:?} handle: {}.", cell.kind(), err);
                scope.cell.defer_close();
                return None;
            }
        };

        let host = wrap(listener);
        let value = payload();
        if lp.config().dispatch.log_events {
            log::debug!("Dispatching event to {:?} handle.", cell.kind());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match callback.try_borrow_mut() {
            Ok(mut f) => (*f)(&host, value),
            Err(_) => Err(HostError::raised("callback is already running")),
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(HostError::Panicked(panic_message(panic.as_ref()))),
        };
        if let Some(err) = failure {
            lp.report(&err);
            scope.cell.defer_close();
        }
    }
    Some(cell)
}
