// src/timer.rs

use std::rc::Rc;

use crate::dispatch::{dispatch, pin_callback};
use crate::error::{ErrorCode, HostError, LoopResult};
use crate::event_loop::Loop;
use crate::handle::{HandleCell, HandleState};
use crate::native::{HandleKind, RawHandle};

/// A started timer.
///
/// A one-shot timer (`repeat_ms == 0`) closes itself once its callback has
/// run. A repeating timer fires every `repeat_ms` until closed.
#[derive(Debug, Clone)]
pub struct Timer {
    handle: Rc<HandleCell>,
}

impl Timer {
    pub fn start<F>(lp: &Loop, timeout_ms: i64, repeat_ms: i64, mut cb: F) -> LoopResult<Timer>
    where
        F: FnMut(&Timer) -> Result<(), HostError> + 'static,
    {
        let inner = lp.inner();
        let timeout = u64::try_from(timeout_ms).map_err(|_| ErrorCode::EINVAL)?;
        let repeat = u64::try_from(repeat_ms).map_err(|_| ErrorCode::EINVAL)?;

        let cell = HandleCell::create(inner, HandleKind::Timer)?;
        cell.init(inner, |native, raw| unsafe { native.timer_init(raw) })?;
        let callback = pin_callback::<Timer, ()>(move |timer: &Timer, ()| cb(timer));
        cell.start(inner, callback, |native, raw| unsafe {
            native.timer_start(raw, on_timer, timeout, repeat)
        })?;
        Ok(Timer { handle: cell })
    }

    /// The repeat interval in milliseconds; `0` for a one-shot timer.
    pub fn repeat(&self) -> LoopResult<u64> {
        let (lp, raw) = self.handle.live()?;
        Ok(unsafe { lp.native().timer_get_repeat(raw) })
    }

    /// Idempotent.
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

unsafe extern "C" fn on_timer(raw: *mut RawHandle) {
    let Some(cell) = dispatch::<Timer, ()>(raw, |handle| Timer { handle }, || ()) else {
        return;
    };
    if cell.state() != HandleState::Active {
        return;
    }
    if let Ok((lp, raw)) = cell.live() {
        if lp.native().timer_get_repeat(raw) == 0 {
            log::debug!("One-shot timer fired, closing.");
            cell.close();
        }
    }
}
