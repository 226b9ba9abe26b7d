// src/tty.rs
//
// Terminal handles. They carry no callbacks, so nothing is pinned: the
// handle stays `Initialized` for its whole life and is closed explicitly,
// by loop teardown, or when the last `Tty` value is dropped.

use std::ffi::c_int;
use std::rc::Rc;

use crate::error::{translate, unit_result, ErrorCode, LoopResult};
use crate::event_loop::Loop;
use crate::handle::{HandleCell, HandleState};
use crate::native::{HandleKind, TtyMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub width: i32,
    pub height: i32,
}

impl TtyMode {
    /// Decodes the host's integer encoding (`0` normal, `1` raw, `2` io).
    ///
    /// Any other value is a caller bug. Debug builds assert; release builds
    /// fall back to `Normal`.
    pub fn from_host(mode: i64) -> TtyMode {
        match mode {
            0 => TtyMode::Normal,
            1 => TtyMode::Raw,
            2 => TtyMode::Io,
            other => {
                debug_assert!(false, "tty mode {} out of range", other);
                log::error!("Tty mode {} out of range, using normal mode.", other);
                TtyMode::Normal
            }
        }
    }
}

/// An initialized terminal.
#[derive(Debug, Clone)]
pub struct Tty {
    handle: Rc<HandleCell>,
}

impl Tty {
    pub fn init(lp: &Loop, fd: i32, readable: bool) -> LoopResult<Tty> {
        let inner = lp.inner();
        if fd < 0 {
            return Err(ErrorCode::EBADF);
        }
        let cell = HandleCell::create(inner, HandleKind::Tty)?;
        cell.init(inner, |native, raw| unsafe {
            native.tty_init(raw, fd, readable)
        })?;
        Ok(Tty { handle: cell })
    }

    pub fn set_mode(&self, mode: TtyMode) -> LoopResult<()> {
        let (lp, raw) = self.handle.live()?;
        let status = unsafe { lp.native().tty_set_mode(raw, mode) };
        if status < 0 {
            log::debug!("Switching tty to {:?} failed.", mode);
        }
        unit_result(status)
    }

    /// [`set_mode`](Self::set_mode) with the host's integer encoding.
    pub fn set_mode_raw(&self, mode: i64) -> LoopResult<()> {
        self.set_mode(TtyMode::from_host(mode))
    }

    pub fn get_winsize(&self) -> LoopResult<WinSize> {
        let (lp, raw) = self.handle.live()?;
        let (mut width, mut height): (c_int, c_int) = (0, 0);
        let status = unsafe { lp.native().tty_get_winsize(raw, &mut width, &mut height) };
        translate(status, || WinSize { width, height })
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

/// Restores every terminal of the loop to the mode it had at startup.
pub fn reset_mode(lp: &Loop) -> LoopResult<()> {
    let inner = lp.inner();
    inner.ensure_open()?;
    unit_result(inner.native().tty_reset_mode())
}
