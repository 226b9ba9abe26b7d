//! Drives a callback-based native event loop from a reference-counted host.
//!
//! Each handle kind (`FsPoll`, `Tty`, `Timer`) validates its arguments,
//! allocates a native handle struct, and pins the host callback in the
//! thread's root registry for as long as the native loop may call it.
//! Native statuses come back as [`LoopResult`] values, both from operations
//! and inside callbacks.

// Declare top-level modules
pub mod config;
pub mod error;
pub mod native;
pub mod tty;

mod dispatch;
mod event_loop;
mod fs_poll;
mod handle;
mod timer;

pub use config::{ConfigError, DispatchConfig, LoopConfig};
pub use error::{translate, unit_result, ErrorCode, HostError, LoopResult};
pub use event_loop::{Loop, LoopStats};
pub use fs_poll::{FileKind, FsPoll, FsPollEvent, Stat, Timespec};
pub use handle::HandleState;
pub use native::sim::{SimCall, SimLoop, SimOp};
pub use native::{HandleKind, NativeLoop, NativeStat, NativeTimespec, RawStats, RunMode, TtyMode};
pub use timer::Timer;
pub use tty::{Tty, WinSize};
