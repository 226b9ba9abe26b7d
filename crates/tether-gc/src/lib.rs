//! Pinning of host values for the lifetime of native references.
//!
//! A native event loop keeps raw pointers to handle structs and calls back
//! into host code long after the call that created them has returned. Any
//! host value reachable only from such a pointer must be pinned here, and
//! unpinned exactly once when the native side can no longer reach it.

mod error;
mod roots;

pub use crate::error::RootsError;
pub use crate::roots::{
    configure, register, release, reserve, resolve, resolve_as, stats, tighten, with_registry,
    RootRegistry, RootSlot, RootStats, RootsConfig,
};
