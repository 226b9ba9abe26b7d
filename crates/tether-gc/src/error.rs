use thiserror::Error;

use crate::roots::RootSlot;

/// Errors raised by the root registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RootsError {
    #[error("Root registry exhausted (limit of {limit} pinned values).")]
    Exhausted { limit: usize },

    #[error("Root slot {0} is stale or was already released.")]
    StaleSlot(RootSlot),

    #[error("Root slot {slot} does not hold a value of type {expected}.")]
    TypeMismatch { slot: RootSlot, expected: &'static str },
}
