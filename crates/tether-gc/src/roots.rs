use std::any::{type_name, Any};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::Deserialize;
use slab::Slab;

use crate::error::RootsError;

thread_local! {
    static GLOBAL_ROOTS: RefCell<RootRegistry> = RefCell::new(RootRegistry::new());
}

/// Opaque key of a pinned host value.
///
/// The generation guards against a released slot being confused with a
/// later registration that reused the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSlot {
    index: usize,
    generation: u32,
}

impl RootSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// Sizing of a thread's registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    /// Slots reserved up front.
    pub initial_capacity: usize,
    /// Hard cap on simultaneously pinned values. `None` means unbounded.
    pub max_entries: Option<usize>,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootStats {
    pub live: usize,
    pub capacity: usize,
    pub registered_total: u64,
    pub released_total: u64,
}

struct Entry {
    generation: u32,
    value: Rc<dyn Any>,
}

/// Table of strong references to host values that a native loop may still
/// reach through a raw pointer.
///
/// Mutation is `reserve`, `register` and `release`. A caller that pins more
/// than one value in a single logical step reserves for all of them first,
/// so a failure to grow never leaves a value half-pinned.
pub struct RootRegistry {
    entries: Slab<Entry>,
    next_generation: u32,
    max_entries: Option<usize>,
    registered_total: u64,
    released_total: u64,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::with_config(&RootsConfig::default())
    }

    pub fn with_config(config: &RootsConfig) -> Self {
        let capacity = match config.max_entries {
            Some(limit) => config.initial_capacity.min(limit),
            None => config.initial_capacity,
        };
        Self {
            entries: Slab::with_capacity(capacity),
            next_generation: 1,
            max_entries: config.max_entries,
            registered_total: 0,
            released_total: 0,
        }
    }

    /// Applies a new sizing. Entries already pinned are kept even if they
    /// exceed the new cap; only future growth is refused.
    pub fn configure(&mut self, config: &RootsConfig) {
        self.max_entries = config.max_entries;
        if let Some(limit) = config.max_entries {
            if self.entries.len() > limit {
                log::warn!(
                    "Root registry holds {} entries, above the new limit of {}.",
                    self.entries.len(),
                    limit
                );
            }
        }
        let wanted = match config.max_entries {
            Some(limit) => config.initial_capacity.min(limit),
            None => config.initial_capacity,
        };
        let free = self.entries.capacity() - self.entries.len();
        if wanted > free {
            self.entries.reserve(wanted - free);
        }
    }

    /// Like [`configure`](Self::configure), but never raises a cap that is
    /// already in place. Used when several owners share one registry.
    pub fn tighten(&mut self, config: &RootsConfig) {
        let max_entries = match (self.max_entries, config.max_entries) {
            (Some(current), Some(wanted)) => Some(current.min(wanted)),
            (current, wanted) => current.or(wanted),
        };
        self.configure(&RootsConfig {
            initial_capacity: config.initial_capacity,
            max_entries,
        });
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Makes room for `additional` registrations.
    ///
    /// After `Ok`, the next `additional` calls to [`register`](Self::register)
    /// neither allocate nor fail.
    pub fn reserve(&mut self, additional: usize) -> Result<(), RootsError> {
        let wanted = self
            .entries
            .len()
            .checked_add(additional)
            .ok_or(RootsError::Exhausted { limit: usize::MAX })?;
        if let Some(limit) = self.max_entries {
            if wanted > limit {
                log::debug!(
                    "Refusing to enlarge root registry to {} entries (limit {}).",
                    wanted,
                    limit
                );
                return Err(RootsError::Exhausted { limit });
            }
        }
        self.entries.reserve(additional);
        Ok(())
    }

    /// Pins `value` and returns the slot that resolves it.
    pub fn register(&mut self, value: Rc<dyn Any>) -> Result<RootSlot, RootsError> {
        if let Some(limit) = self.max_entries {
            if self.entries.len() >= limit {
                return Err(RootsError::Exhausted { limit });
            }
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let index = self.entries.insert(Entry { generation, value });
        self.registered_total += 1;
        let slot = RootSlot { index, generation };
        log::trace!("Pinned root {}.", slot);
        Ok(slot)
    }

    /// Unpins the value behind `slot` and hands it back to the caller.
    ///
    /// The returned value is the last reference the registry held; callers
    /// going through the thread-local functions get it after the registry
    /// borrow has ended, so its destructor may use the registry again.
    pub fn release(&mut self, slot: RootSlot) -> Result<Rc<dyn Any>, RootsError> {
        if !self.is_live(slot) {
            log::warn!("Attempted to release stale root slot {}.", slot);
            return Err(RootsError::StaleSlot(slot));
        }
        let entry = self.entries.remove(slot.index);
        self.released_total += 1;
        log::trace!("Released root {}.", slot);
        Ok(entry.value)
    }

    pub fn get(&self, slot: RootSlot) -> Option<Rc<dyn Any>> {
        self.entries
            .get(slot.index)
            .filter(|entry| entry.generation == slot.generation)
            .map(|entry| Rc::clone(&entry.value))
    }

    pub fn get_as<T: Any>(&self, slot: RootSlot) -> Result<Rc<T>, RootsError> {
        let value = self.get(slot).ok_or(RootsError::StaleSlot(slot))?;
        value.downcast::<T>().map_err(|_| RootsError::TypeMismatch {
            slot,
            expected: type_name::<T>(),
        })
    }

    pub fn is_live(&self, slot: RootSlot) -> bool {
        self.entries
            .get(slot.index)
            .map_or(false, |entry| entry.generation == slot.generation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RootStats {
        RootStats {
            live: self.entries.len(),
            capacity: self.entries.capacity(),
            registered_total: self.registered_total,
            released_total: self.released_total,
        }
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// --- Thread-local registry ---
// Every loop on a thread shares that thread's registry. Values are `Rc`, so
// nothing registered here can be observed from another thread.

/// Runs `f` against the current thread's registry.
///
/// Panics if called re-entrantly from inside another `with_registry` closure.
pub fn with_registry<R>(f: impl FnOnce(&mut RootRegistry) -> R) -> R {
    GLOBAL_ROOTS.with(|roots| f(&mut roots.borrow_mut()))
}

pub fn configure(config: &RootsConfig) {
    with_registry(|roots| roots.configure(config));
}

pub fn tighten(config: &RootsConfig) {
    with_registry(|roots| roots.tighten(config));
}

pub fn reserve(additional: usize) -> Result<(), RootsError> {
    with_registry(|roots| roots.reserve(additional))
}

pub fn register(value: Rc<dyn Any>) -> Result<RootSlot, RootsError> {
    with_registry(|roots| roots.register(value))
}

/// Unpins `slot`. The value is returned outside the registry borrow.
pub fn release(slot: RootSlot) -> Result<Rc<dyn Any>, RootsError> {
    with_registry(|roots| roots.release(slot))
}

pub fn resolve(slot: RootSlot) -> Option<Rc<dyn Any>> {
    with_registry(|roots| roots.get(slot))
}

pub fn resolve_as<T: Any>(slot: RootSlot) -> Result<Rc<T>, RootsError> {
    with_registry(|roots| roots.get_as::<T>(slot))
}

pub fn stats() -> RootStats {
    with_registry(|roots| roots.stats())
}
