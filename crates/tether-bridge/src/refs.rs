//! Reference table: opaque handles aliasing managed values
//!
//! Every value exposed to native code is reachable only through a handle.
//! A handle is an opaque nonzero id, never a pointer into managed memory.
//! Multiple handles may alias the same target independently; each has its
//! own release lifecycle. Weak handles do not keep an instance alive: the
//! arena of `Arc`-backed instances decides destruction readiness, and a
//! weak slot merely observes it.

use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tether_runtime::object::Instance;
use tether_runtime::Value;

/// Opaque handle standing for a reference-table entry.
pub type Handle = u64;

/// The null handle; never allocated, resolves to nothing.
pub const NULL_HANDLE: Handle = 0;

enum Slot {
    Strong(Value),
    Weak(Weak<Instance>),
}

/// Table of handle → managed target entries with strong/weak aliasing.
pub struct RefTable {
    slots: DashMap<Handle, Slot>,
    next: AtomicU64,
}

impl RefTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Expose a target, always creating a new handle (never deduplicated).
    ///
    /// A weak handle is only possible for object values, whose liveness the
    /// instance arena tracks; a weak request for any other value is stored
    /// strong.
    pub fn acquire(&self, target: Value, weak: bool) -> Handle {
        let slot = match (&target, weak) {
            (Value::Object(inst), true) => Slot::Weak(std::sync::Arc::downgrade(inst)),
            _ => Slot::Strong(target),
        };
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(handle, slot);
        handle
    }

    /// Resolve a handle to its target.
    ///
    /// Fails with [`BridgeError::InvalidReference`] for unknown handles and
    /// [`BridgeError::Disposed`] when a weak slot's target is gone.
    pub fn resolve(&self, handle: Handle) -> BridgeResult<Value> {
        let entry = self
            .slots
            .get(&handle)
            .ok_or(BridgeError::InvalidReference)?;
        match &*entry {
            Slot::Strong(value) => Ok(value.clone()),
            Slot::Weak(weak) => weak
                .upgrade()
                .map(Value::Object)
                .ok_or(BridgeError::Disposed),
        }
    }

    /// Create a new handle to the target of an existing one.
    pub fn add_alias(&self, handle: Handle, weak: bool) -> BridgeResult<Handle> {
        let target = self.resolve(handle)?;
        Ok(self.acquire(target, weak))
    }

    /// Remove an entry, returning its target if it was still alive.
    ///
    /// Cascading cleanup (event subscriptions, trampoline eviction) is the
    /// bridge's responsibility.
    pub fn remove(&self, handle: Handle) -> BridgeResult<Option<Value>> {
        let (_, slot) = self
            .slots
            .remove(&handle)
            .ok_or(BridgeError::InvalidReference)?;
        Ok(match slot {
            Slot::Strong(value) => Some(value),
            Slot::Weak(weak) => weak.upgrade().map(Value::Object),
        })
    }

    /// Whether any live entry aliases the given target.
    pub fn aliases_target(&self, target: &Value) -> bool {
        self.slots.iter().any(|entry| match entry.value() {
            Slot::Strong(value) => value.identity_eq(target),
            Slot::Weak(weak) => weak
                .upgrade()
                .map(|inst| Value::Object(inst).identity_eq(target))
                .unwrap_or(false),
        })
    }

    /// Handles of every live entry aliasing the given target.
    pub fn handles_of(&self, target: &Value) -> Vec<Handle> {
        self.slots
            .iter()
            .filter(|entry| match entry.value() {
                Slot::Strong(value) => value.identity_eq(target),
                Slot::Weak(weak) => weak
                    .upgrade()
                    .map(|inst| Value::Object(inst).identity_eq(target))
                    .unwrap_or(false),
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Invalidate every handle (shutdown drain).
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for RefTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_runtime::object::ClassBuilder;

    fn object() -> Value {
        Value::Object(Instance::new(ClassBuilder::new("t.A").build()))
    }

    #[test]
    fn test_acquire_resolve_roundtrip() {
        let table = RefTable::new();
        let target = object();
        let resolved = table
            .resolve(table.acquire(target.clone(), false))
            .expect("resolve");
        assert!(resolved.identity_eq(&target));
    }

    #[test]
    fn test_acquire_never_deduplicates() {
        let table = RefTable::new();
        let target = object();
        let a = table.acquire(target.clone(), false);
        let b = table.acquire(target, false);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_then_resolve_is_invalid() {
        let table = RefTable::new();
        let handle = table.acquire(object(), false);
        table.remove(handle).expect("remove");
        assert!(matches!(
            table.resolve(handle),
            Err(BridgeError::InvalidReference)
        ));
    }

    #[test]
    fn test_alias_survives_source_release() {
        let table = RefTable::new();
        let target = object();
        let a = table.acquire(target.clone(), false);
        let b = table.add_alias(a, false).expect("alias");
        table.remove(a).expect("remove");
        let resolved = table.resolve(b).expect("alias resolves");
        assert!(resolved.identity_eq(&target));
    }

    #[test]
    fn test_weak_handle_dies_with_target() {
        let table = RefTable::new();
        let inst = Instance::new(ClassBuilder::new("t.A").build());
        let handle = table.acquire(Value::Object(inst.clone()), true);
        assert!(table.resolve(handle).is_ok());
        drop(inst);
        assert!(matches!(table.resolve(handle), Err(BridgeError::Disposed)));
    }

    #[test]
    fn test_weak_on_inline_value_stays_strong() {
        let table = RefTable::new();
        let handle = table.acquire(Value::str("keep"), true);
        assert!(table.resolve(handle).is_ok());
    }

    #[test]
    fn test_aliases_target_by_identity() {
        let table = RefTable::new();
        let target = object();
        let other = object();
        let _h = table.acquire(target.clone(), false);
        assert!(table.aliases_target(&target));
        assert!(!table.aliases_target(&other));
    }
}
