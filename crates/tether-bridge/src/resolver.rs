//! Member resolution and trampoline caches
//!
//! Trampolines are cached by `(target identity, member identity)` — the
//! descriptor list is deliberately not part of the key, so the first
//! resolution of a member on a target fixes the marshaling the native side
//! gets for it. Safe wrappers are cached per inner trampoline.
//!
//! Every published trampoline is also indexed by its address, which is the
//! opaque id the native side invokes through.

use crate::codegen::{CodeGen, Trampoline};
use crate::param::ParamDesc;
use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use std::sync::Arc;
use tether_runtime::object::{ClassDef, CtorDef, MethodDef};
use tether_runtime::Value;

type TargetKey = usize;
type MemberKey = usize;

/// Trampoline caches and the address index.
pub struct Resolver {
    trampolines: DashMap<(TargetKey, MemberKey), Arc<Trampoline>>,
    safe: DashMap<usize, Arc<Trampoline>>,
    by_addr: DashMap<usize, Arc<Trampoline>>,
}

/// Opaque invocation id of a trampoline.
pub fn trampoline_addr(tramp: &Arc<Trampoline>) -> usize {
    Arc::as_ptr(tramp) as usize
}

fn target_key_of(value: &Value) -> BridgeResult<TargetKey> {
    match value {
        Value::Object(inst) => Ok(Arc::as_ptr(inst) as usize),
        Value::Type(class) => Ok(Arc::as_ptr(class) as usize),
        other => Err(BridgeError::ArgumentInvalid(format!(
            "member resolution requires an object or type target, got {}",
            other.type_name()
        ))),
    }
}

impl Resolver {
    /// Empty caches.
    pub fn new() -> Self {
        Self {
            trampolines: DashMap::new(),
            safe: DashMap::new(),
            by_addr: DashMap::new(),
        }
    }

    fn publish(
        &self,
        key: (TargetKey, MemberKey),
        tramp: Arc<Trampoline>,
    ) -> Arc<Trampoline> {
        // Competing resolutions race benignly: the first publication wins
        // and the losing build is discarded.
        let winner = self.trampolines.entry(key).or_insert(tramp).clone();
        self.by_addr
            .insert(trampoline_addr(&winner), winner.clone());
        winner
    }

    /// Resolve a static method on a class.
    pub fn resolve_static(
        &self,
        class: &Arc<ClassDef>,
        name: &str,
        descs: &[ParamDesc],
        gen: &CodeGen,
    ) -> BridgeResult<Arc<Trampoline>> {
        let plan = gen.plan_for(descs)?;
        let method = class
            .find_method(name, &plan.managed_param_types(), true)
            .ok_or_else(|| BridgeError::MemberNotFound(format!("{}.{name}", class.name)))?;
        let key = (
            Arc::as_ptr(class) as usize,
            method as *const MethodDef as usize,
        );
        if let Some(cached) = self.trampolines.get(&key) {
            return Ok(cached.clone());
        }
        let tramp = gen.method_trampoline(class.clone(), None, name, plan);
        Ok(self.publish(key, tramp))
    }

    /// Resolve an instance method on a target value.
    ///
    /// Object targets dispatch against their class; type-object targets
    /// dispatch against `type_class` (the managed face of class
    /// definitions).
    pub fn resolve_instance(
        &self,
        target: &Value,
        name: &str,
        descs: &[ParamDesc],
        gen: &CodeGen,
        type_class: &Arc<ClassDef>,
    ) -> BridgeResult<Arc<Trampoline>> {
        let class = match target {
            Value::Object(inst) => inst.class().clone(),
            Value::Type(_) => type_class.clone(),
            _ => {
                return Err(BridgeError::ArgumentInvalid(format!(
                    "member resolution requires an object or type target, got {}",
                    target.type_name()
                )))
            }
        };
        let plan = gen.plan_for(descs)?;
        let method = class
            .find_method(name, &plan.managed_param_types(), false)
            .ok_or_else(|| BridgeError::MemberNotFound(format!("{}.{name}", class.name)))?;
        let key = (target_key_of(target)?, method as *const MethodDef as usize);
        if let Some(cached) = self.trampolines.get(&key) {
            return Ok(cached.clone());
        }
        let tramp = gen.method_trampoline(class, Some(target.clone()), name, plan);
        Ok(self.publish(key, tramp))
    }

    /// Resolve a constructor on a class.
    pub fn resolve_ctor(
        &self,
        class: &Arc<ClassDef>,
        descs: &[ParamDesc],
        gen: &CodeGen,
    ) -> BridgeResult<Arc<Trampoline>> {
        let plan = gen.plan_for(descs)?;
        let ctor = class
            .find_ctor(&plan.managed_param_types())
            .ok_or_else(|| BridgeError::MemberNotFound(format!("{}..ctor", class.name)))?;
        let key = (
            Arc::as_ptr(class) as usize,
            ctor as *const CtorDef as usize,
        );
        if let Some(cached) = self.trampolines.get(&key) {
            return Ok(cached.clone());
        }
        let tramp = gen.ctor_trampoline(class.clone(), plan);
        Ok(self.publish(key, tramp))
    }

    /// Resolve the fault-capturing wrapper of an already resolved
    /// trampoline, cached per inner trampoline.
    pub fn resolve_safe(
        &self,
        inner: &Arc<Trampoline>,
        descs: &[ParamDesc],
        gen: &CodeGen,
        safe_return: Arc<ClassDef>,
        fault: Arc<ClassDef>,
    ) -> BridgeResult<Arc<Trampoline>> {
        let inner_addr = trampoline_addr(inner);
        if let Some(cached) = self.safe.get(&inner_addr) {
            return Ok(cached.clone());
        }
        let built = gen.safe_trampoline(inner, descs, safe_return, fault)?;
        let winner = self.safe.entry(inner_addr).or_insert(built).clone();
        self.by_addr
            .insert(trampoline_addr(&winner), winner.clone());
        Ok(winner)
    }

    /// Look up a trampoline by its invocation id.
    pub fn by_addr(&self, addr: usize) -> Option<Arc<Trampoline>> {
        self.by_addr.get(&addr).map(|entry| entry.clone())
    }

    /// Drop every trampoline bound to a target, along with safe wrappers
    /// and address-index entries. Used when the last handle on a target is
    /// released, and when a type reference is freed (static trampolines).
    pub fn evict_target(&self, target: &Value) {
        let Ok(target_key) = target_key_of(target) else {
            return;
        };
        let keys: Vec<(TargetKey, MemberKey)> = self
            .trampolines
            .iter()
            .filter(|entry| entry.key().0 == target_key)
            .map(|entry| *entry.key())
            .collect();
        for key in keys {
            if let Some((_, tramp)) = self.trampolines.remove(&key) {
                let addr = trampoline_addr(&tramp);
                self.by_addr.remove(&addr);
                if let Some((_, safe)) = self.safe.remove(&addr) {
                    self.by_addr.remove(&trampoline_addr(&safe));
                }
            }
        }
    }

    /// Number of cached member trampolines.
    pub fn len(&self) -> usize {
        self.trampolines.len()
    }

    /// Whether no trampolines are cached.
    pub fn is_empty(&self) -> bool {
        self.trampolines.is_empty()
    }

    /// Number of cached safe wrappers.
    pub fn safe_len(&self) -> usize {
        self.safe.len()
    }

    /// Drop every cache (shutdown drain).
    pub fn clear(&self) {
        self.trampolines.clear();
        self.safe.clear();
        self.by_addr.clear();
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
