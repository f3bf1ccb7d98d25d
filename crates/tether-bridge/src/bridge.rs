//! The bridge context
//!
//! One [`Bridge`] owns every table shared across the boundary: the type
//! and assembly registries, the reference table, the marshaling adapters,
//! the trampoline caches, and the event relays. Nothing is process-global;
//! embedders create a bridge explicitly and drain it with
//! [`Bridge::shutdown`].

use crate::codegen::{CodeGen, NativeCleanupFn, NativeMethodFn, Trampoline};
use crate::events::{EventRelay, NativeEventFn};
use crate::marshal::{AdapterProvider, AdapterRegistry, RawSlot};
use crate::param::ParamDesc;
use crate::refs::{Handle, RefTable};
use crate::resolver::{trampoline_addr, Resolver};
use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use std::sync::Arc;
use tether_runtime::builtin::{self, FAULT_CLASS, SAFE_RETURN_CLASS, TYPE_CLASS};
use tether_runtime::object::{ClassDef, Instance};
use tether_runtime::registry::{AssemblyManifest, AssemblyRegistry, TypeRegistry};
use tether_runtime::Value;

/// Tunables fixed at bridge construction.
#[derive(Clone, Copy, Debug)]
pub struct BridgeOptions {
    /// Expose event argument handles weakly, so a native handler that
    /// forgets to release them cannot keep the argument objects alive.
    pub event_args_weak: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            event_args_weak: false,
        }
    }
}

/// Point-in-time table sizes, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeStats {
    /// Live reference-table entries
    pub object_refs: usize,
    /// Cached member trampolines
    pub trampolines: usize,
    /// Cached safe wrappers
    pub safe_trampolines: usize,
    /// Memoized marshaling plans
    pub plans: usize,
    /// Synthesized interface proxy classes
    pub proxy_classes: usize,
    /// Live event relays
    pub event_relays: usize,
    /// Published types
    pub types: usize,
}

type EventKey = (Handle, String, usize);

/// The embedding context.
pub struct Bridge {
    types: Arc<TypeRegistry>,
    assemblies: AssemblyRegistry,
    refs: Arc<RefTable>,
    adapters: Arc<AdapterRegistry>,
    codegen: CodeGen,
    resolver: Resolver,
    events: DashMap<EventKey, Arc<EventRelay>>,
    opts: BridgeOptions,
    type_class: Arc<ClassDef>,
    fault_class: Arc<ClassDef>,
    safe_return_class: Arc<ClassDef>,
}

impl Bridge {
    /// Create a bridge with the built-in `core` assembly loaded.
    pub fn new(opts: BridgeOptions) -> Self {
        let types = Arc::new(TypeRegistry::new());
        let assemblies = AssemblyRegistry::new(types.clone());
        assemblies.install(builtin::core_assembly());
        assemblies.load(builtin::CORE_ASSEMBLY);

        let refs = Arc::new(RefTable::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let codegen = CodeGen::new(refs.clone(), adapters.clone());

        let resolve_core = |name: &str| {
            types
                .resolve(name)
                .unwrap_or_else(|| unreachable!("core assembly always publishes {name}"))
        };
        let type_class = resolve_core(TYPE_CLASS);
        let fault_class = resolve_core(FAULT_CLASS);
        let safe_return_class = resolve_core(SAFE_RETURN_CLASS);

        Self {
            types,
            assemblies,
            refs,
            adapters,
            codegen,
            resolver: Resolver::new(),
            events: DashMap::new(),
            opts,
            type_class,
            fault_class,
            safe_return_class,
        }
    }

    /// The reference table.
    pub fn refs(&self) -> &Arc<RefTable> {
        &self.refs
    }

    // --- assemblies and types --------------------------------------------

    /// Make an assembly manifest loadable by name.
    pub fn install_assembly(&self, manifest: AssemblyManifest) {
        self.assemblies.install(manifest);
    }

    /// Load an assembly by name or path. Never faults; `false` means every
    /// probe failed.
    pub fn load_assembly(&self, spec: &str) -> bool {
        self.assemblies.load(spec)
    }

    /// Install (or replace) a custom marshaling adapter.
    pub fn register_adapter(&self, id: &str, provider: AdapterProvider) {
        self.adapters.register(id, provider);
    }

    fn resolve_type(&self, name: &str) -> BridgeResult<Arc<ClassDef>> {
        self.types
            .resolve(name)
            .ok_or_else(|| BridgeError::TypeNotFound(name.into()))
    }

    /// Handle on the type object of a published type.
    pub fn get_type_ref(&self, type_name: &str) -> BridgeResult<Handle> {
        let class = self.resolve_type(type_name)?;
        Ok(self.refs.acquire(Value::Type(class), false))
    }

    // --- member resolution -----------------------------------------------

    /// Resolve a static method; returns the trampoline's invocation id.
    pub fn resolve_static_method(
        &self,
        type_name: &str,
        method: &str,
        descs: &[ParamDesc],
    ) -> BridgeResult<usize> {
        let class = self.resolve_type(type_name)?;
        let tramp = self
            .resolver
            .resolve_static(&class, method, descs, &self.codegen)?;
        Ok(trampoline_addr(&tramp))
    }

    /// Resolve an instance method on the target of a handle.
    pub fn resolve_instance_method(
        &self,
        target: Handle,
        method: &str,
        descs: &[ParamDesc],
    ) -> BridgeResult<usize> {
        let target = self.refs.resolve(target)?;
        let tramp = self.resolver.resolve_instance(
            &target,
            method,
            descs,
            &self.codegen,
            &self.type_class,
        )?;
        Ok(trampoline_addr(&tramp))
    }

    /// Resolve a constructor. The constructed type is named by the return
    /// descriptor at index 0; a void return slot is invalid here, since the
    /// factory's whole output is the new instance.
    pub fn resolve_constructor(&self, descs: &[ParamDesc]) -> BridgeResult<usize> {
        let ret = descs.first().ok_or_else(|| {
            BridgeError::ArgumentInvalid("constructor needs a return descriptor".into())
        })?;
        if ret.is_void() {
            return Err(BridgeError::ArgumentInvalid(
                "constructor return descriptor is void".into(),
            ));
        }
        let class = self.resolve_type(&ret.base_type_name()?)?;
        let tramp = self.resolver.resolve_ctor(&class, descs, &self.codegen)?;
        Ok(trampoline_addr(&tramp))
    }

    fn wrap_safe(&self, inner: Arc<Trampoline>, descs: &[ParamDesc]) -> BridgeResult<usize> {
        let safe = self.resolver.resolve_safe(
            &inner,
            descs,
            &self.codegen,
            self.safe_return_class.clone(),
            self.fault_class.clone(),
        )?;
        Ok(trampoline_addr(&safe))
    }

    /// Resolve the fault-capturing variant of a static method. The call
    /// never faults across the boundary; its return slot is a strong handle
    /// on a `core.SafeReturn` object.
    pub fn resolve_static_method_safe(
        &self,
        type_name: &str,
        method: &str,
        descs: &[ParamDesc],
    ) -> BridgeResult<usize> {
        let class = self.resolve_type(type_name)?;
        let inner = self
            .resolver
            .resolve_static(&class, method, descs, &self.codegen)?;
        self.wrap_safe(inner, descs)
    }

    /// Resolve the fault-capturing variant of an instance method.
    pub fn resolve_instance_method_safe(
        &self,
        target: Handle,
        method: &str,
        descs: &[ParamDesc],
    ) -> BridgeResult<usize> {
        let target = self.refs.resolve(target)?;
        let inner = self.resolver.resolve_instance(
            &target,
            method,
            descs,
            &self.codegen,
            &self.type_class,
        )?;
        self.wrap_safe(inner, descs)
    }

    /// Wrap an already resolved member in its fault-capturing variant.
    ///
    /// `addr` is the invocation id a previous resolution returned; `descs`
    /// is that member's descriptor list.
    pub fn resolve_safe_method(&self, addr: usize, descs: &[ParamDesc]) -> BridgeResult<usize> {
        let inner = self
            .resolver
            .by_addr(addr)
            .ok_or(BridgeError::InvalidReference)?;
        self.wrap_safe(inner, descs)
    }

    /// Drive a resolved trampoline from native argument slots.
    pub fn invoke(&self, addr: usize, args: &[RawSlot], ret: &mut RawSlot) -> BridgeResult<()> {
        let tramp = self
            .resolver
            .by_addr(addr)
            .ok_or(BridgeError::InvalidReference)?;
        tramp.invoke_raw(args, ret)
    }

    // --- object references -----------------------------------------------

    /// New handle aliasing the target of an existing one. Always a fresh
    /// handle, even for a target already exposed.
    pub fn add_object_ref(&self, handle: Handle, weak: bool) -> BridgeResult<Handle> {
        self.refs.add_alias(handle, weak)
    }

    /// Release a handle.
    ///
    /// Event subscriptions made through the handle are always removed.
    /// When no other handle aliases the same target, the target's cached
    /// trampolines are evicted too.
    pub fn free_object_ref(&self, handle: Handle) -> BridgeResult<()> {
        self.remove_relays(|key| key.0 == handle);
        let target = self.refs.remove(handle)?;
        if let Some(target) = target {
            if !self.refs.aliases_target(&target) {
                self.resolver.evict_target(&target);
            }
        }
        Ok(())
    }

    /// Release a handle on an interface proxy. Cleanup callbacks of its
    /// connected methods run when the proxy instance itself is dropped.
    pub fn free_delegate_ref(&self, handle: Handle) -> BridgeResult<()> {
        self.free_object_ref(handle)
    }

    /// Release every handle on a type object and evict its static
    /// trampolines.
    pub fn free_type_ref(&self, type_name: &str) -> BridgeResult<()> {
        let class = self.resolve_type(type_name)?;
        let target = Value::Type(class);
        for handle in self.refs.handles_of(&target) {
            self.remove_relays(|key| key.0 == handle);
            let _ = self.refs.remove(handle);
        }
        self.resolver.evict_target(&target);
        Ok(())
    }

    /// Walk a dot path of member names from the target of a handle and
    /// return a strong handle on the final value.
    ///
    /// Each segment reads the property `get_{segment}` if the class
    /// declares one, else the declared field of that name. On a type-object
    /// target the first segment resolves statically. An empty path aliases
    /// the target itself.
    pub fn get_object(&self, handle: Handle, path: &str) -> BridgeResult<Handle> {
        let mut current = self.refs.resolve(handle)?;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = self.read_member(&current, segment)?;
        }
        Ok(self.refs.acquire(current, false))
    }

    fn read_member(&self, value: &Value, name: &str) -> BridgeResult<Value> {
        let getter = format!("get_{name}");
        match value {
            Value::Type(class) => {
                let method = class.find_method(&getter, &[], true).ok_or_else(|| {
                    BridgeError::MemberNotFound(format!("{}.{name}", class.name))
                })?;
                Ok(method.invoke(None, &mut [])?)
            }
            Value::Object(inst) => {
                if let Some(method) = inst.class().find_method(&getter, &[], false) {
                    return Ok(method.invoke(Some(value), &mut [])?);
                }
                inst.get_field(name).ok_or_else(|| {
                    BridgeError::MemberNotFound(format!("{}.{name}", inst.class().name))
                })
            }
            other => Err(BridgeError::ArgumentInvalid(format!(
                "'{name}' read on a value of type {}",
                other.type_name()
            ))),
        }
    }

    // --- events ------------------------------------------------------------

    fn instance_of(&self, handle: Handle) -> BridgeResult<Arc<Instance>> {
        let target = self.refs.resolve(handle)?;
        target
            .as_object()
            .cloned()
            .ok_or_else(|| BridgeError::ArgumentInvalid("handle target is not an object".into()))
    }

    /// Subscribe a native callback to a managed event. Subscribing again
    /// with the same handle, event and context swaps the callback in place
    /// without re-subscribing.
    pub fn add_event_handler(
        &self,
        handle: Handle,
        event: &str,
        context: usize,
        callback: NativeEventFn,
    ) -> BridgeResult<()> {
        let key = (handle, event.to_string(), context);
        if let Some(existing) = self.events.get(&key) {
            existing.replace_handler(context, callback);
            return Ok(());
        }
        let instance = self.instance_of(handle)?;
        let relay = EventRelay::subscribe(
            &instance,
            event,
            context,
            callback,
            self.refs.clone(),
            self.opts.event_args_weak,
        )?;
        // A racing subscriber with the same key wins or loses atomically;
        // the losing relay unsubscribes itself.
        let winner = self.events.entry(key).or_insert(relay.clone()).clone();
        if !Arc::ptr_eq(&winner, &relay) {
            relay.unsubscribe();
            winner.replace_handler(context, callback);
        }
        Ok(())
    }

    /// Remove one subscription. Removing a key that was never subscribed
    /// is a no-op; only an invalid handle is an error.
    pub fn remove_event_handler(
        &self,
        handle: Handle,
        event: &str,
        context: usize,
    ) -> BridgeResult<()> {
        self.refs.resolve(handle)?;
        let key = (handle, event.to_string(), context);
        if let Some((_, relay)) = self.events.remove(&key) {
            relay.unsubscribe();
        }
        Ok(())
    }

    /// Remove every subscription made through a handle.
    pub fn remove_all_event_handlers(&self, handle: Handle) {
        self.remove_relays(|key| key.0 == handle);
    }

    fn remove_relays(&self, mut matches: impl FnMut(&EventKey) -> bool) {
        let keys: Vec<EventKey> = self
            .events
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, relay)) = self.events.remove(&key) {
                relay.unsubscribe();
            }
        }
    }

    // --- interface proxies -------------------------------------------------

    /// Instantiate a proxy implementing a published interface and return a
    /// strong handle on it. Methods start unconnected and fault until
    /// [`Bridge::set_interface_method`] connects them.
    pub fn add_interface_proxy(&self, interface: &str) -> BridgeResult<Handle> {
        let iface = self.resolve_type(interface)?;
        let proxy_class = self.codegen.proxy_class_for(&iface)?;
        let ctor = proxy_class
            .find_ctor(&[])
            .ok_or_else(|| BridgeError::MemberNotFound(format!("{}..ctor", proxy_class.name)))?;
        let obj = ctor.construct(&proxy_class, &mut [])?;
        Ok(self.refs.acquire(obj, false))
    }

    /// Connect a proxied method to its native implementation.
    ///
    /// `descs` is the callback's full native signature: return slot, then
    /// the context and invocation-count parameters the dispatcher itself
    /// supplies, then the managed parameters.
    pub fn set_interface_method(
        &self,
        proxy: Handle,
        method: &str,
        descs: &[ParamDesc],
        context: usize,
        callback: NativeMethodFn,
        cleanup: Option<NativeCleanupFn>,
    ) -> BridgeResult<()> {
        let instance = self.instance_of(proxy)?;
        self.codegen
            .connect_proxy_method(&instance, method, descs, context, callback, cleanup)
    }

    // --- lifecycle ---------------------------------------------------------

    /// Current table sizes.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            object_refs: self.refs.len(),
            trampolines: self.resolver.len(),
            safe_trampolines: self.resolver.safe_len(),
            plans: self.codegen.plan_count(),
            proxy_classes: self.codegen.proxy_class_count(),
            event_relays: self.events.len(),
            types: self.types.len(),
        }
    }

    /// Drain every table: unsubscribe relays, drop trampolines, invalidate
    /// all handles. The bridge stays usable afterwards, empty.
    pub fn shutdown(&self) {
        self.remove_relays(|_| true);
        self.resolver.clear();
        self.refs.clear();
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeOptions::default())
    }
}
