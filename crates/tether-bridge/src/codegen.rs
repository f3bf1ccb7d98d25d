//! Trampoline, safe-wrapper, and interface-proxy builders
//!
//! A trampoline binds one resolved member to one marshaling plan. Its
//! native-facing shape is always the same: argument slots in, return slot
//! out, status code back. Plans are compiled once per structural descriptor
//! list and shared across trampolines.

use crate::marshal::{AdapterRegistry, MarshalEnv, MarshalPlan, RawSlot};
use crate::param::ParamDesc;
use crate::refs::RefTable;
use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_runtime::builtin::{self, SAFE_RETURN_CLASS};
use tether_runtime::object::{ClassBuilder, ClassDef, ClassKind, CtorDef, Instance, MethodDef};
use tether_runtime::{CallResult, Fault, Value};

/// Native implementation of one proxied interface method.
///
/// Receives the configuration context, the per-method invocation count,
/// the marshaled argument slots, and a return slot to fill. A zero status
/// reports success; any other value faults the managed call.
pub type NativeMethodFn = extern "C" fn(
    context: *mut c_void,
    count: u64,
    args: *const RawSlot,
    argc: usize,
    ret: *mut RawSlot,
) -> i32;

/// Invoked when a proxied method's configuration is released, with the
/// context and the final invocation count.
pub type NativeCleanupFn = extern "C" fn(context: *mut c_void, count: u64);

/// Bound member call: unmarshal, invoke, write back, marshal return.
pub struct Trampoline {
    plan: Arc<MarshalPlan>,
    call: Arc<dyn Fn(&mut [Value]) -> CallResult + Send + Sync>,
}

impl Trampoline {
    /// The trampoline's marshaling plan.
    pub fn plan(&self) -> &Arc<MarshalPlan> {
        &self.plan
    }

    /// Invoke with managed arguments, bypassing marshaling.
    pub fn invoke(&self, args: &mut [Value]) -> CallResult {
        (self.call)(args)
    }

    /// Drive a native invocation end to end.
    ///
    /// `ret` must point at writable storage unless the plan's return slot
    /// is void.
    pub fn invoke_raw(&self, args: &[RawSlot], ret: &mut RawSlot) -> BridgeResult<()> {
        let mut values = self.plan.unmarshal_args(args)?;
        let result = (self.call)(&mut values)?;
        self.plan.write_outputs(&values, args)?;
        *ret = self.plan.marshal_return(&result)?;
        Ok(())
    }
}

// --- interface proxies ----------------------------------------------------

struct ProxyCfg {
    context: usize,
    callback: NativeMethodFn,
    cleanup: Option<NativeCleanupFn>,
    plan: Arc<MarshalPlan>,
}

struct ProxySlot {
    cfg: Mutex<Option<ProxyCfg>>,
    count: AtomicU64,
}

/// Per-instance state of an interface proxy: one slot per interface
/// method, configured one at a time from the native side.
pub struct ProxyState {
    slots: FxHashMap<String, ProxySlot>,
}

impl ProxyState {
    fn for_interface(iface: &ClassDef) -> Self {
        let slots = iface
            .methods()
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    ProxySlot {
                        cfg: Mutex::new(None),
                        count: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    fn dispatch(&self, method: &str, args: &mut [Value]) -> CallResult {
        let slot = self
            .slots
            .get(method)
            .ok_or_else(|| Fault::member_not_found(method))?;
        let count = slot.count.fetch_add(1, Ordering::Relaxed) + 1;
        let cfg = slot.cfg.lock();
        let cfg = cfg
            .as_ref()
            .ok_or_else(|| Fault::new(format!("proxy method '{method}' is not connected")))?;
        let outbound = cfg.plan.marshal_args(args).map_err(BridgeError::into_fault)?;
        let mut ret = RawSlot::ZERO;
        let status = (cfg.callback)(
            cfg.context as *mut c_void,
            count,
            outbound.slots().as_ptr(),
            outbound.slots().len(),
            &mut ret,
        );
        drop(outbound);
        if status != 0 {
            return Err(Fault::new(format!(
                "native implementation of '{method}' failed with status {status}"
            )));
        }
        cfg.plan.unmarshal_return(ret).map_err(BridgeError::into_fault)
    }
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            if let Some(cfg) = slot.cfg.lock().take() {
                if let Some(cleanup) = cfg.cleanup {
                    cleanup(cfg.context as *mut c_void, slot.count.load(Ordering::Relaxed));
                }
            }
        }
    }
}

// --- builders -------------------------------------------------------------

/// Factory for trampolines and proxy classes, with plan memoization.
pub struct CodeGen {
    refs: Arc<RefTable>,
    adapters: Arc<AdapterRegistry>,
    plans: DashMap<Vec<ParamDesc>, Arc<MarshalPlan>>,
    proxy_classes: DashMap<String, Arc<ClassDef>>,
}

impl CodeGen {
    /// Builder over the given reference table and adapter registry.
    pub fn new(refs: Arc<RefTable>, adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            refs,
            adapters,
            plans: DashMap::new(),
            proxy_classes: DashMap::new(),
        }
    }

    fn env(&self) -> MarshalEnv {
        MarshalEnv {
            refs: self.refs.clone(),
            adapters: self.adapters.clone(),
        }
    }

    /// Compile (or fetch) the plan for a structural descriptor list.
    pub fn plan_for(&self, descs: &[ParamDesc]) -> BridgeResult<Arc<MarshalPlan>> {
        if let Some(plan) = self.plans.get(descs) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(MarshalPlan::build(descs, &self.env())?);
        // Competing builders race benignly; first insert wins.
        Ok(self
            .plans
            .entry(descs.to_vec())
            .or_insert(plan)
            .clone())
    }

    /// Trampoline for a method bound to a receiver (`None` for statics).
    ///
    /// The member is re-found by exact signature on every call; the class
    /// manifest is immutable, so the lookup is a linear scan over a fixed
    /// member list.
    pub fn method_trampoline(
        &self,
        class: Arc<ClassDef>,
        receiver: Option<Value>,
        name: &str,
        plan: Arc<MarshalPlan>,
    ) -> Arc<Trampoline> {
        let name = name.to_string();
        let params = plan.managed_param_types();
        let is_static = receiver.is_none();
        Arc::new(Trampoline {
            plan,
            call: Arc::new(move |args| {
                let method = class
                    .find_method(&name, &params, is_static)
                    .ok_or_else(|| Fault::member_not_found(&name))?;
                method.invoke(receiver.as_ref(), args)
            }),
        })
    }

    /// Trampoline for a constructor.
    pub fn ctor_trampoline(&self, class: Arc<ClassDef>, plan: Arc<MarshalPlan>) -> Arc<Trampoline> {
        let params = plan.managed_param_types();
        Arc::new(Trampoline {
            plan,
            call: Arc::new(move |args| {
                let ctor = class
                    .find_ctor(&params)
                    .ok_or_else(|| Fault::member_not_found(&format!("{}..ctor", class.name)))?;
                ctor.construct(&class, args)
            }),
        })
    }

    /// Fault-capturing variant of an existing trampoline.
    ///
    /// The managed call runs inside the wrapper; its outcome (value or
    /// fault) is packaged into a `core.SafeReturn` instance, and the
    /// native side receives a strong handle to it. `safe_return` is the
    /// `core.SafeReturn` class and `fault` the `core.Fault` class.
    pub fn safe_trampoline(
        &self,
        inner: &Arc<Trampoline>,
        descs: &[ParamDesc],
        safe_return: Arc<ClassDef>,
        fault: Arc<ClassDef>,
    ) -> BridgeResult<Arc<Trampoline>> {
        // Parameter slots marshal exactly as the unsafe variant's do; only
        // the return slot changes, to a strong handle on the wrapper object.
        let mut safe_descs = vec![ParamDesc::named(SAFE_RETURN_CLASS)];
        safe_descs.extend_from_slice(descs.get(1..).unwrap_or(&[]));
        let plan = self.plan_for(&safe_descs)?;
        let call = inner.call.clone();
        Ok(Arc::new(Trampoline {
            plan,
            call: Arc::new(move |args| {
                Ok(match call(args) {
                    Ok(value) => builtin::new_safe_return(&safe_return, value, Value::Null),
                    Err(f) => builtin::new_safe_return(
                        &safe_return,
                        Value::Null,
                        builtin::new_fault_object(&fault, &f),
                    ),
                })
            }),
        }))
    }

    /// Synthesize (or fetch) the proxy class implementing an interface.
    ///
    /// The class is named `proxy.{interface}`, has a zero-arg constructor
    /// installing fresh [`ProxyState`], and one method per interface
    /// signature dispatching into the configured native callback.
    pub fn proxy_class_for(&self, iface: &Arc<ClassDef>) -> BridgeResult<Arc<ClassDef>> {
        if iface.kind != ClassKind::Interface {
            return Err(BridgeError::ArgumentInvalid(format!(
                "'{}' is not an interface",
                iface.name
            )));
        }
        let proxy_name = format!("proxy.{}", iface.name);
        if let Some(class) = self.proxy_classes.get(&proxy_name) {
            return Ok(class.clone());
        }

        let mut builder = ClassBuilder::new(&proxy_name);
        let iface_for_ctor = iface.clone();
        builder = builder.ctor(CtorDef::new(&[], move |class, _| {
            let inst = Instance::new(class.clone());
            inst.set_native(Box::new(ProxyState::for_interface(&iface_for_ctor)));
            Ok(Value::Object(inst))
        }));
        for method in iface.methods() {
            let method_name = method.name.clone();
            let params: Vec<&str> = method.params.iter().map(String::as_str).collect();
            builder = builder.method(MethodDef::instance(
                &method.name,
                &params,
                &method.returns,
                move |this, args| {
                    let inst = this
                        .and_then(Value::as_object)
                        .ok_or_else(|| Fault::bad_argument("receiver is not a proxy object"))?;
                    let state = inst
                        .native_ref::<ProxyState>()
                        .ok_or_else(|| Fault::new("proxy state missing"))?;
                    state.dispatch(&method_name, args)
                },
            ));
        }
        let class = builder.build();

        // Another thread may have synthesized it concurrently; whoever
        // published first wins and the duplicate is discarded.
        Ok(self
            .proxy_classes
            .entry(proxy_name)
            .or_insert(class)
            .clone())
    }

    /// Connect one proxied method to its native implementation.
    ///
    /// `descs` describes the callback's full native signature: return slot,
    /// context, invocation count, then the managed parameters. Reconnecting
    /// an already connected method releases the previous configuration
    /// (its cleanup runs with the current count).
    pub fn connect_proxy_method(
        &self,
        instance: &Arc<Instance>,
        method: &str,
        descs: &[ParamDesc],
        context: usize,
        callback: NativeMethodFn,
        cleanup: Option<NativeCleanupFn>,
    ) -> BridgeResult<()> {
        if descs.len() < 3 {
            return Err(BridgeError::ArgumentInvalid(
                "callback descriptors must cover return, context and count".into(),
            ));
        }
        let state = instance
            .native_ref::<ProxyState>()
            .ok_or_else(|| BridgeError::ArgumentInvalid("object is not a proxy".into()))?;
        let slot = state
            .slots
            .get(method)
            .ok_or_else(|| BridgeError::MemberNotFound(method.into()))?;

        // Context and count are supplied by the dispatcher itself; the
        // marshaling plan covers the return slot and the managed params.
        let mut plan_descs = vec![descs[0].clone()];
        plan_descs.extend_from_slice(&descs[3..]);
        let plan = self.plan_for(&plan_descs)?;

        let previous = slot.cfg.lock().replace(ProxyCfg {
            context,
            callback,
            cleanup,
            plan,
        });
        if let Some(old) = previous {
            if let Some(cleanup) = old.cleanup {
                cleanup(old.context as *mut c_void, slot.count.load(Ordering::Relaxed));
            }
        }
        Ok(())
    }

    /// Number of memoized marshaling plans.
    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    /// Number of synthesized proxy classes.
    pub fn proxy_class_count(&self) -> usize {
        self.proxy_classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamKind;
    use tether_runtime::builtin::core_assembly;

    fn codegen() -> CodeGen {
        CodeGen::new(Arc::new(RefTable::new()), Arc::new(AdapterRegistry::new()))
    }

    fn adder_class() -> Arc<ClassDef> {
        ClassBuilder::new("t.Adder")
            .ctor(CtorDef::new(&[], |class, _| {
                Ok(Value::Object(Instance::new(class.clone())))
            }))
            .method(MethodDef::static_fn(
                "Add",
                &["i32", "i32"],
                "i32",
                |_, args| match (&args[0], &args[1]) {
                    (Value::I32(a), Value::I32(b)) => Ok(Value::I32(a + b)),
                    _ => Err(Fault::bad_argument("expected two i32")),
                },
            ))
            .build()
    }

    fn add_descs() -> Vec<ParamDesc> {
        vec![
            ParamDesc::of_kind(ParamKind::I32),
            ParamDesc::of_kind(ParamKind::I32).input(),
            ParamDesc::of_kind(ParamKind::I32).input(),
        ]
    }

    #[test]
    fn test_static_trampoline_raw_call() {
        let gen = codegen();
        let plan = gen.plan_for(&add_descs()).expect("plan");
        let tramp = gen.method_trampoline(adder_class(), None, "Add", plan);
        let mut ret = RawSlot::ZERO;
        tramp
            .invoke_raw(&[RawSlot(2), RawSlot(40)], &mut ret)
            .expect("call");
        assert_eq!(ret.0 as u32 as i32, 42);
    }

    #[test]
    fn test_plan_memoization() {
        let gen = codegen();
        let a = gen.plan_for(&add_descs()).expect("plan");
        let b = gen.plan_for(&add_descs()).expect("plan");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gen.plan_count(), 1);
    }

    #[test]
    fn test_safe_trampoline_captures_fault() {
        let gen = codegen();
        let failing = ClassBuilder::new("t.Bomb")
            .method(MethodDef::static_fn("Go", &[], "void", |_, _| {
                Err(Fault::new("kaboom"))
            }))
            .build();
        let plan = gen.plan_for(&[ParamDesc::void()]).expect("plan");
        let inner = gen.method_trampoline(failing, None, "Go", plan);

        let core = core_assembly();
        let find = |name: &str| {
            core.classes
                .iter()
                .find(|c| c.name == name)
                .cloned()
                .expect("core class")
        };
        let safe_return = find(SAFE_RETURN_CLASS);
        let fault = find(builtin::FAULT_CLASS);
        let safe = gen
            .safe_trampoline(&inner, &[ParamDesc::void()], safe_return.clone(), fault)
            .expect("safe");

        let result = safe.invoke(&mut []).expect("safe call never faults");
        let inst = result.as_object().expect("safe return");
        assert!(Arc::ptr_eq(inst.class(), &safe_return));
        assert!(inst.get_field("Value").expect("value").is_null());
        let captured = inst.get_field("Fault").expect("fault");
        assert!(!captured.is_null());
    }

    static PROXY_CALLS: AtomicU64 = AtomicU64::new(0);

    extern "C" fn double_it(
        context: *mut c_void,
        count: u64,
        args: *const RawSlot,
        argc: usize,
        ret: *mut RawSlot,
    ) -> i32 {
        assert_eq!(context as usize, 99);
        assert_eq!(argc, 1);
        PROXY_CALLS.store(count, Ordering::SeqCst);
        unsafe {
            let v = (*args).0 as u32 as i32;
            *ret = RawSlot((v * 2) as u32 as u64);
        }
        0
    }

    #[test]
    fn test_proxy_dispatches_to_native() {
        let gen = codegen();
        let iface = ClassBuilder::interface("t.IDoubler")
            .method(MethodDef::signature("Double", &["i32"], "i32"))
            .build();
        let proxy_class = gen.proxy_class_for(&iface).expect("proxy class");
        assert_eq!(proxy_class.name, "proxy.t.IDoubler");
        // Synthesis is idempotent.
        assert!(Arc::ptr_eq(
            &proxy_class,
            &gen.proxy_class_for(&iface).expect("again")
        ));

        let ctor = proxy_class.find_ctor(&[]).expect("ctor");
        let obj = ctor.construct(&proxy_class, &mut []).expect("instance");
        let inst = obj.as_object().expect("object").clone();

        let descs = vec![
            ParamDesc::of_kind(ParamKind::I32),
            ParamDesc::of_kind(ParamKind::U64).input(),
            ParamDesc::of_kind(ParamKind::U64).input(),
            ParamDesc::of_kind(ParamKind::I32).input(),
        ];
        gen.connect_proxy_method(&inst, "Double", &descs, 99, double_it, None)
            .expect("connect");

        let method = proxy_class
            .find_method("Double", &["i32".into()], false)
            .expect("method");
        let out = method
            .invoke(Some(&obj), &mut [Value::I32(21)])
            .expect("dispatch");
        assert!(matches!(out, Value::I32(42)));
        assert_eq!(PROXY_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unconnected_proxy_method_faults() {
        let gen = codegen();
        let iface = ClassBuilder::interface("t.IVoid")
            .method(MethodDef::signature("Run", &[], "void"))
            .build();
        let proxy_class = gen.proxy_class_for(&iface).expect("proxy class");
        let obj = proxy_class
            .find_ctor(&[])
            .expect("ctor")
            .construct(&proxy_class, &mut [])
            .expect("instance");
        let method = proxy_class.find_method("Run", &[], false).expect("method");
        assert!(method.invoke(Some(&obj), &mut []).is_err());
    }

    #[test]
    fn test_proxy_class_requires_interface() {
        let gen = codegen();
        let class = ClassBuilder::new("t.Concrete").build();
        assert!(gen.proxy_class_for(&class).is_err());
    }
}
