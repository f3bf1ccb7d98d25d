//! Object model: class manifests and instances
//!
//! Classes are declared ahead of time as manifests of named members whose
//! bodies are stored Rust function values. This is the closed-manifest
//! rendition of a reflective member surface: the set of callable members is
//! fixed when the manifest is built, and the bridge discovers them by name
//! and exact signature at run time.

use crate::fault::Fault;
use crate::value::Value;
use crate::CallResult;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Body of a managed method: receives the receiver (None for statics) and
/// the argument list. Arguments are mutable so bodies can service
/// out-parameters.
pub type MethodBody =
    Arc<dyn Fn(Option<&Value>, &mut [Value]) -> CallResult + Send + Sync>;

/// Body of a constructor: receives the defining class and the argument list,
/// returns the new instance.
pub type CtorBody = Arc<dyn Fn(&Arc<ClassDef>, &mut [Value]) -> CallResult + Send + Sync>;

/// Listener attached to a managed event; invoked with `(sender, args)`.
pub type EventListener = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Token identifying an attached event listener.
pub type ListenerId = u64;

/// Kind of class definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    /// Concrete class with callable members
    Class,
    /// Interface: signature-only members, implemented by classes or by
    /// bridge-synthesized proxies
    Interface,
}

/// A managed method: name, exact signature, and body.
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Static (no receiver) vs. instance binding
    pub is_static: bool,
    /// Canonical parameter type names, in order
    pub params: Vec<String>,
    /// Canonical return type name (`void` for none)
    pub returns: String,
    body: Option<MethodBody>,
}

impl MethodDef {
    /// Declare an instance method.
    pub fn instance(
        name: &str,
        params: &[&str],
        returns: &str,
        body: impl Fn(Option<&Value>, &mut [Value]) -> CallResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            is_static: false,
            params: params.iter().map(|s| s.to_string()).collect(),
            returns: returns.into(),
            body: Some(Arc::new(body)),
        }
    }

    /// Declare a static method.
    pub fn static_fn(
        name: &str,
        params: &[&str],
        returns: &str,
        body: impl Fn(Option<&Value>, &mut [Value]) -> CallResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            is_static: true,
            params: params.iter().map(|s| s.to_string()).collect(),
            returns: returns.into(),
            body: Some(Arc::new(body)),
        }
    }

    /// Declare an interface method signature (no body).
    pub fn signature(name: &str, params: &[&str], returns: &str) -> Self {
        Self {
            name: name.into(),
            is_static: false,
            params: params.iter().map(|s| s.to_string()).collect(),
            returns: returns.into(),
            body: None,
        }
    }

    /// Invoke the method body.
    pub fn invoke(&self, this: Option<&Value>, args: &mut [Value]) -> CallResult {
        match &self.body {
            Some(body) => body(this, args),
            None => Err(Fault::new(format!(
                "method '{}' has no implementation",
                self.name
            ))),
        }
    }
}

impl std::fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("is_static", &self.is_static)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

/// A constructor: exact parameter signature and factory body.
pub struct CtorDef {
    /// Canonical parameter type names, in order
    pub params: Vec<String>,
    factory: CtorBody,
}

impl CtorDef {
    /// Declare a constructor.
    pub fn new(
        params: &[&str],
        factory: impl Fn(&Arc<ClassDef>, &mut [Value]) -> CallResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            params: params.iter().map(|s| s.to_string()).collect(),
            factory: Arc::new(factory),
        }
    }

    /// Invoke the factory, producing a new instance value.
    pub fn construct(&self, class: &Arc<ClassDef>, args: &mut [Value]) -> CallResult {
        (self.factory)(class, args)
    }
}

impl std::fmt::Debug for CtorDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtorDef").field("params", &self.params).finish()
    }
}

/// A class manifest: the complete member surface of a managed type.
#[derive(Debug)]
pub struct ClassDef {
    /// Fully-qualified type name (e.g. `foolib.Foo`)
    pub name: String,
    /// Class vs. interface
    pub kind: ClassKind,
    methods: Vec<MethodDef>,
    ctors: Vec<CtorDef>,
    events: Vec<String>,
    fields: Vec<String>,
}

impl ClassDef {
    /// Find a method by name and exact parameter type list.
    ///
    /// Overload matching is exact-type only: no numeric widening, no
    /// subtype substitution.
    pub fn find_method(&self, name: &str, params: &[String], is_static: bool) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.is_static == is_static && m.params == params)
    }

    /// Find a constructor by exact parameter type list.
    pub fn find_ctor(&self, params: &[String]) -> Option<&CtorDef> {
        self.ctors.iter().find(|c| c.params == params)
    }

    /// All declared methods.
    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    /// Whether the class declares the named event.
    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e == name)
    }

    /// Declared instance field names.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Builder for class manifests.
pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    methods: Vec<MethodDef>,
    ctors: Vec<CtorDef>,
    events: Vec<String>,
    fields: Vec<String>,
}

impl ClassBuilder {
    /// Start a concrete class manifest.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: ClassKind::Class,
            methods: Vec::new(),
            ctors: Vec::new(),
            events: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Start an interface manifest.
    pub fn interface(name: &str) -> Self {
        Self {
            kind: ClassKind::Interface,
            ..Self::new(name)
        }
    }

    /// Add a method (or interface signature).
    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Add a constructor.
    pub fn ctor(mut self, ctor: CtorDef) -> Self {
        self.ctors.push(ctor);
        self
    }

    /// Declare an event.
    pub fn event(mut self, name: &str) -> Self {
        self.events.push(name.into());
        self
    }

    /// Declare an instance field.
    pub fn field(mut self, name: &str) -> Self {
        self.fields.push(name.into());
        self
    }

    /// Finalize the manifest.
    ///
    /// Concrete classes get an implicit zero-arg `GetType` method returning
    /// the type object, unless the manifest already declares one.
    pub fn build(self) -> Arc<ClassDef> {
        let Self {
            name,
            kind,
            mut methods,
            ctors,
            events,
            fields,
        } = self;
        Arc::new_cyclic(|weak: &Weak<ClassDef>| {
            if kind == ClassKind::Class && !methods.iter().any(|m| m.name == "GetType") {
                let weak = weak.clone();
                methods.push(MethodDef::instance("GetType", &[], "core.Type", move |_, _| {
                    weak.upgrade()
                        .map(Value::Type)
                        .ok_or_else(|| Fault::new("class definition dropped"))
                }));
            }
            ClassDef {
                name,
                kind,
                methods,
                ctors,
                events,
                fields,
            }
        })
    }
}

/// An object instance: class reference, field storage, event listeners,
/// and an opaque native extension slot.
pub struct Instance {
    class: Arc<ClassDef>,
    fields: RwLock<FxHashMap<String, Value>>,
    listeners: Mutex<FxHashMap<String, Vec<(ListenerId, EventListener)>>>,
    next_listener: AtomicU64,
    native: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Instance {
    /// Allocate a new instance. Declared fields start out null.
    pub fn new(class: Arc<ClassDef>) -> Arc<Self> {
        let mut fields = FxHashMap::default();
        for field in class.fields() {
            fields.insert(field.clone(), Value::Null);
        }
        Arc::new(Self {
            class,
            fields: RwLock::new(fields),
            listeners: Mutex::new(FxHashMap::default()),
            next_listener: AtomicU64::new(1),
            native: OnceLock::new(),
        })
    }

    /// The instance's class.
    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    /// Read a field. Unknown fields read as `None`.
    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.read().get(name).cloned()
    }

    /// Write a field.
    pub fn set_field(&self, name: &str, value: Value) {
        self.fields.write().insert(name.into(), value);
    }

    /// Attach a listener to a declared event.
    pub fn attach_listener(&self, event: &str, listener: EventListener) -> Result<ListenerId, Fault> {
        if !self.class.has_event(event) {
            return Err(Fault::member_not_found(event));
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.into())
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    /// Detach a previously attached listener. Unknown ids are a no-op.
    pub fn detach_listener(&self, event: &str, id: ListenerId) {
        if let Some(list) = self.listeners.lock().get_mut(event) {
            list.retain(|(lid, _)| *lid != id);
        }
    }

    /// Raise an event: every attached listener is invoked with
    /// `(sender, args)` on the raising thread. The listener list is
    /// snapshotted first so listeners may detach themselves.
    pub fn raise(&self, event: &str, sender: &Value, args: &Value) {
        let snapshot: Vec<EventListener> = {
            let listeners = self.listeners.lock();
            match listeners.get(event) {
                Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            listener(sender, args);
        }
    }

    /// Install the opaque native extension payload. Returns `false` if a
    /// payload was already installed.
    pub fn set_native(&self, payload: Box<dyn Any + Send + Sync>) -> bool {
        self.native.set(payload).is_ok()
    }

    /// Borrow the native extension payload, downcast to `T`.
    pub fn native_ref<T: Any>(&self) -> Option<&T> {
        self.native.get().and_then(|b| b.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class.name)
            .finish()
    }
}
