//! Managed object runtime for the tether bridge
//!
//! This crate provides the managed side of the bridge:
//! - Dynamic value model with canonical runtime type names
//! - Class manifests (methods, constructors, events, fields) declared
//!   ahead of time as Rust function values
//! - Instances with locked field storage and event listener lists
//! - Type registry resolvable by fully-qualified name
//! - Assembly registry with load-by-name / load-by-path probing
//!
//! The bridge crate (`tether-bridge`) treats this as an opaque
//! "resolve type/member by name" service; everything native callers can
//! reach goes through a class manifest registered here.

#![warn(rust_2018_idioms)]

pub mod builtin;
pub mod fault;
pub mod object;
pub mod registry;
pub mod value;

pub use builtin::core_assembly;
pub use fault::Fault;
pub use object::{
    ClassBuilder, ClassDef, ClassKind, CtorDef, EventListener, Instance, ListenerId, MethodBody,
    MethodDef,
};
pub use registry::{AssemblyManifest, AssemblyRegistry, TypeRegistry};
pub use value::{ArrayValue, Value};

/// Result of invoking a managed member.
pub type CallResult = Result<Value, Fault>;
