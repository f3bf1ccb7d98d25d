//! Built-in `core` assembly
//!
//! Always-available classes the bridge depends on:
//! - `core.Type`: the managed face of a class definition; instance methods
//!   resolved on a type object dispatch here.
//! - `core.Fault`: a captured fault, readable through `get_Message`.
//! - `core.SafeReturn`: result of a safe call, `{Value, Fault}`.

use crate::fault::Fault;
use crate::object::{ClassBuilder, ClassDef, CtorDef, Instance, MethodDef};
use crate::registry::AssemblyManifest;
use crate::value::Value;
use std::sync::Arc;

/// Name of the built-in assembly.
pub const CORE_ASSEMBLY: &str = "core";

/// Fully-qualified name of the type-object class.
pub const TYPE_CLASS: &str = "core.Type";
/// Fully-qualified name of the fault class.
pub const FAULT_CLASS: &str = "core.Fault";
/// Fully-qualified name of the safe-return class.
pub const SAFE_RETURN_CLASS: &str = "core.SafeReturn";

fn receiver_type(this: Option<&Value>) -> Result<Arc<ClassDef>, Fault> {
    this.and_then(Value::as_type)
        .cloned()
        .ok_or_else(|| Fault::bad_argument("receiver is not a type object"))
}

fn receiver_object(this: Option<&Value>) -> Result<Arc<Instance>, Fault> {
    this.and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Fault::bad_argument("receiver is not an object"))
}

fn type_class() -> Arc<ClassDef> {
    ClassBuilder::new(TYPE_CLASS)
        .method(MethodDef::instance("get_FullName", &[], "string", |this, _| {
            Ok(Value::str(&receiver_type(this)?.name))
        }))
        .method(MethodDef::instance("get_Name", &[], "string", |this, _| {
            let class = receiver_type(this)?;
            let short = class.name.rsplit('.').next().unwrap_or(&class.name);
            Ok(Value::str(short))
        }))
        .build()
}

fn fault_class() -> Arc<ClassDef> {
    ClassBuilder::new(FAULT_CLASS)
        .field("Message")
        .ctor(CtorDef::new(&["string"], |class, args| {
            let inst = Instance::new(class.clone());
            inst.set_field("Message", args[0].clone());
            Ok(Value::Object(inst))
        }))
        .method(MethodDef::instance("get_Message", &[], "string", |this, _| {
            Ok(receiver_object(this)?
                .get_field("Message")
                .unwrap_or_default())
        }))
        .build()
}

fn safe_return_class() -> Arc<ClassDef> {
    ClassBuilder::new(SAFE_RETURN_CLASS)
        .field("Value")
        .field("Fault")
        .method(MethodDef::instance("get_Value", &[], "object", |this, _| {
            Ok(receiver_object(this)?.get_field("Value").unwrap_or_default())
        }))
        .method(MethodDef::instance("get_Fault", &[], "object", |this, _| {
            Ok(receiver_object(this)?.get_field("Fault").unwrap_or_default())
        }))
        .build()
}

/// Build the built-in `core` assembly manifest.
pub fn core_assembly() -> AssemblyManifest {
    AssemblyManifest::new(
        CORE_ASSEMBLY,
        vec![type_class(), fault_class(), safe_return_class()],
    )
}

/// Wrap a fault into a `core.Fault` instance.
pub fn new_fault_object(fault_class: &Arc<ClassDef>, fault: &Fault) -> Value {
    let inst = Instance::new(fault_class.clone());
    inst.set_field("Message", Value::str(fault.message()));
    Value::Object(inst)
}

/// Build a `core.SafeReturn` instance carrying a value or a captured fault.
pub fn new_safe_return(safe_return_class: &Arc<ClassDef>, value: Value, fault: Value) -> Value {
    let inst = Instance::new(safe_return_class.clone());
    inst.set_field("Value", value);
    inst.set_field("Fault", fault);
    Value::Object(inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AssemblyRegistry, TypeRegistry};

    #[test]
    fn test_core_assembly_loads() {
        let types = Arc::new(TypeRegistry::new());
        let assemblies = AssemblyRegistry::new(types.clone());
        assemblies.install(core_assembly());
        assert!(assemblies.load(CORE_ASSEMBLY));
        assert!(types.resolve(TYPE_CLASS).is_some());
        assert!(types.resolve(FAULT_CLASS).is_some());
        assert!(types.resolve(SAFE_RETURN_CLASS).is_some());
    }

    #[test]
    fn test_type_object_full_name() {
        let class = type_class();
        let target = ClassBuilder::new("x.Widget").build();
        let method = class.find_method("get_FullName", &[], false).expect("method");
        let this = Value::Type(target);
        let name = method.invoke(Some(&this), &mut []).expect("name");
        assert_eq!(name.as_str(), Some("x.Widget"));
    }

    #[test]
    fn test_fault_object_message() {
        let class = fault_class();
        let obj = new_fault_object(&class, &Fault::new("boom"));
        let method = class.find_method("get_Message", &[], false).expect("method");
        let msg = method.invoke(Some(&obj), &mut []).expect("message");
        assert_eq!(msg.as_str(), Some("boom"));
    }
}
