//! Shared fixture: the `foolib` assembly
//!
//! A small managed library exercising every member shape the bridge
//! resolves: constructors, properties, a static method, an event, and an
//! interface consumed through a stored implementation.

use std::sync::Arc;
use tether_runtime::object::{ClassBuilder, ClassDef, CtorDef, Instance, MethodDef};
use tether_runtime::registry::AssemblyManifest;
use tether_runtime::{Fault, Value};

fn event_args_class() -> Arc<ClassDef> {
    ClassBuilder::new("foolib.PropertyChangedEventArgs")
        .field("PropertyName")
        .ctor(CtorDef::new(&["string"], |class, args| {
            let inst = Instance::new(class.clone());
            inst.set_field("PropertyName", args[0].clone());
            Ok(Value::Object(inst))
        }))
        .method(MethodDef::instance(
            "get_PropertyName",
            &[],
            "string",
            |this, _| {
                let inst = this.and_then(Value::as_object).expect("receiver");
                Ok(inst.get_field("PropertyName").unwrap_or_default())
            },
        ))
        .build()
}

fn transformation_interface() -> Arc<ClassDef> {
    ClassBuilder::interface("foolib.IBarTransformation")
        .method(MethodDef::signature("Transform", &["string"], "string"))
        .build()
}

fn bar_identity_class() -> Arc<ClassDef> {
    ClassBuilder::new("foolib.BarIdentity")
        .ctor(CtorDef::new(&[], |class, _| {
            Ok(Value::Object(Instance::new(class.clone())))
        }))
        .method(MethodDef::instance(
            "Transform",
            &["string"],
            "string",
            |_, args| Ok(args[0].clone()),
        ))
        .build()
}

fn apply_transform(transformation: &Value, value: Value) -> Result<Value, Fault> {
    let Some(inst) = transformation.as_object() else {
        return Ok(value);
    };
    let method = inst
        .class()
        .find_method("Transform", &["string".into()], false)
        .ok_or_else(|| Fault::member_not_found("Transform"))?;
    method.invoke(Some(transformation), &mut [value])
}

fn foo_class(event_args: Arc<ClassDef>) -> Arc<ClassDef> {
    let args_for_setter = event_args;
    ClassBuilder::new("foolib.Foo")
        .field("bar")
        .field("transformation")
        .event("PropertyChanged")
        .ctor(CtorDef::new(&[], |class, _| {
            let inst = Instance::new(class.clone());
            inst.set_field("bar", Value::str(""));
            Ok(Value::Object(inst))
        }))
        .ctor(CtorDef::new(&["foolib.IBarTransformation"], |class, args| {
            let inst = Instance::new(class.clone());
            inst.set_field("bar", Value::str(""));
            inst.set_field("transformation", args[0].clone());
            Ok(Value::Object(inst))
        }))
        .method(MethodDef::instance("get_Bar", &[], "string", |this, _| {
            let inst = this.and_then(Value::as_object).expect("receiver");
            Ok(inst.get_field("bar").unwrap_or_default())
        }))
        .method(MethodDef::instance(
            "set_Bar",
            &["string"],
            "void",
            move |this, args| {
                let receiver = this.expect("receiver");
                let inst = receiver.as_object().expect("object receiver");
                let transformation = inst.get_field("transformation").unwrap_or_default();
                let value = apply_transform(&transformation, args[0].clone())?;
                inst.set_field("bar", value);

                let event_args = Instance::new(args_for_setter.clone());
                event_args.set_field("PropertyName", Value::str("Bar"));
                inst.raise("PropertyChanged", receiver, &Value::Object(event_args));
                Ok(Value::Null)
            },
        ))
        .method(MethodDef::static_fn(
            "FormatNumber",
            &["string", "i32"],
            "string",
            |_, args| match (&args[0], &args[1]) {
                (Value::Str(prefix), Value::I32(n)) => Ok(Value::str(format!("{prefix}{n}"))),
                _ => Err(Fault::bad_argument("expected (string, i32)")),
            },
        ))
        .build()
}

/// Build the `foolib` manifest.
pub fn foolib() -> AssemblyManifest {
    let event_args = event_args_class();
    AssemblyManifest::new(
        "foolib",
        vec![
            transformation_interface(),
            bar_identity_class(),
            foo_class(event_args.clone()),
            event_args,
        ],
    )
}
