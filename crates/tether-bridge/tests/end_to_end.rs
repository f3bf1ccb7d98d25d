//! Full embedding scenario driven through the public bridge API: interface
//! proxy, construction, property round-trip, event delivery, safe calls,
//! and handle-release cascades.

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tether_bridge::{
    utf16_free, utf16_from_ptr, utf16_into_raw, Bridge, BridgeError, Handle, ParamDesc, ParamKind,
    RawSlot,
};

fn bridge() -> Bridge {
    let bridge = Bridge::default();
    bridge.install_assembly(common::foolib());
    assert!(bridge.load_assembly("foolib"));
    bridge
}

fn string_ret() -> ParamDesc {
    ParamDesc::string()
}

// Native implementation of IBarTransformation.Transform: uppercases the
// input. The returned buffer is intentionally left to the process; the
// wire contract keeps callback-returned buffers owned by the native side.
extern "C" fn transform_upper(
    context: *mut c_void,
    count: u64,
    args: *const RawSlot,
    argc: usize,
    ret: *mut RawSlot,
) -> i32 {
    assert_eq!(context as usize, 0xBEEF);
    assert!(count >= 1);
    assert_eq!(argc, 1);
    unsafe {
        let input = utf16_from_ptr((*args).as_ptr()).expect("input string");
        *ret = RawSlot::from_ptr(utf16_into_raw(&input.to_uppercase()));
    }
    0
}

static CLEANUP_COUNT: AtomicU64 = AtomicU64::new(0);

extern "C" fn transform_cleanup(_context: *mut c_void, count: u64) {
    CLEANUP_COUNT.store(count, Ordering::SeqCst);
}

static EVENTS_SEEN: AtomicUsize = AtomicUsize::new(0);
static LAST_SENDER: AtomicU64 = AtomicU64::new(0);
static LAST_ARGS: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_property_changed(
    _context: *mut c_void,
    event_name: *const u16,
    sender: Handle,
    args: Handle,
) {
    assert_eq!(utf16_from_ptr(event_name).expect("name"), "PropertyChanged");
    EVENTS_SEEN.fetch_add(1, Ordering::SeqCst);
    LAST_SENDER.store(sender, Ordering::SeqCst);
    LAST_ARGS.store(args, Ordering::SeqCst);
}

fn transform_callback_descs() -> Vec<ParamDesc> {
    vec![
        string_ret(),
        ParamDesc::of_kind(ParamKind::U64).input(),
        ParamDesc::of_kind(ParamKind::U64).input(),
        ParamDesc::string().input(),
    ]
}

fn invoke_string_getter(bridge: &Bridge, addr: usize) -> String {
    let mut ret = RawSlot::ZERO;
    bridge.invoke(addr, &[], &mut ret).expect("getter");
    let text = utf16_from_ptr(ret.as_ptr()).expect("string return");
    utf16_free(ret.as_mut_ptr());
    text
}

#[test]
fn test_proxy_transform_and_event_scenario() {
    let bridge = bridge();

    // Native-implemented transformation behind an interface proxy.
    let proxy = bridge
        .add_interface_proxy("foolib.IBarTransformation")
        .expect("proxy");
    bridge
        .set_interface_method(
            proxy,
            "Transform",
            &transform_callback_descs(),
            0xBEEF,
            transform_upper,
            Some(transform_cleanup),
        )
        .expect("connect");

    // new Foo(transformation)
    let ctor = bridge
        .resolve_constructor(&[
            ParamDesc::named("foolib.Foo"),
            ParamDesc::named("foolib.IBarTransformation").input(),
        ])
        .expect("ctor");
    let mut foo = RawSlot::ZERO;
    bridge
        .invoke(ctor, &[RawSlot(proxy)], &mut foo)
        .expect("construct");
    let foo = foo.0;

    // Bar starts out empty.
    let getter = bridge
        .resolve_instance_method(foo, "get_Bar", &[string_ret()])
        .expect("get_Bar");
    assert_eq!(invoke_string_getter(&bridge, getter), "");

    bridge
        .add_event_handler(foo, "PropertyChanged", 1, on_property_changed)
        .expect("subscribe");

    // foo.Bar = "hello" runs the proxy transformation and raises the event.
    let setter = bridge
        .resolve_instance_method(
            foo,
            "set_Bar",
            &[ParamDesc::void(), ParamDesc::string().input()],
        )
        .expect("set_Bar");
    let arg = utf16_into_raw("hello");
    bridge
        .invoke(setter, &[RawSlot::from_ptr(arg)], &mut RawSlot::ZERO)
        .expect("invoke setter");
    utf16_free(arg);

    assert_eq!(invoke_string_getter(&bridge, getter), "HELLO");

    // The event fired once, with handles for the sender and the args.
    assert_eq!(EVENTS_SEEN.load(Ordering::SeqCst), 1);
    let sender = LAST_SENDER.load(Ordering::SeqCst);
    let args = LAST_ARGS.load(Ordering::SeqCst);
    assert_ne!(sender, 0);
    assert_ne!(args, 0);

    let name_getter = bridge
        .resolve_instance_method(args, "get_PropertyName", &[string_ret()])
        .expect("get_PropertyName");
    assert_eq!(invoke_string_getter(&bridge, name_getter), "Bar");

    // Handles delivered to the handler have independent lifecycles.
    bridge.free_object_ref(sender).expect("free sender");
    bridge.free_object_ref(args).expect("free args");

    // Releasing the last Foo handle removes its subscriptions and members.
    bridge.free_object_ref(foo).expect("free foo");
    assert!(matches!(
        bridge.invoke(getter, &[], &mut RawSlot::ZERO),
        Err(BridgeError::InvalidReference)
    ));
    assert_eq!(bridge.stats().event_relays, 0);

    // Dropping the last proxy handle reclaims the proxy object, which runs
    // the per-method cleanup with the final invocation count.
    bridge.free_delegate_ref(proxy).expect("free proxy");
    assert_eq!(CLEANUP_COUNT.load(Ordering::SeqCst), 1);
}

#[test]
fn test_static_format_and_safe_wrapper() {
    let bridge = bridge();
    let descs = vec![
        string_ret(),
        ParamDesc::string().input(),
        ParamDesc::of_kind(ParamKind::I32).input(),
    ];

    let addr = bridge
        .resolve_static_method("foolib.Foo", "FormatNumber", &descs)
        .expect("resolve");
    let prefix = utf16_into_raw("n = ");
    let mut ret = RawSlot::ZERO;
    bridge
        .invoke(addr, &[RawSlot::from_ptr(prefix), RawSlot(42)], &mut ret)
        .expect("invoke");
    utf16_free(prefix);
    assert_eq!(utf16_from_ptr(ret.as_ptr()).expect("result"), "n = 42");
    utf16_free(ret.as_mut_ptr());

    // The safe variant returns a handle on a wrapper object instead.
    let safe = bridge
        .resolve_static_method_safe("foolib.Foo", "FormatNumber", &descs)
        .expect("resolve safe");
    assert_ne!(safe, addr);
    // Wrapping the plain invocation id lands on the same cached wrapper.
    assert_eq!(bridge.resolve_safe_method(addr, &descs).expect("wrap"), safe);
    let prefix = utf16_into_raw("n = ");
    let mut ret = RawSlot::ZERO;
    bridge
        .invoke(safe, &[RawSlot::from_ptr(prefix), RawSlot(7)], &mut ret)
        .expect("safe invoke");
    utf16_free(prefix);

    let wrapper = bridge.refs().resolve(ret.0).expect("wrapper handle");
    let value_getter = bridge
        .resolve_instance_method(ret.0, "get_Value", &[string_ret()])
        .expect("get_Value");
    drop(wrapper);
    let mut value = RawSlot::ZERO;
    bridge.invoke(value_getter, &[], &mut value).expect("value");
    assert_eq!(utf16_from_ptr(value.as_ptr()).expect("value"), "n = 7");
    utf16_free(value.as_mut_ptr());

    let fault_getter = bridge
        .resolve_instance_method(
            ret.0,
            "get_Fault",
            &[ParamDesc::named("core.Fault")],
        )
        .expect("get_Fault");
    let mut fault = RawSlot::ZERO;
    bridge.invoke(fault_getter, &[], &mut fault).expect("fault");
    assert_eq!(fault.0, 0);
}

#[test]
fn test_ready_made_identity_transformation() {
    let bridge = bridge();

    // new Foo(new BarIdentity()) leaves values unchanged.
    let identity_ctor = bridge
        .resolve_constructor(&[ParamDesc::named("foolib.BarIdentity")])
        .expect("identity ctor");
    let mut identity = RawSlot::ZERO;
    bridge
        .invoke(identity_ctor, &[], &mut identity)
        .expect("construct identity");

    let ctor = bridge
        .resolve_constructor(&[
            ParamDesc::named("foolib.Foo"),
            ParamDesc::named("foolib.IBarTransformation").input(),
        ])
        .expect("ctor");
    let mut foo = RawSlot::ZERO;
    bridge
        .invoke(ctor, &[identity], &mut foo)
        .expect("construct foo");

    let setter = bridge
        .resolve_instance_method(
            foo.0,
            "set_Bar",
            &[ParamDesc::void(), ParamDesc::string().input()],
        )
        .expect("set_Bar");
    let arg = utf16_into_raw("unchanged");
    bridge
        .invoke(setter, &[RawSlot::from_ptr(arg)], &mut RawSlot::ZERO)
        .expect("invoke setter");
    utf16_free(arg);

    let getter = bridge
        .resolve_instance_method(foo.0, "get_Bar", &[string_ret()])
        .expect("get_Bar");
    assert_eq!(invoke_string_getter(&bridge, getter), "unchanged");
}

#[test]
fn test_type_object_members() {
    let bridge = bridge();
    let type_ref = bridge.get_type_ref("foolib.Foo").expect("type ref");

    let full_name = bridge
        .resolve_instance_method(type_ref, "get_FullName", &[string_ret()])
        .expect("get_FullName");
    assert_eq!(invoke_string_getter(&bridge, full_name), "foolib.Foo");

    let short_name = bridge
        .resolve_instance_method(type_ref, "get_Name", &[string_ret()])
        .expect("get_Name");
    assert_eq!(invoke_string_getter(&bridge, short_name), "Foo");

    // Freeing the type reference evicts its members.
    bridge.free_type_ref("foolib.Foo").expect("free type");
    assert!(bridge
        .invoke(full_name, &[], &mut RawSlot::ZERO)
        .is_err());
    assert!(matches!(
        bridge.refs().resolve(type_ref),
        Err(BridgeError::InvalidReference)
    ));
}
