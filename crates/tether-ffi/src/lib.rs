//! C FFI bindings for the tether bridge
//!
//! This module provides a C-compatible API for driving the bridge from
//! native code. The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Thread-safe (a bridge instance can be used from multiple threads)
//! - Error handling via out-parameters
//! - Opaque pointers for bridge instances
//! - Manual memory management
//!
//! Names (types, members, assemblies, events) cross as NUL-terminated
//! UTF-16 buffers. A parameter list always describes the return slot at
//! index 0; `void` returns use an all-zero descriptor. Resolved members are
//! invoked through the opaque id `tether_resolve_*` returns, with one
//! 64-bit slot per argument and one for the return value.

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use tether_bridge::{
    utf16_from_ptr, Bridge, BridgeError, BridgeOptions, Handle, NativeCleanupFn, NativeEventFn,
    NativeMethodFn, ParamDesc, RawSlot,
};

// ============================================================================
// Opaque Types
// ============================================================================

/// Opaque handle to a bridge instance
#[repr(C)]
pub struct TetherBridge {
    _private: [u8; 0],
}

/// Error information
#[repr(C)]
pub struct TetherError {
    message: *mut c_char,
}

/// One parameter descriptor as it crosses the C boundary.
///
/// `type_name` is optional (may be NULL); `param_info` packs kind, flags
/// and array length into 64 bits.
#[repr(C)]
pub struct RawParameter {
    /// Optional NUL-terminated UTF-16 type name or adapter id
    pub type_name: *const u16,
    /// Packed kind/flags/length word
    pub param_info: u64,
}

/// Point-in-time bridge table sizes.
#[repr(C)]
#[derive(Default)]
pub struct TetherStats {
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

// Internal representation of the bridge (not exposed to C)
struct BridgeHandle {
    bridge: Bridge,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Convert Rust string to C string (caller must free)
unsafe fn rust_to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Create error from BridgeError
unsafe fn create_error(error: BridgeError) -> *mut TetherError {
    let message = rust_to_c_string(&error.to_string());
    let err = Box::new(TetherError { message });
    Box::into_raw(err)
}

/// Set error out-parameter
unsafe fn set_error(error_out: *mut *mut TetherError, error: BridgeError) {
    if !error_out.is_null() {
        *error_out = create_error(error);
    }
}

unsafe fn invalid_args(error_out: *mut *mut TetherError) {
    set_error(
        error_out,
        BridgeError::ArgumentInvalid("invalid arguments (null pointer)".to_string()),
    );
}

unsafe fn bridge_of<'a>(bridge: *mut TetherBridge) -> &'a Bridge {
    &(*(bridge as *mut BridgeHandle)).bridge
}

/// Borrow the underlying [`Bridge`] of an FFI handle.
///
/// For mixed hosts: Rust code that installs assemblies or custom adapters
/// on a bridge created through the C API.
///
/// # Safety
/// `bridge` must be a live pointer from [`tether_bridge_new`].
pub unsafe fn bridge_ref<'a>(bridge: *mut TetherBridge) -> &'a Bridge {
    bridge_of(bridge)
}

unsafe fn read_utf16(ptr: *const u16) -> Option<String> {
    utf16_from_ptr(ptr)
}

/// Decode a C parameter list into descriptors.
unsafe fn decode_params(
    params: *const RawParameter,
    count: usize,
) -> Result<Vec<ParamDesc>, BridgeError> {
    if count == 0 {
        return Err(BridgeError::ArgumentInvalid(
            "parameter list must at least describe the return slot".to_string(),
        ));
    }
    if params.is_null() {
        return Err(BridgeError::ArgumentInvalid(
            "null parameter list".to_string(),
        ));
    }
    let raw = std::slice::from_raw_parts(params, count);
    Ok(raw
        .iter()
        .map(|p| ParamDesc::from_raw(read_utf16(p.type_name), p.param_info))
        .collect())
}

unsafe fn arg_slots<'a>(args: *const u64, argc: usize) -> &'a [RawSlot] {
    if args.is_null() || argc == 0 {
        return &[];
    }
    std::slice::from_raw_parts(args as *const RawSlot, argc)
}

// ============================================================================
// Bridge Lifecycle Functions
// ============================================================================

/// Create a new bridge instance
///
/// # Arguments
/// * `event_args_weak` - Non-zero to expose event argument handles weakly
/// * `error` - Optional pointer to receive error information
///
/// # Returns
/// * Non-null pointer to TetherBridge on success
///
/// # Safety
/// The returned bridge must be freed with `tether_bridge_destroy()`
#[no_mangle]
pub unsafe extern "C" fn tether_bridge_new(
    event_args_weak: c_int,
    _error: *mut *mut TetherError,
) -> *mut TetherBridge {
    let bridge = Bridge::new(BridgeOptions {
        event_args_weak: event_args_weak != 0,
    });
    let handle = Box::new(BridgeHandle { bridge });
    Box::into_raw(handle) as *mut TetherBridge
}

/// Destroy a bridge instance and free all resources
///
/// # Arguments
/// * `bridge` - Pointer to TetherBridge (may be NULL)
///
/// # Safety
/// - Bridge pointer must be valid (created by `tether_bridge_new()`)
/// - Bridge must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn tether_bridge_destroy(bridge: *mut TetherBridge) {
    if bridge.is_null() {
        return;
    }

    let handle = Box::from_raw(bridge as *mut BridgeHandle);
    handle.bridge.shutdown();
    drop(handle);
}

/// Drain every bridge table without destroying the bridge
///
/// Invalidates all handles and resolved members; the bridge stays usable.
///
/// # Safety
/// Bridge pointer must be valid
#[no_mangle]
pub unsafe extern "C" fn tether_bridge_shutdown(bridge: *mut TetherBridge) {
    if bridge.is_null() {
        return;
    }
    bridge_of(bridge).shutdown();
}

/// Load an assembly by name or path
///
/// Probes the spec as an assembly name, as a path (by file stem), and as a
/// path with the conventional module extension appended.
///
/// # Returns
/// * 1 when a probe succeeded, 0 otherwise (this call never faults)
///
/// # Safety
/// - Bridge pointer must be valid
/// - Spec must be a valid NUL-terminated UTF-16 string
#[no_mangle]
pub unsafe extern "C" fn tether_load_assembly(
    bridge: *mut TetherBridge,
    spec: *const u16,
) -> c_int {
    if bridge.is_null() {
        return 0;
    }
    let Some(spec) = read_utf16(spec) else {
        return 0;
    };
    c_int::from(bridge_of(bridge).load_assembly(&spec))
}

// ============================================================================
// Member Resolution Functions
// ============================================================================

unsafe fn resolve_with(
    bridge: *mut TetherBridge,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
    resolve: impl FnOnce(&Bridge, &[ParamDesc]) -> Result<usize, BridgeError>,
) -> usize {
    if bridge.is_null() {
        invalid_args(error);
        return 0;
    }
    let descs = match decode_params(params, count) {
        Ok(descs) => descs,
        Err(e) => {
            set_error(error, e);
            return 0;
        }
    };
    match resolve(bridge_of(bridge), &descs) {
        Ok(addr) => addr,
        Err(e) => {
            set_error(error, e);
            0
        }
    }
}

/// Resolve a static method to an opaque invocation id
///
/// # Arguments
/// * `type_name` - Fully-qualified type name (UTF-16)
/// * `method` - Method name (UTF-16)
/// * `params` - Descriptor list; index 0 describes the return slot
/// * `count` - Number of descriptors, including the return slot
///
/// # Returns
/// * Non-zero invocation id on success, 0 on failure (check error)
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_static_method(
    bridge: *mut TetherBridge,
    type_name: *const u16,
    method: *const u16,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    let (Some(type_name), Some(method)) = (read_utf16(type_name), read_utf16(method)) else {
        invalid_args(error);
        return 0;
    };
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_static_method(&type_name, &method, descs)
    })
}

/// Resolve an instance method on the target of a handle
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_instance_method(
    bridge: *mut TetherBridge,
    target: Handle,
    method: *const u16,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    let Some(method) = read_utf16(method) else {
        invalid_args(error);
        return 0;
    };
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_instance_method(target, &method, descs)
    })
}

/// Resolve a constructor to an opaque invocation id
///
/// The return-slot descriptor names the constructed type; invoking the id
/// yields a strong handle on the new object.
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_constructor(
    bridge: *mut TetherBridge,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_constructor(descs)
    })
}

/// Resolve the fault-capturing variant of a static method
///
/// Invocations of the returned id never report a fault; the return slot
/// carries a strong handle on a `core.SafeReturn` object whose `get_Value`
/// and `get_Fault` accessors expose the outcome.
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_static_method_safe(
    bridge: *mut TetherBridge,
    type_name: *const u16,
    method: *const u16,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    let (Some(type_name), Some(method)) = (read_utf16(type_name), read_utf16(method)) else {
        invalid_args(error);
        return 0;
    };
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_static_method_safe(&type_name, &method, descs)
    })
}

/// Resolve the fault-capturing variant of an instance method
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_instance_method_safe(
    bridge: *mut TetherBridge,
    target: Handle,
    method: *const u16,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    let Some(method) = read_utf16(method) else {
        invalid_args(error);
        return 0;
    };
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_instance_method_safe(target, &method, descs)
    })
}

/// Wrap an already resolved member in its fault-capturing variant
///
/// `addr` is the invocation id a previous `tether_resolve_*` call returned;
/// the descriptor list is that member's. Invocations of the returned id
/// never report a fault.
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_resolve_safe_method(
    bridge: *mut TetherBridge,
    addr: usize,
    params: *const RawParameter,
    count: usize,
    error: *mut *mut TetherError,
) -> usize {
    resolve_with(bridge, params, count, error, |bridge, descs| {
        bridge.resolve_safe_method(addr, descs)
    })
}

/// Invoke a resolved member
///
/// # Arguments
/// * `addr` - Invocation id from a `tether_resolve_*` call
/// * `args` - One 64-bit slot per parameter, in descriptor order
/// * `argc` - Number of argument slots
/// * `ret` - Receives the return slot (may be NULL for void returns)
///
/// # Returns
/// * 0 on success
/// * -1 on failure (check error parameter)
///
/// # Safety
/// - Bridge pointer must be valid
/// - Slots carrying pointers must satisfy the wire contract
#[no_mangle]
pub unsafe extern "C" fn tether_invoke(
    bridge: *mut TetherBridge,
    addr: usize,
    args: *const u64,
    argc: usize,
    ret: *mut u64,
    error: *mut *mut TetherError,
) -> c_int {
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    let mut ret_slot = RawSlot::ZERO;
    match bridge_of(bridge).invoke(addr, arg_slots(args, argc), &mut ret_slot) {
        Ok(()) => {
            if !ret.is_null() {
                *ret = ret_slot.0;
            }
            0
        }
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

// ============================================================================
// Object Reference Functions
// ============================================================================

/// Handle on the type object of a published type
///
/// # Returns
/// * Non-zero handle on success, 0 on failure (check error)
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_get_type_ref(
    bridge: *mut TetherBridge,
    type_name: *const u16,
    error: *mut *mut TetherError,
) -> Handle {
    if bridge.is_null() {
        invalid_args(error);
        return 0;
    }
    let Some(type_name) = read_utf16(type_name) else {
        invalid_args(error);
        return 0;
    };
    match bridge_of(bridge).get_type_ref(&type_name) {
        Ok(handle) => handle,
        Err(e) => {
            set_error(error, e);
            0
        }
    }
}

/// Walk a dot path of member names from the target of a handle
///
/// Each segment reads the `get_{segment}` property, or the declared field
/// of that name. On a type-object handle the first segment resolves
/// statically. An empty path aliases the target itself.
///
/// # Returns
/// * Strong handle on the final value, 0 on failure (check error)
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_get_object(
    bridge: *mut TetherBridge,
    handle: Handle,
    path: *const u16,
    error: *mut *mut TetherError,
) -> Handle {
    if bridge.is_null() {
        invalid_args(error);
        return 0;
    }
    let Some(path) = read_utf16(path) else {
        invalid_args(error);
        return 0;
    };
    match bridge_of(bridge).get_object(handle, &path) {
        Ok(handle) => handle,
        Err(e) => {
            set_error(error, e);
            0
        }
    }
}

/// New handle aliasing the target of an existing one
///
/// Always a fresh handle with its own release lifecycle, even when the
/// target is already exposed.
///
/// # Arguments
/// * `weak` - Non-zero for a weak handle (does not keep the target alive)
///
/// # Safety
/// Bridge pointer must be valid
#[no_mangle]
pub unsafe extern "C" fn tether_add_object_ref(
    bridge: *mut TetherBridge,
    handle: Handle,
    weak: c_int,
    error: *mut *mut TetherError,
) -> Handle {
    if bridge.is_null() {
        invalid_args(error);
        return 0;
    }
    match bridge_of(bridge).add_object_ref(handle, weak != 0) {
        Ok(alias) => alias,
        Err(e) => {
            set_error(error, e);
            0
        }
    }
}

/// Release a handle
///
/// Event subscriptions made through the handle are removed; when no other
/// handle aliases the target, its cached members are evicted too.
///
/// # Returns
/// * 0 on success, -1 on failure (check error parameter)
///
/// # Safety
/// Bridge pointer must be valid
#[no_mangle]
pub unsafe extern "C" fn tether_free_object_ref(
    bridge: *mut TetherBridge,
    handle: Handle,
    error: *mut *mut TetherError,
) -> c_int {
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    match bridge_of(bridge).free_object_ref(handle) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Release a handle on an interface proxy
///
/// Cleanup callbacks of connected methods run once the proxy object itself
/// is reclaimed.
///
/// # Safety
/// Bridge pointer must be valid
#[no_mangle]
pub unsafe extern "C" fn tether_free_delegate_ref(
    bridge: *mut TetherBridge,
    handle: Handle,
    error: *mut *mut TetherError,
) -> c_int {
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    match bridge_of(bridge).free_delegate_ref(handle) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Release every handle on a type object and evict its static members
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_free_type_ref(
    bridge: *mut TetherBridge,
    type_name: *const u16,
    error: *mut *mut TetherError,
) -> c_int {
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    let Some(type_name) = read_utf16(type_name) else {
        invalid_args(error);
        return -1;
    };
    match bridge_of(bridge).free_type_ref(&type_name) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Free a UTF-16 string the bridge returned through a return slot
///
/// # Safety
/// - String must have been produced by a bridge invocation (may be NULL)
/// - String must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn tether_free_string(s: *mut u16) {
    tether_bridge::utf16_free(s);
}

// ============================================================================
// Event Functions
// ============================================================================

/// Subscribe a native callback to a managed event
///
/// Subscribing again with the same handle, event and context swaps the
/// callback in place. The handler receives strong handles for the sender
/// and (unless the bridge was created with weak event arguments) the
/// arguments, and owns their release.
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_add_event_handler(
    bridge: *mut TetherBridge,
    handle: Handle,
    event: *const u16,
    context: *mut c_void,
    callback: Option<NativeEventFn>,
    error: *mut *mut TetherError,
) -> c_int {
    let (Some(event), Some(callback)) = (read_utf16(event), callback) else {
        invalid_args(error);
        return -1;
    };
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    match bridge_of(bridge).add_event_handler(handle, &event, context as usize, callback) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Remove one event subscription
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_remove_event_handler(
    bridge: *mut TetherBridge,
    handle: Handle,
    event: *const u16,
    context: *mut c_void,
    error: *mut *mut TetherError,
) -> c_int {
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    let Some(event) = read_utf16(event) else {
        invalid_args(error);
        return -1;
    };
    match bridge_of(bridge).remove_event_handler(handle, &event, context as usize) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Remove every event subscription made through a handle
///
/// # Safety
/// Bridge pointer must be valid
#[no_mangle]
pub unsafe extern "C" fn tether_remove_all_event_handlers(
    bridge: *mut TetherBridge,
    handle: Handle,
) {
    if bridge.is_null() {
        return;
    }
    bridge_of(bridge).remove_all_event_handlers(handle);
}

// ============================================================================
// Interface Proxy Functions
// ============================================================================

/// Instantiate a proxy implementing a published interface
///
/// Methods start unconnected and fault until connected with
/// `tether_set_interface_method()`.
///
/// # Returns
/// * Strong handle on the proxy object, 0 on failure (check error)
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_add_interface_proxy(
    bridge: *mut TetherBridge,
    interface: *const u16,
    error: *mut *mut TetherError,
) -> Handle {
    if bridge.is_null() {
        invalid_args(error);
        return 0;
    }
    let Some(interface) = read_utf16(interface) else {
        invalid_args(error);
        return 0;
    };
    match bridge_of(bridge).add_interface_proxy(&interface) {
        Ok(handle) => handle,
        Err(e) => {
            set_error(error, e);
            0
        }
    }
}

/// Connect a proxied method to its native implementation
///
/// The descriptor list covers the callback's full native signature: the
/// return slot, then the context and invocation-count parameters supplied
/// by the dispatcher, then the managed parameters. Reconnecting an already
/// connected method releases the previous configuration first.
///
/// # Safety
/// All pointers must be valid per their argument descriptions
#[no_mangle]
pub unsafe extern "C" fn tether_set_interface_method(
    bridge: *mut TetherBridge,
    proxy: Handle,
    method: *const u16,
    params: *const RawParameter,
    count: usize,
    context: *mut c_void,
    callback: Option<NativeMethodFn>,
    cleanup: Option<NativeCleanupFn>,
    error: *mut *mut TetherError,
) -> c_int {
    let (Some(method), Some(callback)) = (read_utf16(method), callback) else {
        invalid_args(error);
        return -1;
    };
    if bridge.is_null() {
        invalid_args(error);
        return -1;
    }
    let descs = match decode_params(params, count) {
        Ok(descs) => descs,
        Err(e) => {
            set_error(error, e);
            return -1;
        }
    };
    match bridge_of(bridge).set_interface_method(
        proxy,
        &method,
        &descs,
        context as usize,
        callback,
        cleanup,
    ) {
        Ok(()) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Fill `out` with current bridge table sizes
///
/// # Returns
/// * 0 on success, -1 when either pointer is NULL
///
/// # Safety
/// Pointers must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn tether_stats(
    bridge: *mut TetherBridge,
    out: *mut TetherStats,
) -> c_int {
    if bridge.is_null() || out.is_null() {
        return -1;
    }
    let stats = bridge_of(bridge).stats();
    *out = TetherStats {
        object_refs: stats.object_refs,
        trampolines: stats.trampolines,
        safe_trampolines: stats.safe_trampolines,
        plans: stats.plans,
        proxy_classes: stats.proxy_classes,
        event_relays: stats.event_relays,
        types: stats.types,
    };
    0
}

// ============================================================================
// Error Handling Functions
// ============================================================================

/// Get the error message
///
/// # Returns
/// * NUL-terminated error message string, NULL if error is NULL
///
/// # Safety
/// - Error pointer must be valid
/// - Returned string is valid until `tether_error_free()` is called
/// - Do not free the returned string directly
#[no_mangle]
pub unsafe extern "C" fn tether_error_message(error: *const TetherError) -> *const c_char {
    if error.is_null() {
        return ptr::null();
    }

    (*error).message
}

/// Free an error
///
/// # Safety
/// - Error pointer must be valid (created by the tether API)
/// - Error must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn tether_error_free(error: *mut TetherError) {
    if error.is_null() {
        return;
    }

    if !(*error).message.is_null() {
        let _ = CString::from_raw((*error).message);
    }

    let _ = Box::from_raw(error);
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the tether version string
///
/// # Safety
/// The returned string is static and must not be freed
#[no_mangle]
pub unsafe extern "C" fn tether_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

// ============================================================================
// Tests
// ============================================================================
