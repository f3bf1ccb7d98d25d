//! Boundary slots and marshaling adapters
//!
//! Every value crosses the boundary inside a 64-bit [`RawSlot`]. Primitives
//! travel inline; strings travel as pointers to NUL-terminated UTF-16
//! buffers; objects travel as reference-table handles; arrays travel as
//! pointers to contiguous elements of the element kind's native width.
//!
//! A [`MarshalPlan`] is the compiled form of a descriptor list: one slot
//! plan per parameter plus the return slot, usable in both directions
//! (native caller invoking a managed member, and a managed proxy invoking
//! a native callback).
//!
//! Slots that carry pointers are only dereferenced under the wire
//! contract: the pointer is either null or valid for the access the
//! descriptor declares, for the duration of the call.

use crate::param::{ArrayLen, ParamDesc, ParamKind};
use crate::refs::{Handle, RefTable, NULL_HANDLE};
use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use std::sync::Arc;
use tether_runtime::Value;

/// One 64-bit boundary slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct RawSlot(pub u64);

impl RawSlot {
    /// The zero slot (null pointer, null handle, void return).
    pub const ZERO: RawSlot = RawSlot(0);

    /// Slot carrying a pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        RawSlot(ptr as usize as u64)
    }

    /// The slot's payload as a const pointer.
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// The slot's payload as a mut pointer.
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Whether the payload is zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

// --- wide strings ---------------------------------------------------------

/// Copy a string into a freshly allocated NUL-terminated UTF-16 buffer.
///
/// Ownership passes to the caller; release with [`utf16_free`].
pub fn utf16_into_raw(s: &str) -> *mut u16 {
    let mut buf: Vec<u16> = s.encode_utf16().collect();
    buf.push(0);
    Box::into_raw(buf.into_boxed_slice()) as *mut u16
}

/// Read a NUL-terminated UTF-16 buffer into an owned string.
///
/// Unpaired surrogates decode as the replacement character. Returns `None`
/// for the null pointer.
pub fn utf16_from_ptr(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    // Walk to the terminator; valid per the wire contract.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(ptr, len);
        Some(String::from_utf16_lossy(units))
    }
}

/// Release a buffer produced by [`utf16_into_raw`]. Null is a no-op.
pub fn utf16_free(ptr: *mut u16) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let mut len = 0usize;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            ptr,
            len + 1,
        )));
    }
}

// --- marshaling adapters --------------------------------------------------

/// Converts one value between its managed form and a boundary slot.
pub trait Marshaler: Send + Sync {
    /// Canonical managed type name the adapter produces/consumes.
    fn managed_type(&self) -> String;

    /// Managed → native.
    fn to_native(&self, value: &Value) -> BridgeResult<RawSlot>;

    /// Native → managed.
    fn from_native(&self, slot: RawSlot) -> BridgeResult<Value>;

    /// Release native-side resources a [`Marshaler::to_native`] call
    /// allocated. Default: nothing to release.
    fn cleanup_native(&self, _slot: RawSlot) {}
}

/// Object references: the slot is a reference-table handle.
///
/// Outbound always creates a new handle (the native side owns its release).
/// Inbound resolves through the table; a nonzero slot the table does not
/// know is read as a NUL-terminated UTF-16 string, so a native caller may
/// pass a literal where an object is expected.
pub struct ObjectRefMarshaler {
    refs: Arc<RefTable>,
    type_name: String,
    weak: bool,
}

impl ObjectRefMarshaler {
    /// Adapter for handles of the given declared type.
    pub fn new(refs: Arc<RefTable>, type_name: impl Into<String>, weak: bool) -> Self {
        Self {
            refs,
            type_name: type_name.into(),
            weak,
        }
    }
}

impl Marshaler for ObjectRefMarshaler {
    fn managed_type(&self) -> String {
        self.type_name.clone()
    }

    fn to_native(&self, value: &Value) -> BridgeResult<RawSlot> {
        if value.is_null() {
            return Ok(RawSlot(NULL_HANDLE));
        }
        Ok(RawSlot(self.refs.acquire(value.clone(), self.weak)))
    }

    fn from_native(&self, slot: RawSlot) -> BridgeResult<Value> {
        if slot.is_zero() {
            return Ok(Value::Null);
        }
        match self.refs.resolve(slot.0 as Handle) {
            Ok(value) => Ok(value),
            Err(BridgeError::InvalidReference) => utf16_from_ptr(slot.as_ptr::<u16>())
                .map(Value::str)
                .ok_or(BridgeError::InvalidReference),
            Err(err) => Err(err),
        }
    }
}

/// Wide strings: the slot is a pointer to a NUL-terminated UTF-16 buffer.
///
/// With `cleanup` set, buffers this adapter allocates on the outbound path
/// are released once the native call returns; otherwise the receiving side
/// owns them.
pub struct Utf16StringMarshaler {
    cleanup: bool,
}

/// Registered id of the wide-string adapter.
pub const STRING_ADAPTER_ID: &str = "tether.StringMarshaler";

impl Utf16StringMarshaler {
    /// Adapter with an explicit cleanup policy.
    pub fn new(cleanup: bool) -> Self {
        Self { cleanup }
    }

    /// Build from an adapter options cookie (`cleanup=true` /
    /// `cleanup=false`, case-insensitive; empty means no cleanup).
    pub fn from_options(options: &str) -> BridgeResult<Self> {
        let mut cleanup = false;
        for pair in options.split('&').filter(|p| !p.is_empty()) {
            let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
            if key.eq_ignore_ascii_case("cleanup") {
                cleanup = val.eq_ignore_ascii_case("true");
            } else {
                return Err(BridgeError::ArgumentInvalid(format!(
                    "unknown string adapter option '{key}'"
                )));
            }
        }
        Ok(Self { cleanup })
    }
}

impl Marshaler for Utf16StringMarshaler {
    fn managed_type(&self) -> String {
        "string".into()
    }

    fn to_native(&self, value: &Value) -> BridgeResult<RawSlot> {
        match value {
            Value::Null => Ok(RawSlot::ZERO),
            Value::Str(s) => Ok(RawSlot::from_ptr(utf16_into_raw(s))),
            other => Err(BridgeError::ArgumentInvalid(format!(
                "expected string, got {}",
                other.type_name()
            ))),
        }
    }

    fn from_native(&self, slot: RawSlot) -> BridgeResult<Value> {
        Ok(match utf16_from_ptr(slot.as_ptr::<u16>()) {
            Some(s) => Value::str(s),
            None => Value::Null,
        })
    }

    fn cleanup_native(&self, slot: RawSlot) {
        if self.cleanup {
            utf16_free(slot.as_mut_ptr::<u16>());
        }
    }
}

/// Factory producing a configured adapter from its options cookie.
pub type AdapterProvider =
    Arc<dyn Fn(&str) -> BridgeResult<Arc<dyn Marshaler>> + Send + Sync>;

/// Registry of custom marshaling adapters, keyed by adapter id.
pub struct AdapterRegistry {
    providers: DashMap<String, AdapterProvider>,
}

impl AdapterRegistry {
    /// Registry with the built-in adapters installed.
    pub fn new() -> Self {
        let registry = Self {
            providers: DashMap::new(),
        };
        registry.register(
            STRING_ADAPTER_ID,
            Arc::new(|options| {
                Ok(Arc::new(Utf16StringMarshaler::from_options(options)?) as Arc<dyn Marshaler>)
            }),
        );
        registry
    }

    /// Install (or replace) an adapter provider.
    pub fn register(&self, id: &str, provider: AdapterProvider) {
        self.providers.insert(id.into(), provider);
    }

    /// Instantiate the adapter named by a custom descriptor.
    pub fn create(&self, id: &str, options: &str) -> BridgeResult<Arc<dyn Marshaler>> {
        let provider = self
            .providers
            .get(id)
            .ok_or_else(|| BridgeError::ArgumentInvalid(format!("unknown adapter '{id}'")))?;
        provider(options)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// --- marshaling plans -----------------------------------------------------

/// Shared context a plan is compiled against.
pub struct MarshalEnv {
    /// Reference table backing object-reference slots
    pub refs: Arc<RefTable>,
    /// Custom adapter registry
    pub adapters: Arc<AdapterRegistry>,
}

enum SlotKind {
    Void,
    Prim(ParamKind),
    Adapter(Arc<dyn Marshaler>),
    Array {
        elem: ParamKind,
        adapter: Option<Arc<dyn Marshaler>>,
        len: ArrayLen,
    },
}

struct SlotPlan {
    kind: SlotKind,
    out: bool,
}

/// Compiled descriptor list: how each slot of a call crosses the boundary.
pub struct MarshalPlan {
    ret: SlotPlan,
    params: Vec<SlotPlan>,
}

fn elem_width(kind: ParamKind) -> usize {
    match kind {
        ParamKind::Bool | ParamKind::I8 | ParamKind::U8 => 1,
        ParamKind::I16 | ParamKind::U16 => 2,
        ParamKind::I32 | ParamKind::U32 | ParamKind::F32 => 4,
        _ => 8,
    }
}

/// Read array element `idx` of the given kind into a slot.
unsafe fn read_elem(kind: ParamKind, base: *const u8, idx: usize) -> RawSlot {
    let p = base.add(idx * elem_width(kind));
    RawSlot(match elem_width(kind) {
        1 => u64::from(*p),
        2 => u64::from((p as *const u16).read_unaligned()),
        4 => u64::from((p as *const u32).read_unaligned()),
        _ => (p as *const u64).read_unaligned(),
    })
}

/// Write a slot into array element `idx` of the given kind.
unsafe fn write_elem(kind: ParamKind, base: *mut u8, idx: usize, slot: RawSlot) {
    let p = base.add(idx * elem_width(kind));
    match elem_width(kind) {
        1 => *p = slot.0 as u8,
        2 => (p as *mut u16).write_unaligned(slot.0 as u16),
        4 => (p as *mut u32).write_unaligned(slot.0 as u32),
        _ => (p as *mut u64).write_unaligned(slot.0),
    }
}

fn prim_to_slot(kind: ParamKind, value: &Value) -> BridgeResult<RawSlot> {
    let mismatch = || {
        BridgeError::ArgumentInvalid(format!(
            "value of type {} does not fit parameter kind {kind:?}",
            value.type_name()
        ))
    };
    Ok(RawSlot(match (kind, value) {
        (_, Value::Null) => 0,
        (ParamKind::Bool, Value::Bool(b)) => u64::from(*b),
        (ParamKind::I8, Value::I8(v)) => *v as u8 as u64,
        (ParamKind::U8, Value::U8(v)) => u64::from(*v),
        (ParamKind::I16, Value::I16(v)) => *v as u16 as u64,
        (ParamKind::U16, Value::U16(v)) => u64::from(*v),
        (ParamKind::I32, Value::I32(v)) => *v as u32 as u64,
        (ParamKind::U32, Value::U32(v)) => u64::from(*v),
        (ParamKind::I64, Value::I64(v)) => *v as u64,
        (ParamKind::U64, Value::U64(v)) => *v,
        (ParamKind::NativeInt, Value::I64(v)) => *v as u64,
        (ParamKind::NativeUInt | ParamKind::FuncPtr, Value::U64(v)) => *v,
        (ParamKind::F32, Value::F32(v)) => u64::from(v.to_bits()),
        (ParamKind::F64, Value::F64(v)) => v.to_bits(),
        _ => return Err(mismatch()),
    }))
}

fn slot_to_prim(kind: ParamKind, slot: RawSlot) -> BridgeResult<Value> {
    Ok(match kind {
        ParamKind::Bool => Value::Bool(slot.0 & 1 == 1),
        ParamKind::I8 => Value::I8(slot.0 as u8 as i8),
        ParamKind::U8 => Value::U8(slot.0 as u8),
        ParamKind::I16 => Value::I16(slot.0 as u16 as i16),
        ParamKind::U16 => Value::U16(slot.0 as u16),
        ParamKind::I32 => Value::I32(slot.0 as u32 as i32),
        ParamKind::U32 => Value::U32(slot.0 as u32),
        ParamKind::I64 | ParamKind::NativeInt => Value::I64(slot.0 as i64),
        ParamKind::U64 | ParamKind::NativeUInt | ParamKind::FuncPtr => Value::U64(slot.0),
        ParamKind::F32 => Value::F32(f32::from_bits(slot.0 as u32)),
        ParamKind::F64 => Value::F64(f64::from_bits(slot.0)),
        other => {
            return Err(BridgeError::ArgumentInvalid(format!(
                "kind {other:?} is not a primitive"
            )))
        }
    })
}

impl MarshalPlan {
    /// Compile a descriptor list. Index 0 is the return slot; the rest are
    /// the parameters in order.
    pub fn build(descs: &[ParamDesc], env: &MarshalEnv) -> BridgeResult<MarshalPlan> {
        if descs.is_empty() {
            return Err(BridgeError::ArgumentInvalid(
                "descriptor list must at least describe the return slot".into(),
            ));
        }
        let ret = Self::compile_slot(&descs[0], true, env)?;
        let params = descs[1..]
            .iter()
            .map(|d| Self::compile_slot(d, false, env))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(MarshalPlan { ret, params })
    }

    fn compile_slot(desc: &ParamDesc, is_return: bool, env: &MarshalEnv) -> BridgeResult<SlotPlan> {
        let out = desc.is_out();
        if desc.is_void() {
            if !is_return {
                return Err(BridgeError::ArgumentInvalid(
                    "void is only valid in the return slot".into(),
                ));
            }
            return Ok(SlotPlan {
                kind: SlotKind::Void,
                out,
            });
        }
        let mut kind = desc.kind()?;
        // A descriptor may carry only a type name; map canonical primitive
        // names onto their kind, everything else crosses as an object ref.
        if kind == ParamKind::Void {
            kind = desc
                .type_name
                .as_deref()
                .and_then(ParamKind::from_canonical_name)
                .unwrap_or(ParamKind::ObjectRef);
        }
        let adapter: Option<Arc<dyn Marshaler>> = match kind {
            ParamKind::Custom => {
                let (id, options) = desc.adapter_parts()?;
                Some(env.adapters.create(id, options)?)
            }
            ParamKind::ObjectRef => Some(Arc::new(ObjectRefMarshaler::new(
                env.refs.clone(),
                desc.base_type_name()?,
                desc.is_weak_ref(),
            ))),
            ParamKind::Utf16Str => Some(Arc::new(Utf16StringMarshaler::new(true))),
            // A bare type name crosses as an object reference.
            _ if desc
                .type_name
                .as_deref()
                .map_or(false, |n| ParamKind::from_canonical_name(n).is_none()) =>
            {
                Some(Arc::new(ObjectRefMarshaler::new(
                    env.refs.clone(),
                    desc.base_type_name()?,
                    desc.is_weak_ref(),
                )))
            }
            _ => None,
        };
        let slot = match (desc.array_len(), adapter) {
            (Some(len), adapter) => SlotKind::Array {
                elem: kind,
                adapter,
                len,
            },
            (None, Some(adapter)) => SlotKind::Adapter(adapter),
            (None, None) => SlotKind::Prim(kind),
        };
        Ok(SlotPlan { kind: slot, out })
    }

    /// Managed parameter type names, for exact-signature member lookup.
    pub fn managed_param_types(&self) -> Vec<String> {
        self.params.iter().map(Self::managed_name).collect()
    }

    /// Managed return type name (`void` for none).
    pub fn managed_return_type(&self) -> String {
        Self::managed_name(&self.ret)
    }

    fn managed_name(slot: &SlotPlan) -> String {
        match &slot.kind {
            SlotKind::Void => "void".into(),
            SlotKind::Prim(kind) => kind
                .canonical_name()
                .unwrap_or("object")
                .to_string(),
            SlotKind::Adapter(adapter) => adapter.managed_type(),
            SlotKind::Array { elem, adapter, .. } => {
                let base = match adapter {
                    Some(adapter) => adapter.managed_type(),
                    None => elem.canonical_name().unwrap_or("object").to_string(),
                };
                format!("{base}[]")
            }
        }
    }

    /// Number of parameter slots.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    fn array_len(len: ArrayLen, raw: &[RawSlot]) -> BridgeResult<usize> {
        Ok(match len {
            ArrayLen::Fixed(n) => n as usize,
            ArrayLen::SizeIndex(idx) => raw
                .get(idx as usize)
                .ok_or_else(|| {
                    BridgeError::ArgumentInvalid(format!("size parameter index {idx} out of range"))
                })?
                .0 as usize,
        })
    }

    /// Native → managed: decode a native caller's argument slots.
    pub fn unmarshal_args(&self, raw: &[RawSlot]) -> BridgeResult<Vec<Value>> {
        if raw.len() != self.params.len() {
            return Err(BridgeError::ArgumentInvalid(format!(
                "expected {} arguments, got {}",
                self.params.len(),
                raw.len()
            )));
        }
        self.params
            .iter()
            .zip(raw)
            .map(|(slot, value)| self.unmarshal_slot(slot, *value, raw))
            .collect()
    }

    fn unmarshal_slot(
        &self,
        slot: &SlotPlan,
        value: RawSlot,
        raw: &[RawSlot],
    ) -> BridgeResult<Value> {
        match &slot.kind {
            SlotKind::Void => Ok(Value::Null),
            SlotKind::Prim(kind) => {
                if slot.out {
                    // Out primitives cross as a pointer to caller storage.
                    if value.is_zero() {
                        return Err(BridgeError::ArgumentInvalid(
                            "null pointer for out parameter".into(),
                        ));
                    }
                    let current = unsafe { read_elem(*kind, value.as_ptr(), 0) };
                    slot_to_prim(*kind, current)
                } else {
                    slot_to_prim(*kind, value)
                }
            }
            SlotKind::Adapter(adapter) => adapter.from_native(value),
            SlotKind::Array { elem, adapter, len } => {
                if value.is_zero() {
                    return Ok(Value::Null);
                }
                let count = Self::array_len(*len, raw)?;
                let base = value.as_ptr::<u8>();
                let mut items = Vec::with_capacity(count);
                for i in 0..count {
                    let elem_slot = unsafe { read_elem(*elem, base, i) };
                    items.push(match adapter {
                        Some(adapter) => adapter.from_native(elem_slot)?,
                        None => slot_to_prim(*elem, elem_slot)?,
                    });
                }
                let elem_type = match adapter {
                    Some(adapter) => adapter.managed_type(),
                    None => elem.canonical_name().unwrap_or("object").to_string(),
                };
                Ok(Value::array(elem_type, items))
            }
        }
    }

    /// Write out-parameter results back into the caller's storage.
    ///
    /// Only primitive and primitive-array out parameters write back;
    /// reference types already share identity with the caller.
    pub fn write_outputs(&self, values: &[Value], raw: &[RawSlot]) -> BridgeResult<()> {
        for ((slot, value), arg) in self.params.iter().zip(values).zip(raw) {
            if !slot.out || arg.is_zero() {
                continue;
            }
            match &slot.kind {
                SlotKind::Prim(kind) => {
                    let bits = prim_to_slot(*kind, value)?;
                    unsafe { write_elem(*kind, arg.as_mut_ptr(), 0, bits) };
                }
                SlotKind::Array {
                    elem,
                    adapter: None,
                    len,
                } => {
                    if let Value::Array(array) = value {
                        let capacity = Self::array_len(*len, raw)?;
                        let base = arg.as_mut_ptr::<u8>();
                        for (i, item) in array.items.iter().take(capacity).enumerate() {
                            let bits = prim_to_slot(*elem, item)?;
                            unsafe { write_elem(*elem, base, i, bits) };
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Managed → native: encode the return value for the native caller.
    ///
    /// Buffers allocated here (strings) pass to the caller, who releases
    /// them through the exported free routine.
    pub fn marshal_return(&self, value: &Value) -> BridgeResult<RawSlot> {
        match &self.ret.kind {
            SlotKind::Void => Ok(RawSlot::ZERO),
            SlotKind::Prim(kind) => prim_to_slot(*kind, value),
            // Returned strings pass ownership regardless of cleanup policy.
            SlotKind::Adapter(adapter) => adapter.to_native(value),
            SlotKind::Array { .. } => Err(BridgeError::ArgumentInvalid(
                "array returns are not part of the wire contract".into(),
            )),
        }
    }

    /// Managed → native: encode arguments for a native callback invocation.
    ///
    /// The returned [`OutboundArgs`] owns every buffer allocated along the
    /// way and releases them when dropped.
    pub fn marshal_args(&self, values: &[Value]) -> BridgeResult<OutboundArgs> {
        if values.len() != self.params.len() {
            return Err(BridgeError::ArgumentInvalid(format!(
                "expected {} arguments, got {}",
                self.params.len(),
                values.len()
            )));
        }
        let mut out = OutboundArgs {
            slots: Vec::with_capacity(values.len()),
            cleanups: Vec::new(),
            arrays: Vec::new(),
        };
        for (slot, value) in self.params.iter().zip(values) {
            let raw = match &slot.kind {
                SlotKind::Void => RawSlot::ZERO,
                SlotKind::Prim(kind) => prim_to_slot(*kind, value)?,
                SlotKind::Adapter(adapter) => {
                    let raw = adapter.to_native(value)?;
                    out.cleanups.push((adapter.clone(), raw));
                    raw
                }
                SlotKind::Array { elem, adapter, .. } => match value {
                    Value::Null => RawSlot::ZERO,
                    Value::Array(array) => {
                        let width = elem_width(*elem);
                        let mut buf = vec![0u8; array.items.len() * width].into_boxed_slice();
                        for (i, item) in array.items.iter().enumerate() {
                            let bits = match adapter {
                                Some(adapter) => {
                                    let raw = adapter.to_native(item)?;
                                    out.cleanups.push((adapter.clone(), raw));
                                    raw
                                }
                                None => prim_to_slot(*elem, item)?,
                            };
                            unsafe { write_elem(*elem, buf.as_mut_ptr(), i, bits) };
                        }
                        let raw = RawSlot::from_ptr(buf.as_ptr());
                        out.arrays.push(buf);
                        raw
                    }
                    other => {
                        return Err(BridgeError::ArgumentInvalid(format!(
                            "expected array, got {}",
                            other.type_name()
                        )))
                    }
                },
            };
            out.slots.push(raw);
        }
        Ok(out)
    }

    /// Native → managed: decode a native callback's return slot.
    ///
    /// The native side keeps ownership of any buffer the slot points at.
    pub fn unmarshal_return(&self, slot: RawSlot) -> BridgeResult<Value> {
        match &self.ret.kind {
            SlotKind::Void => Ok(Value::Null),
            SlotKind::Prim(kind) => slot_to_prim(*kind, slot),
            SlotKind::Adapter(adapter) => adapter.from_native(slot),
            SlotKind::Array { .. } => Err(BridgeError::ArgumentInvalid(
                "array returns are not part of the wire contract".into(),
            )),
        }
    }
}

/// Argument slots marshaled for a native callback, plus the buffers they
/// borrow. Dropping releases everything the bridge allocated.
pub struct OutboundArgs {
    slots: Vec<RawSlot>,
    cleanups: Vec<(Arc<dyn Marshaler>, RawSlot)>,
    arrays: Vec<Box<[u8]>>,
}

impl OutboundArgs {
    /// The marshaled argument slots.
    pub fn slots(&self) -> &[RawSlot] {
        &self.slots
    }
}

impl Drop for OutboundArgs {
    fn drop(&mut self) {
        for (adapter, slot) in self.cleanups.drain(..) {
            adapter.cleanup_native(slot);
        }
        self.arrays.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_runtime::object::{ClassBuilder, Instance};

    fn env() -> MarshalEnv {
        MarshalEnv {
            refs: Arc::new(RefTable::new()),
            adapters: Arc::new(AdapterRegistry::new()),
        }
    }

    fn plan(descs: &[ParamDesc], env: &MarshalEnv) -> MarshalPlan {
        MarshalPlan::build(descs, env).expect("plan")
    }

    #[test]
    fn test_utf16_roundtrip() {
        let ptr = utf16_into_raw("héllo ∞");
        assert_eq!(utf16_from_ptr(ptr).expect("read"), "héllo ∞");
        utf16_free(ptr);
        assert!(utf16_from_ptr(std::ptr::null()).is_none());
    }

    #[test]
    fn test_prim_args_roundtrip() {
        let env = env();
        let plan = plan(
            &[
                ParamDesc::of_kind(ParamKind::F64),
                ParamDesc::of_kind(ParamKind::I32).input(),
                ParamDesc::of_kind(ParamKind::Bool).input(),
            ],
            &env,
        );
        let args = plan
            .unmarshal_args(&[RawSlot(-5i32 as u32 as u64), RawSlot(1)])
            .expect("args");
        assert!(matches!(args[0], Value::I32(-5)));
        assert!(matches!(args[1], Value::Bool(true)));
        let ret = plan.marshal_return(&Value::F64(2.5)).expect("ret");
        assert_eq!(f64::from_bits(ret.0), 2.5);
    }

    #[test]
    fn test_string_arg_and_return() {
        let env = env();
        let plan = plan(&[ParamDesc::string(), ParamDesc::string().input()], &env);
        let buf = utf16_into_raw("in");
        let args = plan.unmarshal_args(&[RawSlot::from_ptr(buf)]).expect("args");
        assert_eq!(args[0].as_str(), Some("in"));
        utf16_free(buf);

        let ret = plan.marshal_return(&Value::str("out")).expect("ret");
        assert_eq!(utf16_from_ptr(ret.as_ptr()).expect("read"), "out");
        utf16_free(ret.as_mut_ptr());
    }

    #[test]
    fn test_object_handle_roundtrip_creates_new_handle() {
        let env = env();
        let plan = plan(&[ParamDesc::object_ref(), ParamDesc::named("t.A").input()], &env);
        let inst = Value::Object(Instance::new(ClassBuilder::new("t.A").build()));
        let ret = plan.marshal_return(&inst).expect("handle");
        assert_ne!(ret.0, NULL_HANDLE);
        let again = plan.marshal_return(&inst).expect("handle");
        assert_ne!(ret.0, again.0);

        let back = plan.unmarshal_args(&[ret]).expect("args");
        assert!(back[0].identity_eq(&inst));
    }

    #[test]
    fn test_unknown_handle_reads_as_string() {
        let env = env();
        let plan = plan(&[ParamDesc::void(), ParamDesc::object_ref().input()], &env);
        let buf = utf16_into_raw("literal");
        let args = plan.unmarshal_args(&[RawSlot::from_ptr(buf)]).expect("args");
        assert_eq!(args[0].as_str(), Some("literal"));
        utf16_free(buf);
    }

    #[test]
    fn test_out_prim_writeback() {
        let env = env();
        let plan = plan(
            &[
                ParamDesc::void(),
                ParamDesc::of_kind(ParamKind::I32).output(),
            ],
            &env,
        );
        let mut cell: i32 = 3;
        let raw = [RawSlot::from_ptr(&mut cell as *mut i32)];
        let mut args = plan.unmarshal_args(&raw).expect("args");
        assert!(matches!(args[0], Value::I32(3)));
        args[0] = Value::I32(42);
        plan.write_outputs(&args, &raw).expect("writeback");
        assert_eq!(cell, 42);
    }

    #[test]
    fn test_array_with_size_index() {
        let env = env();
        let plan = plan(
            &[
                ParamDesc::void(),
                ParamDesc::of_kind(ParamKind::I32).input().array_sized_by(1),
                ParamDesc::of_kind(ParamKind::I32).input(),
            ],
            &env,
        );
        let data = [10i32, 20, 30];
        let raw = [RawSlot::from_ptr(data.as_ptr()), RawSlot(3)];
        let args = plan.unmarshal_args(&raw).expect("args");
        let array = match &args[0] {
            Value::Array(a) => a,
            other => panic!("expected array, got {other:?}"),
        };
        assert_eq!(array.elem_type, "i32");
        assert_eq!(array.items.len(), 3);
        assert!(matches!(array.items[2], Value::I32(30)));
    }

    #[test]
    fn test_fixed_out_array_writeback() {
        let env = env();
        let plan = plan(
            &[
                ParamDesc::void(),
                ParamDesc::of_kind(ParamKind::U8).output().array_fixed(4),
            ],
            &env,
        );
        let mut buf = [0u8; 4];
        let raw = [RawSlot::from_ptr(buf.as_mut_ptr())];
        let values = vec![Value::array(
            "u8",
            vec![Value::U8(1), Value::U8(2), Value::U8(3), Value::U8(4)],
        )];
        plan.write_outputs(&values, &raw).expect("writeback");
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_callback_args_release_buffers() {
        let env = env();
        let plan = plan(&[ParamDesc::void(), ParamDesc::string().input()], &env);
        let out = plan.marshal_args(&[Value::str("transient")]).expect("out");
        let slot = out.slots()[0];
        assert_eq!(utf16_from_ptr(slot.as_ptr()).expect("live"), "transient");
        drop(out);
    }

    #[test]
    fn test_managed_signature_names() {
        let env = env();
        let plan = plan(
            &[
                ParamDesc::named("foolib.Foo"),
                ParamDesc::string().input(),
                ParamDesc::of_kind(ParamKind::I32).input().array_fixed(2),
                ParamDesc::custom(STRING_ADAPTER_ID).input(),
            ],
            &env,
        );
        assert_eq!(plan.managed_return_type(), "foolib.Foo");
        assert_eq!(
            plan.managed_param_types(),
            vec!["string", "i32[]", "string"]
        );
    }

    #[test]
    fn test_string_adapter_options() {
        assert!(Utf16StringMarshaler::from_options("").is_ok());
        assert!(Utf16StringMarshaler::from_options("CLEANUP=TRUE").is_ok());
        assert!(Utf16StringMarshaler::from_options("mystery=1").is_err());
    }

    #[test]
    fn test_void_only_in_return_slot() {
        let env = env();
        assert!(MarshalPlan::build(&[ParamDesc::void(), ParamDesc::void()], &env).is_err());
    }
}
