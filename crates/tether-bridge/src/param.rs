//! Parameter descriptors
//!
//! A descriptor is a compact specification of how one value crosses the
//! native/managed boundary. Descriptor lists always describe the return
//! slot at index 0 (or the void sentinel), followed by the parameters in
//! order.
//!
//! Binary layout of the info word:
//!
//! ```text
//! 63......................32 31...........16 15............0
//! |----- ARRAY LENGTH ------|---- FLAGS ----|---- KIND ----|
//! ```

use crate::{BridgeError, BridgeResult};

const KIND_OFFSET: u32 = 0;
const KIND_BITS: u32 = 16;
const FLAGS_OFFSET: u32 = 16;
const FLAG_IN: u32 = 0;
const FLAG_OUT: u32 = 1;
const FLAG_ARRAY: u32 = 2;
const FLAG_FIXED_LENGTH: u32 = 3;
const FLAG_WEAK_REF: u32 = 4;
const LENGTH_OFFSET: u32 = 32;

fn mask(value: u64, bits: u32) -> u64 {
    value & ((1u64 << bits) - 1)
}

fn flag(value: u64, bit: u32) -> bool {
    (value >> bit) & 1 == 1
}

/// Native representation kind of one parameter or return slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ParamKind {
    /// Void sentinel (return slot only)
    Void = 0,
    /// Boolean (one slot, 0/1)
    Bool = 1,
    /// Signed 8-bit integer
    I8 = 2,
    /// Unsigned 8-bit integer
    U8 = 3,
    /// Signed 16-bit integer
    I16 = 4,
    /// Unsigned 16-bit integer
    U16 = 5,
    /// Signed 32-bit integer
    I32 = 6,
    /// Unsigned 32-bit integer
    U32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// Unsigned 64-bit integer
    U64 = 9,
    /// 32-bit float
    F32 = 10,
    /// 64-bit float
    F64 = 11,
    /// Pointer-sized signed integer
    NativeInt = 12,
    /// Pointer-sized unsigned integer
    NativeUInt = 13,
    /// NUL-terminated UTF-16 buffer
    Utf16Str = 14,
    /// Opaque function pointer, passed through unchanged
    FuncPtr = 15,
    /// Named custom marshaling adapter (adapter id in the type name)
    Custom = 16,
    /// Reference-table handle (the object-reference adapter)
    ObjectRef = 0xFFFF,
}

impl ParamKind {
    /// Decode a kind from the low bits of an info word. Unknown values
    /// decode as `None`.
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => ParamKind::Void,
            1 => ParamKind::Bool,
            2 => ParamKind::I8,
            3 => ParamKind::U8,
            4 => ParamKind::I16,
            5 => ParamKind::U16,
            6 => ParamKind::I32,
            7 => ParamKind::U32,
            8 => ParamKind::I64,
            9 => ParamKind::U64,
            10 => ParamKind::F32,
            11 => ParamKind::F64,
            12 => ParamKind::NativeInt,
            13 => ParamKind::NativeUInt,
            14 => ParamKind::Utf16Str,
            15 => ParamKind::FuncPtr,
            16 => ParamKind::Custom,
            0xFFFF => ParamKind::ObjectRef,
            _ => return None,
        })
    }

    /// Canonical runtime type name of a primitive kind.
    pub fn canonical_name(self) -> Option<&'static str> {
        Some(match self {
            ParamKind::Void => "void",
            ParamKind::Bool => "bool",
            ParamKind::I8 => "i8",
            ParamKind::U8 => "u8",
            ParamKind::I16 => "i16",
            ParamKind::U16 => "u16",
            ParamKind::I32 => "i32",
            ParamKind::U32 => "u32",
            ParamKind::I64 => "i64",
            ParamKind::U64 => "u64",
            ParamKind::F32 => "f32",
            ParamKind::F64 => "f64",
            ParamKind::NativeInt => "isize",
            ParamKind::NativeUInt | ParamKind::FuncPtr => "usize",
            ParamKind::Utf16Str => "string",
            ParamKind::ObjectRef => "object",
            ParamKind::Custom => return None,
        })
    }

    /// Look up a primitive kind by canonical type name.
    pub fn from_canonical_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => ParamKind::Void,
            "bool" => ParamKind::Bool,
            "i8" => ParamKind::I8,
            "u8" => ParamKind::U8,
            "i16" => ParamKind::I16,
            "u16" => ParamKind::U16,
            "i32" => ParamKind::I32,
            "u32" => ParamKind::U32,
            "i64" => ParamKind::I64,
            "u64" => ParamKind::U64,
            "f32" => ParamKind::F32,
            "f64" => ParamKind::F64,
            "isize" => ParamKind::NativeInt,
            "usize" => ParamKind::NativeUInt,
            "string" => ParamKind::Utf16Str,
            _ => return None,
        })
    }
}

/// Array length binding for an array descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayLen {
    /// Length fixed in the descriptor
    Fixed(u32),
    /// Length read from the integer parameter at this zero-based index
    SizeIndex(u32),
}

/// Information describing one parameter or return slot.
///
/// Structural equality (`PartialEq`/`Hash`) covers the encoded info word
/// and the type name; two descriptor lists are equivalent iff they have
/// the same length and pairwise equal descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParamDesc {
    /// Optional fully-qualified type name or custom adapter id
    pub type_name: Option<String>,
    /// Packed kind/flags/length word
    pub info: u64,
}

impl ParamDesc {
    /// The void return sentinel.
    pub fn void() -> Self {
        Self {
            type_name: None,
            info: 0,
        }
    }

    /// Descriptor for a primitive kind.
    pub fn of_kind(kind: ParamKind) -> Self {
        Self {
            type_name: None,
            info: mask(kind as u64, KIND_BITS) << KIND_OFFSET,
        }
    }

    /// Descriptor naming a managed type, crossing as an object reference.
    pub fn named(type_name: &str) -> Self {
        Self {
            type_name: Some(type_name.into()),
            info: 0,
        }
    }

    /// Object-reference descriptor without a declared type.
    pub fn object_ref() -> Self {
        Self::of_kind(ParamKind::ObjectRef)
    }

    /// Wide-string descriptor.
    pub fn string() -> Self {
        Self::of_kind(ParamKind::Utf16Str)
    }

    /// Descriptor naming a custom marshaling adapter, with optional
    /// adapter options after `?` (e.g. `tether.StringMarshaler?cleanup=true`).
    pub fn custom(adapter: &str) -> Self {
        Self {
            type_name: Some(adapter.into()),
            info: mask(ParamKind::Custom as u64, KIND_BITS) << KIND_OFFSET,
        }
    }

    /// Reconstruct a descriptor from its raw parts (FFI decode path).
    pub fn from_raw(type_name: Option<String>, info: u64) -> Self {
        Self { type_name, info }
    }

    fn with_flag(mut self, bit: u32) -> Self {
        self.info |= 1 << (FLAGS_OFFSET + bit);
        self
    }

    /// Mark as an in-parameter.
    pub fn input(self) -> Self {
        self.with_flag(FLAG_IN)
    }

    /// Mark as an out-parameter.
    pub fn output(self) -> Self {
        self.with_flag(FLAG_OUT)
    }

    /// Mark as a weak object reference.
    pub fn weak(self) -> Self {
        self.with_flag(FLAG_WEAK_REF)
    }

    /// Mark as a fixed-length array of the base kind.
    pub fn array_fixed(self, len: u32) -> Self {
        self.with_flag(FLAG_ARRAY)
            .with_flag(FLAG_FIXED_LENGTH)
            .with_length(len)
    }

    /// Mark as an array whose length is read from the parameter at the
    /// given zero-based index.
    pub fn array_sized_by(self, param_index: u32) -> Self {
        self.with_flag(FLAG_ARRAY).with_length(param_index)
    }

    fn with_length(mut self, len: u32) -> Self {
        self.info = (self.info & !(u64::from(u32::MAX) << LENGTH_OFFSET))
            | (u64::from(len) << LENGTH_OFFSET);
        self
    }

    /// Decoded kind. Unknown kind bits decode as an error.
    pub fn kind(&self) -> BridgeResult<ParamKind> {
        let raw = mask(self.info >> KIND_OFFSET, KIND_BITS) as u16;
        ParamKind::from_raw(raw)
            .ok_or_else(|| BridgeError::ArgumentInvalid(format!("unknown parameter kind {raw}")))
    }

    /// In flag.
    pub fn is_in(&self) -> bool {
        flag(self.info >> FLAGS_OFFSET, FLAG_IN)
    }

    /// Out flag.
    pub fn is_out(&self) -> bool {
        flag(self.info >> FLAGS_OFFSET, FLAG_OUT)
    }

    /// Array flag.
    pub fn is_array(&self) -> bool {
        flag(self.info >> FLAGS_OFFSET, FLAG_ARRAY)
    }

    /// Fixed-length flag (array length is a constant, not a size index).
    pub fn is_fixed_length(&self) -> bool {
        flag(self.info >> FLAGS_OFFSET, FLAG_FIXED_LENGTH)
    }

    /// Weak-reference flag.
    pub fn is_weak_ref(&self) -> bool {
        flag(self.info >> FLAGS_OFFSET, FLAG_WEAK_REF)
    }

    /// Raw array length / size-parameter index field.
    pub fn length_field(&self) -> u32 {
        (self.info >> LENGTH_OFFSET) as u32
    }

    /// Array length binding, if this is an array descriptor.
    pub fn array_len(&self) -> Option<ArrayLen> {
        if !self.is_array() {
            return None;
        }
        Some(if self.is_fixed_length() {
            ArrayLen::Fixed(self.length_field())
        } else {
            ArrayLen::SizeIndex(self.length_field())
        })
    }

    /// The void sentinel: no type name and kind zero.
    pub fn is_void(&self) -> bool {
        self.type_name.as_deref().map_or(true, str::is_empty)
            && mask(self.info >> KIND_OFFSET, KIND_BITS) == 0
    }

    /// Custom adapter id and options, split at `?`.
    pub fn adapter_parts(&self) -> BridgeResult<(&str, &str)> {
        let name = self
            .type_name
            .as_deref()
            .ok_or_else(|| BridgeError::ArgumentInvalid("custom descriptor without adapter id".into()))?;
        Ok(match name.split_once('?') {
            Some((id, options)) => (id, options),
            None => (name, ""),
        })
    }

    /// Managed type name this descriptor resolves to, before array suffixing.
    ///
    /// Decode order mirrors the wire contract: void sentinel, then custom
    /// adapters (resolved by the marshaling layer), then an explicit type
    /// name, then the primitive kind mapping.
    pub fn base_type_name(&self) -> BridgeResult<String> {
        if self.is_void() {
            return Ok("void".into());
        }
        let kind = self.kind()?;
        if kind == ParamKind::Custom {
            return Err(BridgeError::ArgumentInvalid(
                "custom descriptor type resolved by adapter registry".into(),
            ));
        }
        if let Some(name) = self.type_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.into());
        }
        kind.canonical_name()
            .map(str::to_string)
            .ok_or_else(|| BridgeError::ArgumentInvalid("descriptor has no type".into()))
    }
}
