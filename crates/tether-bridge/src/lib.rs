//! Bridging engine between native callers and the managed object runtime
//!
//! Native code supplies type and member names plus a marshaling descriptor
//! list at run time; this crate resolves the member, builds a trampoline
//! whose native-facing shape is the fixed export convention, and manages the
//! lifetime of every managed value the native side touches through an
//! opaque handle table.
//!
//! Components:
//! - [`refs`]: handle table with strong/weak aliasing
//! - [`param`]: 64-bit parameter descriptors
//! - [`marshal`]: boundary slots and marshaling adapters
//! - [`resolver`]: member resolution and trampoline caches
//! - [`codegen`]: trampoline, safe-wrapper, and interface-proxy builders
//! - [`events`]: event relays forwarding managed events to native callbacks
//! - [`bridge`]: the [`Bridge`] context owning all shared tables

#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod codegen;
pub mod events;
pub mod marshal;
pub mod param;
pub mod refs;
pub mod resolver;

pub use bridge::{Bridge, BridgeOptions, BridgeStats};
pub use codegen::{NativeCleanupFn, NativeMethodFn, Trampoline};
pub use events::NativeEventFn;
pub use marshal::{
    utf16_free, utf16_from_ptr, utf16_into_raw, AdapterProvider, AdapterRegistry, MarshalPlan,
    Marshaler, RawSlot, STRING_ADAPTER_ID,
};
pub use param::{ArrayLen, ParamDesc, ParamKind};
pub use refs::{Handle, RefTable, NULL_HANDLE};

use tether_runtime::Fault;

/// Errors raised while servicing bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The declaring type name could not be resolved
    #[error("type '{0}' not found")]
    TypeNotFound(String),

    /// No member with an exactly matching signature exists
    #[error("member '{0}' not found")]
    MemberNotFound(String),

    /// Unknown or already released handle
    #[error("invalid object reference")]
    InvalidReference,

    /// The handle's target has been reclaimed (weak reference died)
    #[error("object reference target has been disposed")]
    Disposed,

    /// Malformed descriptor list or argument
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    /// Assembly could not be loaded by any probe
    #[error("assembly '{0}' could not be loaded")]
    AssemblyLoadFailed(String),

    /// Fault propagated from a managed member on the unsafe call path
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl BridgeError {
    /// Convert into a managed-side fault (used when capturing bridge errors
    /// on the safe call path).
    pub fn into_fault(self) -> Fault {
        match self {
            BridgeError::Fault(fault) => fault,
            other => Fault::new(other.to_string()),
        }
    }
}

/// Bridge operation result.
pub type BridgeResult<T> = Result<T, BridgeError>;
