//! `polyglot-hostapi`: host-side value model and traits for the call bridge.
//!
//! This crate defines everything host code needs to talk to a guest without
//! knowing about the wasm runtime:
//!
//! - `HostValue`: tagged host values (strings, numbers, objects, functions)
//! - `PromiseCell`: the promise state machine
//! - `HostEnum` / `host_enum!`: string enum tables
//! - `Signature`: marshaling descriptions for imported functions
//! - `HostContext` trait: handle table and guest entry points, as seen by host code
//! - `HostError`: thrown exceptions versus traps

pub mod enums;
pub mod error;
pub mod promise;
pub mod traits;
pub mod types;
pub mod value;

// Re-export commonly used types at the crate root.
pub use enums::{EnumTable, HostEnum};
pub use error::{DecodingError, Exception, HostError, HostResult};
pub use promise::{PromiseCell, PromiseState, Reaction, Settlement};
pub use traits::{HostContext, Job};
pub use types::{Param, Ret, Signature, WasmType};
pub use value::{
    debug_string, HostFunction, HostObject, HostString, HostValue, JsonCycle, ObjectKind,
    WeakFunction,
};
