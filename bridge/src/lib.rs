//! `polyglot-bridge`: Wasmtime-based host/guest call bridge.
//!
//! This crate runs a guest module against host APIs that deal in rich values
//! while the guest only passes integers and memory offsets. It provides:
//!
//! - **Handles:** a slot table mapping small integers to host values
//! - **Strings and bytes:** UTF-8 marshaling through the guest allocator
//! - **Closures:** reference-counted guest callables as host functions
//! - **Promises:** guest-driven async results over a microtask queue
//! - **Exceptions:** host errors routed to the guest error sink
//! - **Limits:** bounded linear memory and optional fuel metering
//!
//! The primary entry points are [`Bridge::instantiate`] and the
//! [`GuestInstance`] it returns.

pub mod error;
pub mod config;
pub mod memory;
pub mod heap;
pub mod marshal;
pub mod host_impl;
pub mod closure;
pub mod promise;
pub mod thunk;
pub mod linker;
pub mod validation;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use heap::HeapStats;
pub use runtime::{Bridge, GuestInstance};
pub use thunk::Imports;
