//! Bridge error types.

use polyglot_hostapi::{DecodingError, Exception, HostError};
use wasmtime::Trap;

/// Top-level error type for the bridge crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Wasmtime engine, compilation, or instantiation error.
    #[error("wasmtime error: {0}")]
    Wasmtime(#[from] anyhow::Error),

    /// Module validation failed (missing memory, bad imports, etc.).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A named guest export does not exist or is not a function.
    #[error("missing export: {0}")]
    MissingExport(String),

    /// Memory operation failed.
    #[error("memory error: {0}")]
    MemoryError(String),

    /// Fuel exhausted during execution.
    #[error("fuel exhausted (instruction limit)")]
    FuelExhausted,

    /// Guest trapped, or a host defect unwound the guest.
    #[error("guest trapped: {0}")]
    GuestTrapped(String),

    /// An exception reached the embedder with no guest frame to catch it.
    #[error("{0}")]
    Uncaught(Exception),

    /// A promise the embedder waited on was rejected.
    #[error("promise rejected: {}", .0.message())]
    Rejected(Exception),

    /// A promise the embedder waited on has not settled.
    #[error("promise still pending")]
    StillPending,

    /// A microtask drain exceeded its job budget.
    #[error("microtask limit of {0} jobs exceeded")]
    MicrotaskLimit(usize),

    /// A guest returned a value of the wrong kind.
    #[error("unexpected value: {0}")]
    UnexpectedValue(String),

    /// Guest text was not valid UTF-8.
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),
}

impl BridgeError {
    /// Classify an error returned by a wasmtime call.
    ///
    /// Fuel exhaustion → `FuelExhausted`
    /// Other traps and host defects → `GuestTrapped`
    pub fn from_trap(err: anyhow::Error) -> Self {
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => BridgeError::FuelExhausted,
            _ => BridgeError::GuestTrapped(err.root_cause().to_string()),
        }
    }
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Thrown(exception) => BridgeError::Uncaught(exception),
            HostError::Trap(err) => BridgeError::from_trap(err),
        }
    }
}
