//! Host-side error types for the call bridge.
//!
//! `HostError` separates the two ways a host operation can fail. A thrown
//! [`Exception`] is data: it crosses the boundary as a handle and the guest
//! decides what to do with it. A `Trap` is a protocol defect or a guest fault
//! and unwinds the whole guest stack.

use std::fmt;

use crate::value::{debug_string, HostObject, HostValue};

/// Result alias used by every host operation.
pub type HostResult<T> = Result<T, HostError>;

/// A host value in flight as a thrown exception.
///
/// Any value may be thrown, not just error objects; the value is carried
/// unchanged so the guest sees exactly what the host threw.
#[derive(Clone)]
pub struct Exception {
    value: HostValue,
}

impl Exception {
    pub fn new(value: HostValue) -> Self {
        Self { value }
    }

    /// Throw a fresh `Error` object.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(HostObject::error("Error", message).into())
    }

    /// Throw a fresh `TypeError` object.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(HostObject::error("TypeError", message).into())
    }

    /// Throw a fresh `RangeError` object.
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(HostObject::error("RangeError", message).into())
    }

    pub fn value(&self) -> &HostValue {
        &self.value
    }

    pub fn into_value(self) -> HostValue {
        self.value
    }

    /// The `message` of an error object, or a rendering of any other value.
    pub fn message(&self) -> String {
        match self.value.as_object() {
            Some(object) if object.is_error() => lossy_text(&object.get("message")),
            _ => debug_string(&self.value),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uncaught exception: {}", debug_string(&self.value))
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception({})", debug_string(&self.value))
    }
}

impl std::error::Error for Exception {}

/// Host-side error type returned by every host operation.
#[derive(Debug)]
pub enum HostError {
    /// A thrown host value, delivered to the guest's exception sink.
    Thrown(Exception),
    /// A defect or guest fault; unwinds to the embedder.
    Trap(anyhow::Error),
}

impl HostError {
    /// Create a trap from a message.
    pub fn trap(message: impl fmt::Display) -> Self {
        Self::Trap(anyhow::anyhow!("{}", message))
    }

    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap(_))
    }

    /// The thrown exception, if this is not a trap.
    pub fn into_exception(self) -> Option<Exception> {
        match self {
            Self::Thrown(exception) => Some(exception),
            Self::Trap(_) => None,
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrown(exception) => write!(f, "{}", exception),
            Self::Trap(err) => write!(f, "host trap: {}", err),
        }
    }
}

impl std::error::Error for HostError {}

impl From<Exception> for HostError {
    fn from(exception: Exception) -> Self {
        Self::Thrown(exception)
    }
}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> Self {
        Self::Trap(err)
    }
}

/// Invalid UTF-8 in a guest-supplied byte range.
///
/// Decoding is strict; the host never substitutes replacement characters
/// for malformed guest text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid utf-8 sequence: valid up to byte {valid_up_to} of {len}")]
pub struct DecodingError {
    pub valid_up_to: usize,
    pub len: usize,
}

impl From<DecodingError> for Exception {
    fn from(err: DecodingError) -> Self {
        Exception::type_error(err.to_string())
    }
}

impl From<DecodingError> for HostError {
    fn from(err: DecodingError) -> Self {
        Self::Thrown(err.into())
    }
}

fn lossy_text(value: &HostValue) -> String {
    match value {
        HostValue::String(text) => text.to_string_lossy(),
        other => debug_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_message() {
        let exn = Exception::type_error("not a function");
        assert_eq!(exn.message(), "not a function");
        assert_eq!(format!("{}", exn), "uncaught exception: TypeError: not a function");

        let exn = Exception::new(HostValue::Number(42.0));
        assert_eq!(exn.message(), "42");
    }

    #[test]
    fn test_thrown_value_is_preserved() {
        let obj = HostObject::with_class("GPUValidationError");
        let err: HostError = Exception::new(obj.clone().into()).into();
        assert!(!err.is_trap());
        let value = err.into_exception().unwrap().into_value();
        assert!(value.as_object().unwrap().ptr_eq(&obj));
    }

    #[test]
    fn test_trap_display() {
        let err = HostError::trap("closure invoked after destroy");
        assert!(err.is_trap());
        assert!(format!("{}", err).contains("closure invoked after destroy"));
        assert!(err.into_exception().is_none());
    }

    #[test]
    fn test_decoding_error_becomes_type_error() {
        let err: HostError = DecodingError { valid_up_to: 3, len: 5 }.into();
        let exn = err.into_exception().unwrap();
        let obj = exn.value().as_object().unwrap().clone();
        assert_eq!(obj.class_name(), "TypeError");
        assert!(exn.message().contains("valid up to byte 3 of 5"));
    }
}
