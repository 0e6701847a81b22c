//! Host value model.
//!
//! Everything the guest can hold a handle to is a [`HostValue`]. Values are
//! tagged so the marshaling layer dispatches on the variant instead of probing
//! types at runtime. Objects and functions are reference counted and compare
//! by identity. Strings are UTF-16 code unit sequences, the way the host
//! runtime stores text.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Exception, HostResult};
use crate::promise::PromiseCell;
use crate::traits::HostContext;

// ── Strings ──

/// Immutable host string: a sequence of UTF-16 code units.
///
/// Lone surrogates are representable (the host allows them); they only
/// become U+FFFD when the string is encoded to UTF-8 for the guest.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct HostString(Rc<[u16]>);

impl HostString {
    /// Build a string from raw code units.
    pub fn from_units(units: impl Into<Rc<[u16]>>) -> Self {
        Self(units.into())
    }

    /// The code units of this string.
    pub fn units(&self) -> &[u16] {
        &self.0
    }

    /// Length in code units (not bytes, not chars).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_ascii(&self) -> bool {
        self.0.iter().all(|&unit| unit <= 0x7f)
    }

    /// Convert to a Rust string, replacing lone surrogates with U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for HostString {
    fn from(text: &str) -> Self {
        Self(text.encode_utf16().collect::<Vec<u16>>().into())
    }
}

impl From<String> for HostString {
    fn from(text: String) -> Self {
        Self::from(text.as_str())
    }
}

impl PartialEq<str> for HostString {
    fn eq(&self, other: &str) -> bool {
        self.0.iter().copied().eq(other.encode_utf16())
    }
}

impl PartialEq<&str> for HostString {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl fmt::Display for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

// ── Values ──

/// A value living on the host side of the boundary.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(HostString),
    Object(HostObject),
    Function(HostFunction),
}

impl HostValue {
    pub fn string(text: impl Into<HostString>) -> Self {
        Self::String(text.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// `undefined` or `null`.
    pub fn is_like_none(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// True for objects only; functions and `null` are not objects here.
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&HostString> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The host runtime's `typeof` for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null | Self::Object(_) => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Function(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(text) => !text.is_empty(),
            Self::Object(_) | Self::Function(_) => true,
        }
    }

    /// Numeric coercion (ToNumber).
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::String(text) => {
                let text = text.to_string_lossy();
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Self::Object(_) | Self::Function(_) => f64::NAN,
        }
    }

    /// ToInt32: truncate, then wrap modulo 2^32.
    pub fn to_int32(&self) -> i32 {
        self.to_uint32() as i32
    }

    /// ToUint32: truncate, then wrap modulo 2^32.
    pub fn to_uint32(&self) -> u32 {
        let n = self.to_number();
        if !n.is_finite() {
            return 0;
        }
        n.trunc().rem_euclid(4_294_967_296.0) as u32
    }

    /// Strict equality: primitives by value, objects and functions by identity.
    pub fn strict_equals(&self, other: &HostValue) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// JSON projection. Fails only on cyclic object graphs.
    pub fn to_json(&self) -> Result<serde_json::Value, JsonCycle> {
        let mut seen = Vec::new();
        json_of(self, &mut seen)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for HostValue {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for HostValue {
    fn from(text: &str) -> Self {
        Self::String(text.into())
    }
}

impl From<String> for HostValue {
    fn from(text: String) -> Self {
        Self::String(text.into())
    }
}

impl From<HostString> for HostValue {
    fn from(text: HostString) -> Self {
        Self::String(text)
    }
}

impl From<HostObject> for HostValue {
    fn from(object: HostObject) -> Self {
        Self::Object(object)
    }
}

impl From<HostFunction> for HostValue {
    fn from(function: HostFunction) -> Self {
        Self::Function(function)
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&debug_string(self))
    }
}

// ── Objects ──

/// Storage behind an object, chosen at construction.
pub enum ObjectKind {
    Plain,
    Array(RefCell<Vec<HostValue>>),
    /// `Uint8Array` contents, copied out of guest memory.
    Bytes(RefCell<Vec<u8>>),
    /// `Uint32Array` contents, copied out of guest memory.
    Words32(RefCell<Vec<u32>>),
    Error { name: String, message: String },
    Promise(PromiseCell),
}

struct ObjectData {
    class: String,
    kind: ObjectKind,
    props: RefCell<BTreeMap<String, HostValue>>,
}

/// Reference-counted host object. Clones share identity.
#[derive(Clone)]
pub struct HostObject(Rc<ObjectData>);

impl HostObject {
    pub fn new(class: impl Into<String>, kind: ObjectKind) -> Self {
        Self(Rc::new(ObjectData {
            class: class.into(),
            kind,
            props: RefCell::new(BTreeMap::new()),
        }))
    }

    pub fn plain() -> Self {
        Self::new("Object", ObjectKind::Plain)
    }

    /// A plain object tagged with a host class name (for instance-of checks).
    pub fn with_class(class: impl Into<String>) -> Self {
        Self::new(class, ObjectKind::Plain)
    }

    pub fn array(values: Vec<HostValue>) -> Self {
        Self::new("Array", ObjectKind::Array(RefCell::new(values)))
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Self::new("Uint8Array", ObjectKind::Bytes(RefCell::new(data)))
    }

    pub fn words32(data: Vec<u32>) -> Self {
        Self::new("Uint32Array", ObjectKind::Words32(RefCell::new(data)))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            name.clone(),
            ObjectKind::Error {
                name,
                message: message.into(),
            },
        )
    }

    pub fn promise() -> Self {
        Self::new("Promise", ObjectKind::Promise(PromiseCell::default()))
    }

    pub fn class_name(&self) -> &str {
        &self.0.class
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    pub fn is_error(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Error { .. })
    }

    pub fn as_promise(&self) -> Option<&PromiseCell> {
        match &self.0.kind {
            ObjectKind::Promise(cell) => Some(cell),
            _ => None,
        }
    }

    /// Property lookup. Built-in properties of the object kind come first.
    pub fn get(&self, key: &str) -> HostValue {
        match (&self.0.kind, key) {
            (ObjectKind::Error { name, .. }, "name") => return name.as_str().into(),
            (ObjectKind::Error { message, .. }, "message") => return message.as_str().into(),
            (ObjectKind::Array(values), "length") => return (values.borrow().len() as u32).into(),
            (ObjectKind::Bytes(data), "length" | "byteLength") => {
                return (data.borrow().len() as u32).into()
            }
            (ObjectKind::Words32(data), "length") => return (data.borrow().len() as u32).into(),
            _ => {}
        }
        if let Ok(index) = key.parse::<usize>() {
            if let Some(value) = self.element(index) {
                return value;
            }
        }
        self.0.props.borrow().get(key).cloned().unwrap_or_default()
    }

    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        self.0.props.borrow_mut().insert(key.into(), value);
    }

    /// Append to an array. Returns the new length, `None` for non-arrays.
    pub fn push(&self, value: HostValue) -> Option<u32> {
        match &self.0.kind {
            ObjectKind::Array(values) => {
                let mut values = values.borrow_mut();
                values.push(value);
                Some(values.len() as u32)
            }
            _ => None,
        }
    }

    /// Indexed element of an array-like object.
    pub fn element(&self, index: usize) -> Option<HostValue> {
        match &self.0.kind {
            ObjectKind::Array(values) => values.borrow().get(index).cloned(),
            ObjectKind::Bytes(data) => data.borrow().get(index).map(|&b| u32::from(b).into()),
            ObjectKind::Words32(data) => data.borrow().get(index).map(|&w| w.into()),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&debug_string(&HostValue::Object(self.clone())))
    }
}

// ── Functions ──

/// Signature of a native host callable: `(cx, this, args) -> result`.
pub type NativeFn = dyn Fn(&mut dyn HostContext, &HostValue, &[HostValue]) -> HostResult<HostValue>;

/// "Release one reference" hook attached to closure wrappers.
pub type ReleaseFn = dyn Fn(&mut dyn HostContext) -> HostResult<()>;

struct FunctionData {
    name: String,
    call: Box<NativeFn>,
    release: Option<Box<ReleaseFn>>,
}

/// Reference-counted host callable. Clones share identity.
#[derive(Clone)]
pub struct HostFunction(Rc<FunctionData>);

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(&mut dyn HostContext, &HostValue, &[HostValue]) -> HostResult<HostValue> + 'static,
    {
        Self(Rc::new(FunctionData {
            name: name.into(),
            call: Box::new(call),
            release: None,
        }))
    }

    /// A callable that also exposes an explicit release operation.
    pub fn releasable<F, R>(name: impl Into<String>, call: F, release: R) -> Self
    where
        F: Fn(&mut dyn HostContext, &HostValue, &[HostValue]) -> HostResult<HostValue> + 'static,
        R: Fn(&mut dyn HostContext) -> HostResult<()> + 'static,
    {
        Self(Rc::new(FunctionData {
            name: name.into(),
            call: Box::new(call),
            release: Some(Box::new(release)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn call(
        &self,
        cx: &mut dyn HostContext,
        this: &HostValue,
        args: &[HostValue],
    ) -> HostResult<HostValue> {
        (self.0.call)(cx, this, args)
    }

    pub fn is_releasable(&self) -> bool {
        self.0.release.is_some()
    }

    /// Drop one reference held by the caller. Plain functions throw a
    /// `TypeError`, as calling a missing method would.
    pub fn release(&self, cx: &mut dyn HostContext) -> HostResult<()> {
        match &self.0.release {
            Some(release) => release(cx),
            None => Err(Exception::type_error(format!(
                "{} is not a releasable closure",
                debug_string(&HostValue::Function(self.clone()))
            ))
            .into()),
        }
    }

    pub fn downgrade(&self) -> WeakFunction {
        WeakFunction(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&debug_string(&HostValue::Function(self.clone())))
    }
}

/// Weak reference to a [`HostFunction`], used by finalization registries.
#[derive(Clone)]
pub struct WeakFunction(Weak<FunctionData>);

impl WeakFunction {
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<HostFunction> {
        self.0.upgrade().map(HostFunction)
    }
}

// ── Debug rendering ──

/// Error returned by [`HostValue::to_json`] for cyclic object graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("converting circular structure to JSON")]
pub struct JsonCycle;

/// Render a number the way the host runtime prints it.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == 0.0 {
        "0".into()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// Human-readable rendering of any host value.
pub fn debug_string(value: &HostValue) -> String {
    match value {
        HostValue::Undefined => "undefined".into(),
        HostValue::Null => "null".into(),
        HostValue::Bool(b) => b.to_string(),
        HostValue::Number(n) => format_number(*n),
        HostValue::String(text) => format!("\"{}\"", text),
        HostValue::Function(function) => {
            if function.name().is_empty() {
                "Function".into()
            } else {
                format!("Function({})", function.name())
            }
        }
        HostValue::Object(object) => match object.kind() {
            ObjectKind::Array(values) => {
                let items: Vec<String> = values.borrow().iter().map(debug_string).collect();
                format!("[{}]", items.join(", "))
            }
            ObjectKind::Error { name, message } => format!("{}: {}", name, message),
            ObjectKind::Plain if object.class_name() == "Object" => match value.to_json() {
                Ok(json) => format!("Object({})", json),
                Err(JsonCycle) => "Object".into(),
            },
            _ => object.class_name().to_string(),
        },
    }
}

fn json_number(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn json_of(value: &HostValue, seen: &mut Vec<*const ()>) -> Result<serde_json::Value, JsonCycle> {
    use serde_json::Value;

    let object = match value {
        HostValue::Undefined | HostValue::Null | HostValue::Function(_) => return Ok(Value::Null),
        HostValue::Bool(b) => return Ok(Value::Bool(*b)),
        HostValue::Number(n) => return Ok(json_number(*n)),
        HostValue::String(text) => return Ok(Value::String(text.to_string_lossy())),
        HostValue::Object(object) => object,
    };

    if seen.contains(&object.addr()) {
        return Err(JsonCycle);
    }
    seen.push(object.addr());

    let json = match object.kind() {
        ObjectKind::Array(values) => {
            let values = values.borrow().clone();
            let mut items = Vec::with_capacity(values.len());
            for item in &values {
                items.push(json_of(item, seen)?);
            }
            Value::Array(items)
        }
        ObjectKind::Bytes(data) => indexed_json(data.borrow().iter().map(|&b| u64::from(b))),
        ObjectKind::Words32(data) => indexed_json(data.borrow().iter().map(|&w| u64::from(w))),
        ObjectKind::Plain | ObjectKind::Error { .. } | ObjectKind::Promise(_) => {
            let props = object.0.props.borrow().clone();
            let mut map = serde_json::Map::new();
            for (key, item) in &props {
                if item.is_undefined() || item.is_function() {
                    continue;
                }
                map.insert(key.clone(), json_of(item, seen)?);
            }
            Value::Object(map)
        }
    };

    seen.pop();
    Ok(json)
}

fn indexed_json(items: impl Iterator<Item = u64>) -> serde_json::Value {
    let map = items
        .enumerate()
        .map(|(i, item)| (i.to_string(), serde_json::Value::from(item)))
        .collect();
    serde_json::Value::Object(map)
}
