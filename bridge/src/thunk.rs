//! Signature-driven import thunks.
//!
//! The embedder describes each host API the guest imports as a [`Signature`]
//! plus a body over host values. One generic dispatcher lifts the raw wasm
//! arguments, runs the body, and lowers the result, so every import follows
//! the same handle, string, and exception rules.

use std::collections::BTreeSet;
use std::sync::Arc;

use wasmtime::{AsContextMut, Caller, FuncType, Linker, Val, ValType};

use polyglot_hostapi::{
    debug_string, EnumTable, Exception, HostContext, HostError, HostObject, HostResult,
    HostValue, Param, Ret, Signature, WasmType,
};

use crate::error::BridgeError;
use crate::heap::HandleTable;
use crate::host_impl::{Cx, HostState};

/// Host side of an import.
pub type HostBody =
    dyn Fn(&mut dyn HostContext, Vec<HostValue>) -> HostResult<HostValue> + Send + Sync;

/// Builds a well-known object, once per instance.
pub type WellKnownFactory = dyn Fn() -> HostValue + Send + Sync;

/// One imported host function.
#[derive(Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub signature: Signature,
    body: Arc<HostBody>,
}

impl std::fmt::Debug for Import {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Import")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The embedder's import table.
#[derive(Clone, Default)]
pub struct Imports {
    entries: Vec<Import>,
    well_known: Vec<(u32, Arc<WellKnownFactory>)>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arbitrary import.
    pub fn func<F>(&mut self, module: &str, name: &str, signature: Signature, body: F) -> &mut Self
    where
        F: Fn(&mut dyn HostContext, Vec<HostValue>) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        self.entries.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            signature,
            body: Arc::new(body),
        });
        self
    }

    /// Call the function-valued property `method` on the receiver (first
    /// argument) with the remaining arguments.
    pub fn method(
        &mut self,
        module: &str,
        name: &str,
        method: &'static str,
        params: &[Param],
        ret: Ret,
    ) -> &mut Self {
        let mut all = vec![Param::Ref];
        all.extend_from_slice(params);
        self.func(module, name, Signature::new(all, ret), move |cx, args| {
            let receiver = args[0].clone();
            let object = receiver_object(&receiver, method)?;
            match object.get(method) {
                HostValue::Function(f) => f.call(cx, &receiver, &args[1..]),
                _ => Err(Exception::type_error(format!(
                    "{}.{} is not a function",
                    object.class_name(),
                    method
                ))
                .into()),
            }
        })
    }

    /// Read `property` from the receiver.
    pub fn getter(&mut self, module: &str, name: &str, property: &'static str, ret: Ret) -> &mut Self {
        self.func(module, name, Signature::new([Param::Ref], ret), move |_, args| {
            Ok(receiver_object(&args[0], property)?.get(property))
        })
    }

    /// Write `property` on the receiver.
    pub fn setter(&mut self, module: &str, name: &str, property: &'static str, param: Param) -> &mut Self {
        self.func(module, name, Signature::new([Param::Ref, param], Ret::Unit), move |_, mut args| {
            let value = args.pop().unwrap_or_default();
            receiver_object(&args[0], property)?.set(property, value);
            Ok(HostValue::Undefined)
        })
    }

    pub fn enum_getter(&mut self, module: &str, name: &str, property: &'static str, table: EnumTable) -> &mut Self {
        self.getter(module, name, property, Ret::Enum(table))
    }

    pub fn enum_setter(&mut self, module: &str, name: &str, property: &'static str, table: EnumTable) -> &mut Self {
        self.setter(module, name, property, Param::Enum(table))
    }

    /// Class-name check. Never throws.
    pub fn instance_of(&mut self, module: &str, name: &str, class: &'static str) -> &mut Self {
        self.func(module, name, Signature::new([Param::Ref], Ret::Bool), move |_, args| {
            let matches = args[0].as_object().is_some_and(|o| o.class_name() == class);
            Ok(matches.into())
        })
    }

    /// Install a constant object at reserved handle `index` in every instance.
    pub fn well_known<F>(&mut self, index: u32, factory: F) -> &mut Self
    where
        F: Fn() -> HostValue + Send + Sync + 'static,
    {
        self.well_known.push((index, Arc::new(factory)));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Import> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Import modules named by the entries.
    pub fn modules(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.module.clone()).collect()
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.entries.iter().any(|e| e.module == module && e.name == name)
    }

    /// Register every entry with the linker.
    pub fn define(&self, linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
        for import in &self.entries {
            let ty = FuncType::new(
                linker.engine(),
                import.signature.wasm_params().into_iter().map(val_type),
                import.signature.wasm_results().into_iter().map(val_type),
            );
            let entry = Arc::new(import.clone());
            linker.func_new(&import.module, &import.name, ty, move |caller, params, results| {
                dispatch(caller, &entry, params, results)
            })?;
        }
        Ok(())
    }

    /// Populate the reserved handle region.
    pub fn install_well_known(&self, heap: &mut HandleTable) {
        for (index, factory) in &self.well_known {
            heap.install(*index, factory());
        }
    }
}

fn receiver_object<'v>(receiver: &'v HostValue, property: &str) -> HostResult<&'v HostObject> {
    receiver.as_object().ok_or_else(|| {
        Exception::type_error(format!(
            "cannot read property '{}' of {}",
            property,
            debug_string(receiver)
        ))
        .into()
    })
}

fn val_type(ty: WasmType) -> ValType {
    match ty {
        WasmType::I32 => ValType::I32,
        WasmType::F64 => ValType::F64,
    }
}

fn zero(ty: WasmType) -> Val {
    match ty {
        WasmType::I32 => Val::I32(0),
        WasmType::F64 => Val::F64(0),
    }
}

/// Run one import call. Thrown exceptions go to the guest error sink and the
/// call returns zeros; traps unwind the guest.
fn dispatch(
    mut caller: Caller<'_, HostState>,
    import: &Import,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let mut cx = Cx::new(caller.as_context_mut());
    for (slot, ty) in results.iter_mut().zip(import.signature.wasm_results()) {
        *slot = zero(ty);
    }
    match call(&mut cx, import, params, results) {
        Ok(()) => Ok(()),
        Err(HostError::Thrown(exception)) => {
            for (slot, ty) in results.iter_mut().zip(import.signature.wasm_results()) {
                *slot = zero(ty);
            }
            tracing::trace!(module = %import.module, name = %import.name, "host import threw");
            cx.route_exception(exception)
        }
        Err(HostError::Trap(err)) => Err(err),
    }
}

fn call(cx: &mut Cx<'_>, import: &Import, params: &[Val], results: &mut [Val]) -> HostResult<()> {
    let mut raw = params.iter();
    let retptr = match import.signature.ret {
        Ret::Str => Some(next_i32(&mut raw)? as u32),
        _ => None,
    };
    let args = lift(cx, &import.signature.params, &mut raw)?;
    let value = (import.body)(cx, args)?;
    lower(cx, import.signature.ret, retptr, value, results)
}

fn next_i32(raw: &mut std::slice::Iter<'_, Val>) -> HostResult<i32> {
    match raw.next() {
        Some(Val::I32(v)) => Ok(*v),
        other => Err(HostError::trap(format!("expected i32 argument, got {:?}", other))),
    }
}

fn next_f64(raw: &mut std::slice::Iter<'_, Val>) -> HostResult<f64> {
    match raw.next() {
        Some(Val::F64(bits)) => Ok(f64::from_bits(*bits)),
        other => Err(HostError::trap(format!("expected f64 argument, got {:?}", other))),
    }
}

fn lift(cx: &mut Cx<'_>, params: &[Param], raw: &mut std::slice::Iter<'_, Val>) -> HostResult<Vec<HostValue>> {
    let mut args = Vec::with_capacity(params.len());
    for param in params {
        let value = match param {
            Param::F64 => HostValue::Number(next_f64(raw)?),
            Param::Str => {
                let (ptr, len) = (next_i32(raw)? as u32, next_i32(raw)? as u32);
                HostValue::String(cx.read_str(ptr, len)?)
            }
            Param::Bytes => {
                let (ptr, len) = (next_i32(raw)? as u32, next_i32(raw)? as u32);
                HostObject::bytes(cx.read_bytes(ptr, len)?).into()
            }
            Param::Words32 => {
                let (ptr, len) = (next_i32(raw)? as u32, next_i32(raw)? as u32);
                HostObject::words32(cx.read_words32(ptr, len)?).into()
            }
            param => {
                let v = next_i32(raw)?;
                match param {
                    Param::Ref => cx.get_ref(v as u32),
                    Param::Owned => cx.take_ref(v as u32),
                    Param::OptRef if v == 0 => HostValue::Undefined,
                    Param::OptRef => cx.get_ref(v as u32),
                    Param::I32 => HostValue::Number(f64::from(v)),
                    Param::U32 => HostValue::Number(f64::from(v as u32)),
                    Param::Bool => HostValue::Bool(v != 0),
                    Param::Enum(table) => match table.get(v as u32) {
                        Some(s) => HostValue::from(s),
                        None => {
                            return Err(Exception::type_error(format!(
                                "{} is not a valid {} index",
                                v as u32,
                                table.name()
                            ))
                            .into())
                        }
                    },
                    _ => unreachable!("wide parameters handled above"),
                }
            }
        };
        args.push(value);
    }
    Ok(args)
}

fn lower(
    cx: &mut Cx<'_>,
    ret: Ret,
    retptr: Option<u32>,
    value: HostValue,
    results: &mut [Val],
) -> HostResult<()> {
    let out = match ret {
        Ret::Unit => return Ok(()),
        Ret::Str => {
            let retptr = retptr.ok_or_else(|| HostError::trap("string return without a return pointer"))?;
            let (ptr, len) = match &value {
                v if v.is_like_none() => (0, 0),
                HostValue::String(text) => cx.pass_string(text)?,
                other => {
                    return Err(Exception::type_error(format!(
                        "expected a string, got {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            return cx.write_pair(retptr, ptr, len);
        }
        Ret::Ref => Val::I32(cx.add_ref(value) as i32),
        Ret::OptRef if value.is_like_none() => Val::I32(0),
        Ret::OptRef => Val::I32(cx.add_ref(value) as i32),
        Ret::I32 => Val::I32(value.to_int32()),
        Ret::U32 => Val::I32(value.to_uint32() as i32),
        Ret::F64 => Val::F64(value.to_number().to_bits()),
        Ret::Bool => Val::I32(i32::from(value.is_truthy())),
        Ret::Enum(table) => {
            let index = match value.as_string() {
                Some(text) => table.index_of(&text.to_string_lossy()),
                None => table.sentinel(),
            };
            Val::I32(index as i32)
        }
    };
    if let Some(slot) = results.first_mut() {
        *slot = out;
    }
    Ok(())
}
