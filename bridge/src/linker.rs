//! Bridge intrinsics registered under the `wbg` import module.
//!
//! Every intrinsic runs inside [`guarded`]: a host exception is delivered to
//! the guest error sink and the call returns zero, a trap unwinds the guest.
//! `throw` and `rethrow` are the exceptions: they unwind the guest on purpose
//! and leave the value in `HostState::pending_throw` for the caller.

use wasmtime::{AsContextMut, Caller, Linker};

use polyglot_hostapi::value::format_number;
use polyglot_hostapi::{
    debug_string, Exception, HostContext, HostError, HostObject, HostResult, HostString,
    HostValue,
};

use crate::closure::{make_mut_closure, scoped_closure};
use crate::error::BridgeError;
use crate::host_impl::{Cx, HostState, Unwind};
use crate::promise;

/// Import module of the intrinsics.
pub const MODULE: &str = "wbg";

/// Every intrinsic name defined under [`MODULE`].
pub const INTRINSICS: &[&str] = &[
    "__wbindgen_object_drop_ref",
    "__wbindgen_object_clone_ref",
    "__wbindgen_string_new",
    "__wbindgen_number_new",
    "__wbindgen_bytes_new",
    "__wbindgen_error_new",
    "__wbindgen_string_get",
    "__wbindgen_number_get",
    "__wbindgen_debug_string",
    "__wbindgen_is_undefined",
    "__wbindgen_is_null",
    "__wbindgen_is_object",
    "__wbindgen_is_function",
    "__wbindgen_is_string",
    "__wbindgen_throw",
    "__wbindgen_rethrow",
    "__wbindgen_closure_new",
    "__wbindgen_cb_unref",
    "__wbindgen_call0",
    "__wbindgen_call1",
    "__wbindgen_object_new",
    "__wbindgen_array_new",
    "__wbindgen_array_push",
    "__wbindgen_reflect_get",
    "__wbindgen_reflect_set",
    "__wbindgen_promise_new",
    "__wbindgen_promise_resolve",
    "__wbindgen_promise_then",
    "__wbindgen_promise_then2",
    "__wbindgen_queue_microtask",
    "__wbindgen_instanceof_error",
    "__wbindgen_instanceof_promise",
];

/// Register all intrinsics with the linker.
pub fn register_intrinsics(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    register_handles(linker)?;
    register_values(linker)?;
    register_checks(linker)?;
    register_exceptions(linker)?;
    register_closures(linker)?;
    register_objects(linker)?;
    register_promises(linker)?;
    Ok(())
}

/// Run a host operation for the guest. Thrown exceptions go to the guest
/// error sink and the intrinsic returns `R::default()`.
fn guarded<R: Default>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut Cx<'_>) -> HostResult<R>,
) -> anyhow::Result<R> {
    let mut cx = Cx::new(caller.as_context_mut());
    match f(&mut cx) {
        Ok(value) => Ok(value),
        Err(HostError::Thrown(exception)) => {
            cx.route_exception(exception)?;
            Ok(R::default())
        }
        Err(HostError::Trap(err)) => Err(err),
    }
}

/// Park `value` as the pending exception and return the unwinding error.
fn unwind(cx: &mut Cx<'_>, value: HostValue) -> anyhow::Error {
    let message = Exception::new(value.clone()).message();
    cx.state_mut().pending_throw = Some(value);
    anyhow::Error::new(Unwind { message })
}

fn as_handle(value: u32) -> i32 {
    value as i32
}

fn function_arg(value: HostValue) -> HostResult<polyglot_hostapi::HostFunction> {
    match value {
        HostValue::Function(f) => Ok(f),
        other => Err(Exception::type_error(format!("{} is not a function", debug_string(&other))).into()),
    }
}

fn object_arg(value: &HostValue, op: &str) -> HostResult<HostObject> {
    value.as_object().cloned().ok_or_else(|| {
        Exception::type_error(format!("{} called on non-object {}", op, debug_string(value))).into()
    })
}

/// Property key of a reflect operation.
fn property_key(key: &HostValue) -> String {
    match key {
        HostValue::String(s) => s.to_string_lossy(),
        HostValue::Number(n) => format_number(*n),
        other => debug_string(other),
    }
}

// ── Handles ──

fn register_handles(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_object_drop_ref",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                cx.take_ref(handle as u32);
                Ok(())
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_object_clone_ref",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let value = cx.get_ref(handle as u32);
                Ok(as_handle(cx.add_ref(value)))
            })
        },
    )?;
    Ok(())
}

// ── Value construction and extraction ──

fn register_values(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_string_new",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let text = cx.read_str(ptr as u32, len as u32)?;
                Ok(as_handle(cx.add_ref(text.into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_number_new",
        |mut caller: Caller<'_, HostState>, value: f64| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| Ok(as_handle(cx.add_ref(value.into()))))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_bytes_new",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let bytes = cx.read_bytes(ptr as u32, len as u32)?;
                Ok(as_handle(cx.add_ref(HostObject::bytes(bytes).into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_error_new",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let message = cx.read_str(ptr as u32, len as u32)?;
                let error = HostObject::error("Error", message.to_string_lossy());
                Ok(as_handle(cx.add_ref(error.into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_string_get",
        |mut caller: Caller<'_, HostState>, retptr: i32, handle: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                let (ptr, len) = match cx.get_ref(handle as u32) {
                    HostValue::String(text) => cx.pass_string(&text)?,
                    _ => (0, 0),
                };
                cx.write_pair(retptr as u32, ptr, len)
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_number_get",
        |mut caller: Caller<'_, HostState>, retptr: i32, handle: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                let value = cx.get_ref(handle as u32).as_number();
                cx.write_opt_f64(retptr as u32, value)
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_debug_string",
        |mut caller: Caller<'_, HostState>, retptr: i32, handle: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                let text = HostString::from(debug_string(&cx.get_ref(handle as u32)));
                let (ptr, len) = cx.pass_string(&text)?;
                cx.write_pair(retptr as u32, ptr, len)
            })
        },
    )?;
    Ok(())
}

// ── Tag checks ──

fn register_checks(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    let checks: [(&str, fn(&HostValue) -> bool); 7] = [
        ("__wbindgen_is_undefined", HostValue::is_undefined),
        ("__wbindgen_is_null", HostValue::is_null),
        ("__wbindgen_is_object", HostValue::is_object),
        ("__wbindgen_is_function", HostValue::is_function),
        ("__wbindgen_is_string", HostValue::is_string),
        ("__wbindgen_instanceof_error", |v: &HostValue| v.as_object().is_some_and(HostObject::is_error)),
        ("__wbindgen_instanceof_promise", |v: &HostValue| {
            v.as_object().is_some_and(|o| o.as_promise().is_some())
        }),
    ];
    for (name, check) in checks {
        linker.func_wrap(
            MODULE,
            name,
            move |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
                guarded(&mut caller, |cx| Ok(i32::from(check(&cx.get_ref(handle as u32)))))
            },
        )?;
    }
    Ok(())
}

// ── Exceptions ──

fn register_exceptions(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_throw",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let mut cx = Cx::new(caller.as_context_mut());
            let value = match cx.read_str(ptr as u32, len as u32) {
                Ok(message) => HostObject::error("Error", message.to_string_lossy()).into(),
                Err(HostError::Thrown(exception)) => exception.into_value(),
                Err(HostError::Trap(err)) => return Err(err),
            };
            Err(unwind(&mut cx, value))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_rethrow",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<()> {
            let mut cx = Cx::new(caller.as_context_mut());
            let value = cx.take_ref(handle as u32);
            Err(unwind(&mut cx, value))
        },
    )?;
    Ok(())
}

// ── Closures and calls ──

fn register_closures(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_closure_new",
        |mut caller: Caller<'_, HostState>, a: i32, b: i32, dtor: i32, thunk: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let (wrapper, state) = make_mut_closure(a as u32, b as u32, dtor as u32, thunk as u32);
                if cx.state().config.enable_finalizers {
                    cx.state_mut().finalizers.register(&wrapper, state);
                }
                tracing::trace!(thunk, dtor, "closure created");
                Ok(as_handle(cx.add_ref(wrapper.into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_cb_unref",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                // The handle stays with the guest; it frees it with object_drop_ref.
                let wrapper = match cx.get_ref(handle as u32) {
                    HostValue::Function(f) if f.is_releasable() => f,
                    other => {
                        return Err(HostError::trap(format!(
                            "cb_unref on {}, which is not a closure",
                            debug_string(&other)
                        )))
                    }
                };
                wrapper.release(cx)
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_call0",
        |mut caller: Caller<'_, HostState>, f: i32, this: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let f = function_arg(cx.get_ref(f as u32))?;
                let this = cx.get_ref(this as u32);
                let result = f.call(cx, &this, &[])?;
                Ok(as_handle(cx.add_ref(result)))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_call1",
        |mut caller: Caller<'_, HostState>, f: i32, this: i32, arg: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let f = function_arg(cx.get_ref(f as u32))?;
                let this = cx.get_ref(this as u32);
                let arg = cx.get_ref(arg as u32);
                let result = f.call(cx, &this, &[arg])?;
                Ok(as_handle(cx.add_ref(result)))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_queue_microtask",
        |mut caller: Caller<'_, HostState>, f: i32| -> anyhow::Result<()> {
            guarded(&mut caller, |cx| {
                let f = function_arg(cx.get_ref(f as u32))?;
                cx.enqueue(Box::new(move |cx| {
                    f.call(cx, &HostValue::Undefined, &[]).map(|_| ())
                }));
                Ok(())
            })
        },
    )?;
    Ok(())
}

// ── Objects ──

fn register_objects(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_object_new",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| Ok(as_handle(cx.add_ref(HostObject::plain().into()))))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_array_new",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                Ok(as_handle(cx.add_ref(HostObject::array(Vec::new()).into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_array_push",
        |mut caller: Caller<'_, HostState>, array: i32, value: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let target = cx.get_ref(array as u32);
                let value = cx.get_ref(value as u32);
                match target.as_object().and_then(|o| o.push(value)) {
                    Some(len) => Ok(len as i32),
                    None => Err(Exception::type_error(format!(
                        "array_push on non-array {}",
                        debug_string(&target)
                    ))
                    .into()),
                }
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_reflect_get",
        |mut caller: Caller<'_, HostState>, target: i32, key: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let object = object_arg(&cx.get_ref(target as u32), "Reflect.get")?;
                let key = property_key(&cx.get_ref(key as u32));
                Ok(as_handle(cx.add_ref(object.get(&key))))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_reflect_set",
        |mut caller: Caller<'_, HostState>, target: i32, key: i32, value: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let object = object_arg(&cx.get_ref(target as u32), "Reflect.set")?;
                let key = property_key(&cx.get_ref(key as u32));
                object.set(key, cx.get_ref(value as u32));
                Ok(1)
            })
        },
    )?;
    Ok(())
}

// ── Promises ──

fn register_promises(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        MODULE,
        "__wbindgen_promise_new",
        |mut caller: Caller<'_, HostState>, a: i32, b: i32, thunk: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let (executor, guard) = scoped_closure(a as u32, b as u32, thunk as u32);
                let constructed = promise::construct(cx, &executor);
                guard.end();
                Ok(as_handle(cx.add_ref(constructed?.into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_promise_resolve",
        |mut caller: Caller<'_, HostState>, value: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let value = cx.get_ref(value as u32);
                let resolved = promise::promise_resolve(cx, value)?;
                Ok(as_handle(cx.add_ref(resolved.into())))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_promise_then",
        |mut caller: Caller<'_, HostState>, target: i32, on_fulfilled: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let target = cx.get_ref(target as u32);
                let on_fulfilled = cx.get_ref(on_fulfilled as u32);
                let derived = promise::then(cx, &target, on_fulfilled, HostValue::Undefined)?;
                Ok(as_handle(cx.add_ref(derived)))
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "__wbindgen_promise_then2",
        |mut caller: Caller<'_, HostState>, target: i32, on_fulfilled: i32, on_rejected: i32| -> anyhow::Result<i32> {
            guarded(&mut caller, |cx| {
                let target = cx.get_ref(target as u32);
                let on_fulfilled = cx.get_ref(on_fulfilled as u32);
                let on_rejected = cx.get_ref(on_rejected as u32);
                let derived = promise::then(cx, &target, on_fulfilled, on_rejected)?;
                Ok(as_handle(cx.add_ref(derived)))
            })
        },
    )?;
    Ok(())
}
