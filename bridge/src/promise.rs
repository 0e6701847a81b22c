//! Async bridge: host promises driven over a [`HostContext`].
//!
//! Settlement is synchronous bookkeeping on the [`PromiseCell`]; reactions
//! never run inline. Each one becomes a job on the microtask queue, so `then`
//! callbacks fire in queue order after the current guest call returns.

use std::cell::Cell;
use std::rc::Rc;

use polyglot_hostapi::{
    Exception, HostContext, HostError, HostFunction, HostObject, HostResult, HostValue,
    PromiseCell, Reaction, Settlement,
};

fn cell(promise: &HostObject) -> HostResult<&PromiseCell> {
    promise
        .as_promise()
        .ok_or_else(|| HostError::trap(format!("{} is not a promise", promise.class_name())))
}

/// `new Promise(executor)`.
///
/// The executor receives `(resolve, reject)`. If it throws, the promise is
/// rejected with the thrown value (unless already resolved).
pub fn construct(cx: &mut dyn HostContext, executor: &HostFunction) -> HostResult<HostObject> {
    let promise = HostObject::promise();
    let (resolve, reject) = resolving_functions(&promise);
    match executor.call(cx, &HostValue::Undefined, &[resolve.into(), reject.clone().into()]) {
        Ok(_) => {}
        Err(HostError::Thrown(exn)) => {
            reject.call(cx, &HostValue::Undefined, &[exn.into_value()])?;
        }
        Err(trap) => return Err(trap),
    }
    Ok(promise)
}

/// The `(resolve, reject)` pair for `promise`. The two share one
/// "already resolved" flag: only the first call of either has any effect.
pub fn resolving_functions(promise: &HostObject) -> (HostFunction, HostFunction) {
    let done = Rc::new(Cell::new(false));

    let target = promise.clone();
    let flag = done.clone();
    let resolve = HostFunction::new("resolve", move |cx, _this, args| {
        if flag.replace(true) {
            tracing::debug!("ignored repeated promise resolution");
            return Ok(HostValue::Undefined);
        }
        resolve_promise(cx, &target, args.first().cloned().unwrap_or_default())?;
        Ok(HostValue::Undefined)
    });

    let target = promise.clone();
    let reject = HostFunction::new("reject", move |cx, _this, args| {
        if done.replace(true) {
            tracing::debug!("ignored repeated promise rejection");
            return Ok(HostValue::Undefined);
        }
        settle(cx, &target, Settlement::Rejected(args.first().cloned().unwrap_or_default()))?;
        Ok(HostValue::Undefined)
    });

    (resolve, reject)
}

/// Resolve `promise` with `value`, adopting promises and thenables.
pub fn resolve_promise(cx: &mut dyn HostContext, promise: &HostObject, value: HostValue) -> HostResult<()> {
    let object = match &value {
        HostValue::Object(object) => object.clone(),
        _ => return settle(cx, promise, Settlement::Fulfilled(value)),
    };

    if object.ptr_eq(promise) {
        let err = Exception::type_error("Chaining cycle detected for promise");
        return settle(cx, promise, Settlement::Rejected(err.into_value()));
    }

    if let Some(source) = object.as_promise() {
        if let Some((reaction, settlement)) = source.subscribe(Reaction::forward(promise.clone())) {
            schedule(cx, reaction, settlement);
        }
        return Ok(());
    }

    if let HostValue::Function(then) = object.get("then") {
        let target = promise.clone();
        cx.enqueue(Box::new(move |cx| {
            let (resolve, reject) = resolving_functions(&target);
            let this = HostValue::Object(object);
            match then.call(cx, &this, &[resolve.into(), reject.clone().into()]) {
                Ok(_) => Ok(()),
                Err(HostError::Thrown(exn)) => {
                    reject.call(cx, &HostValue::Undefined, &[exn.into_value()]).map(|_| ())
                }
                Err(trap) => Err(trap),
            }
        }));
        return Ok(());
    }

    settle(cx, promise, Settlement::Fulfilled(value))
}

/// Move `promise` out of pending and schedule its reactions. A second
/// settlement is ignored.
pub fn settle(cx: &mut dyn HostContext, promise: &HostObject, settlement: Settlement) -> HostResult<()> {
    match cell(promise)?.settle(settlement.clone()) {
        Some(reactions) => {
            for reaction in reactions {
                schedule(cx, reaction, settlement.clone());
            }
        }
        None => tracing::debug!("ignored settlement of an already settled promise"),
    }
    Ok(())
}

/// `Promise.resolve(value)`: promises pass through unchanged.
pub fn promise_resolve(cx: &mut dyn HostContext, value: HostValue) -> HostResult<HostObject> {
    if let Some(object) = value.as_object() {
        if object.as_promise().is_some() {
            return Ok(object.clone());
        }
    }
    let promise = HostObject::promise();
    resolve_promise(cx, &promise, value)?;
    Ok(promise)
}

/// `promise.then(on_fulfilled, on_rejected)`.
///
/// Native promises get a derived promise. Other objects with a callable
/// `then` are called directly, as the host runtime would.
pub fn then(
    cx: &mut dyn HostContext,
    target: &HostValue,
    on_fulfilled: HostValue,
    on_rejected: HostValue,
) -> HostResult<HostValue> {
    let object = match target.as_object() {
        Some(object) => object,
        None => return Err(not_thenable(target)),
    };

    let Some(source) = object.as_promise() else {
        return match object.get("then") {
            HostValue::Function(then) => then.call(cx, target, &[on_fulfilled, on_rejected]),
            _ => Err(not_thenable(target)),
        };
    };

    let derived = HostObject::promise();
    let reaction = Reaction {
        on_fulfilled: on_fulfilled.as_function().cloned(),
        on_rejected: on_rejected.as_function().cloned(),
        derived: Some(derived.clone()),
    };
    if let Some((reaction, settlement)) = source.subscribe(reaction) {
        schedule(cx, reaction, settlement);
    }
    Ok(derived.into())
}

fn not_thenable(value: &HostValue) -> HostError {
    Exception::type_error(format!(
        "{}.then is not a function",
        polyglot_hostapi::debug_string(value)
    ))
    .into()
}

fn schedule(cx: &mut dyn HostContext, reaction: Reaction, settlement: Settlement) {
    cx.enqueue(Box::new(move |cx| run_reaction(cx, reaction, settlement)));
}

fn run_reaction(cx: &mut dyn HostContext, reaction: Reaction, settlement: Settlement) -> HostResult<()> {
    let handler = reaction.handler_for(&settlement).cloned();
    let derived = reaction.derived;

    let Some(handler) = handler else {
        // Pass-through.
        return match derived {
            Some(derived) => match settlement {
                Settlement::Fulfilled(value) => resolve_promise(cx, &derived, value),
                rejected => settle(cx, &derived, rejected),
            },
            None => Ok(()),
        };
    };

    let outcome = handler.call(cx, &HostValue::Undefined, &[settlement.value().clone()]);
    match (outcome, derived) {
        (Ok(value), Some(derived)) => resolve_promise(cx, &derived, value),
        (Err(HostError::Thrown(exn)), Some(derived)) => {
            settle(cx, &derived, Settlement::Rejected(exn.into_value()))
        }
        (Err(HostError::Thrown(exn)), None) => Err(HostError::Thrown(exn)),
        (Err(trap), _) => Err(trap),
        (Ok(_), None) => Ok(()),
    }
}
