//! Closure bridge: guest callables exposed as host functions.
//!
//! A guest closure is two words of captured state `(a, b)` plus two entry
//! points in the guest function table: the thunk that runs the closure and the
//! destructor that frees its state. The host wrapper owns none of that state;
//! it only counts references. The guest holds the first reference.
//!
//! While a call is in flight `a` is zeroed, so a reentrant call observes
//! `a == 0` and a reentrant release can only bring the count down to the
//! in-flight reference. The destructor runs when the count reaches zero, and
//! always receives the original `a`.

use std::cell::Cell;
use std::rc::Rc;

use polyglot_hostapi::{HostContext, HostError, HostFunction, HostResult, HostValue, WeakFunction};

/// Reference-counted state of one guest closure.
#[derive(Debug)]
pub struct ClosureState {
    a: Cell<u32>,
    b: u32,
    cnt: Cell<u32>,
    dtor: u32,
    thunk: u32,
    destroyed: Cell<bool>,
}

impl ClosureState {
    pub fn refs(&self) -> u32 {
        self.cnt.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn invoke(&self, cx: &mut dyn HostContext, args: &[HostValue]) -> HostResult<HostValue> {
        if self.destroyed.get() {
            return Err(HostError::trap(format!(
                "closure (thunk {}) invoked after it was destroyed",
                self.thunk
            )));
        }
        self.cnt.set(self.cnt.get() + 1);
        let a = self.a.replace(0);

        let result = call_thunk(cx, self.thunk, a, self.b, args);

        let remaining = self.cnt.get() - 1;
        self.cnt.set(remaining);
        if remaining == 0 {
            let destroyed = self.destroy(cx, a);
            result.and_then(|value| destroyed.map(|()| value))
        } else {
            self.a.set(a);
            result
        }
    }

    /// Drop one reference.
    fn unref(&self, cx: &mut dyn HostContext) -> HostResult<()> {
        if self.destroyed.get() {
            return Err(HostError::trap(format!(
                "closure (thunk {}) released after it was destroyed",
                self.thunk
            )));
        }
        let remaining = self.cnt.get() - 1;
        self.cnt.set(remaining);
        if remaining == 0 {
            self.destroy(cx, self.a.get())?;
        }
        Ok(())
    }

    /// Run the destructor if nothing else has. Returns true if it ran.
    pub fn finalize(&self, cx: &mut dyn HostContext) -> HostResult<bool> {
        if self.destroyed.get() {
            return Ok(false);
        }
        self.cnt.set(0);
        self.destroy(cx, self.a.get())?;
        Ok(true)
    }

    fn destroy(&self, cx: &mut dyn HostContext, a: u32) -> HostResult<()> {
        self.a.set(0);
        self.destroyed.set(true);
        tracing::debug!(dtor = self.dtor, a, b = self.b, "closure destroyed");
        cx.call_entry(self.dtor, &[a as i32, self.b as i32]).map(|_| ())
    }
}

/// Call a closure thunk as `(a, b, arg handles...)`.
///
/// One handle is allocated per declared parameter after `(a, b)`. Missing
/// arguments are passed as `undefined`; surplus ones are dropped. A result,
/// if the thunk has one, is a handle owned by the caller.
fn call_thunk(
    cx: &mut dyn HostContext,
    thunk: u32,
    a: u32,
    b: u32,
    args: &[HostValue],
) -> HostResult<HostValue> {
    let arity = cx.entry_arity(thunk)?;
    if arity < 2 {
        return Err(HostError::trap(format!(
            "closure thunk {} takes {} parameters, expected at least 2",
            thunk, arity
        )));
    }
    let mut raw = Vec::with_capacity(arity);
    raw.push(a as i32);
    raw.push(b as i32);
    for i in 0..arity - 2 {
        let arg = args.get(i).cloned().unwrap_or_default();
        raw.push(cx.add_ref(arg) as i32);
    }
    match cx.call_entry(thunk, &raw)? {
        Some(handle) => Ok(cx.take_ref(handle as u32)),
        None => Ok(HostValue::Undefined),
    }
}

/// Wrap a guest closure as a host function with one reference (the guest's).
pub fn make_mut_closure(a: u32, b: u32, dtor: u32, thunk: u32) -> (HostFunction, Rc<ClosureState>) {
    let state = Rc::new(ClosureState {
        a: Cell::new(a),
        b,
        cnt: Cell::new(1),
        dtor,
        thunk,
        destroyed: Cell::new(false),
    });
    let call_state = state.clone();
    let release_state = state.clone();
    let wrapper = HostFunction::releasable(
        "",
        move |cx, _this, args| call_state.invoke(cx, args),
        move |cx| release_state.unref(cx),
    );
    (wrapper, state)
}

/// Ends the validity of a scoped closure.
pub struct ScopeGuard {
    state: Rc<ScopedState>,
}

impl ScopeGuard {
    pub fn end(self) {
        self.state.a.set(0);
        self.state.b.set(0);
        self.state.ended.set(true);
    }
}

struct ScopedState {
    a: Cell<u32>,
    b: Cell<u32>,
    thunk: u32,
    ended: Cell<bool>,
}

/// A borrowed guest closure, valid only until its guard is ended.
///
/// Used for callbacks the host runs synchronously during one call, such as a
/// promise executor. The guest keeps ownership; there is no destructor.
pub fn scoped_closure(a: u32, b: u32, thunk: u32) -> (HostFunction, ScopeGuard) {
    let state = Rc::new(ScopedState {
        a: Cell::new(a),
        b: Cell::new(b),
        thunk,
        ended: Cell::new(false),
    });
    let call_state = state.clone();
    let wrapper = HostFunction::new("", move |cx, _this, args| {
        let state = &call_state;
        if state.ended.get() {
            return Err(HostError::trap(format!(
                "scoped closure (thunk {}) invoked after its scope ended",
                state.thunk
            )));
        }
        let a = state.a.replace(0);
        let result = call_thunk(cx, state.thunk, a, state.b.get(), args);
        if !state.ended.get() {
            state.a.set(a);
        }
        result
    });
    (wrapper, ScopeGuard { state })
}

/// Weak-reference registry of closure wrappers.
///
/// When a wrapper is collected while its closure was never released, the
/// sweep hands back its state so the destructor can run once. Sweep timing is
/// up to the embedder; explicit release is the real disposal path.
#[derive(Default)]
pub struct FinalizationRegistry {
    entries: Vec<(WeakFunction, Rc<ClosureState>)>,
}

impl FinalizationRegistry {
    pub fn register(&mut self, wrapper: &HostFunction, state: Rc<ClosureState>) {
        self.entries.push((wrapper.downgrade(), state));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove collected and destroyed entries. Returns the states of
    /// collected wrappers whose destructor has not run.
    pub fn collect(&mut self) -> Vec<Rc<ClosureState>> {
        let mut dead = Vec::new();
        self.entries.retain(|(wrapper, state)| {
            if state.is_destroyed() {
                return false;
            }
            if wrapper.is_alive() {
                return true;
            }
            dead.push(state.clone());
            false
        });
        dead
    }
}

/// Run destructors for collected closures. Returns how many ran.
pub fn finalize_all(cx: &mut dyn HostContext, states: Vec<Rc<ClosureState>>) -> HostResult<usize> {
    let mut ran = 0;
    let mut first_error = None;
    for state in states {
        match state.finalize(cx) {
            Ok(true) => ran += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(dtor = state.dtor, error = %err, "closure destructor failed during sweep");
                first_error.get_or_insert(err);
            }
        }
    }
    if ran > 0 {
        tracing::debug!(ran, "finalization sweep ran destructors");
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(ran),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::UNDEFINED;
    use crate::testing::MockHost;
    use polyglot_hostapi::{debug_string, HostObject};
    use std::cell::RefCell;

    const A: u32 = 8;
    const B: u32 = 9;

    /// A thunk `(a, b, x)` that drops its argument, and a destructor.
    fn guest(mock: &mut MockHost) -> (u32, u32) {
        let thunk = mock.entry(3, |host, args| {
            host.heap.free(args[2] as u32);
            Ok(None)
        });
        let dtor = mock.entry(2, |_, _| Ok(None));
        (thunk, dtor)
    }

    #[test]
    fn test_destructor_runs_once_after_release() {
        let mut mock = MockHost::new();
        let (thunk, dtor) = guest(&mut mock);
        let (f, state) = make_mut_closure(A, B, dtor, thunk);

        for k in 0..3 {
            f.call(&mut mock, &HostValue::Undefined, &[k.into()]).unwrap();
            assert_eq!(mock.calls_to(dtor), 0);
            assert_eq!(state.refs(), 1);
        }
        assert_eq!(mock.calls_to(thunk), 3);
        // Every call sees the real state.
        assert!(mock.calls.iter().filter(|(e, _)| *e == thunk).all(|(_, args)| args[0] == A as i32));

        f.release(&mut mock).unwrap();
        assert_eq!(mock.calls_to(dtor), 1);
        assert_eq!(mock.calls.last().unwrap().1, vec![A as i32, B as i32]);
        assert!(state.is_destroyed());

        assert!(f.call(&mut mock, &HostValue::Undefined, &[]).unwrap_err().is_trap());
        assert!(f.release(&mut mock).unwrap_err().is_trap());
        assert_eq!(mock.calls_to(dtor), 1);
        assert_eq!(mock.heap.stats().live, 0);
    }

    #[test]
    fn test_reentrant_call_and_release_defer_destruction() {
        let mut mock = MockHost::new();
        let slot: Rc<RefCell<Option<HostFunction>>> = Rc::new(RefCell::new(None));
        let seen: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));

        let dtor = mock.entry(2, |_, _| Ok(None));
        let inner_slot = slot.clone();
        let inner_seen = seen.clone();
        let thunk = mock.entry(3, move |host, args| {
            inner_seen.borrow_mut().push(args[0]);
            host.heap.free(args[2] as u32);
            if args[0] != 0 {
                let f = inner_slot.borrow().clone().unwrap();
                // Reentrant call, then drop the guest's own reference mid-call.
                f.call(host, &HostValue::Undefined, &[])?;
                f.release(host)?;
                assert_eq!(host.calls_to(0), 0, "destructor ran mid-call");
            }
            Ok(None)
        });
        assert_eq!(dtor, 0);

        let (f, state) = make_mut_closure(A, B, dtor, thunk);
        *slot.borrow_mut() = Some(f.clone());

        f.call(&mut mock, &HostValue::Undefined, &[]).unwrap();

        assert_eq!(*seen.borrow(), vec![A as i32, 0]);
        assert_eq!(mock.calls_to(dtor), 1);
        let dtor_args = &mock.calls.iter().find(|(e, _)| *e == dtor).unwrap().1;
        assert_eq!(dtor_args, &vec![A as i32, B as i32]);
        assert!(state.is_destroyed());
    }

    #[test]
    fn test_arguments_padded_and_result_taken() {
        let mut mock = MockHost::new();
        let thunk = mock.entry(4, |host, args| {
            let x = host.heap.take(args[2] as u32);
            let y = host.heap.take(args[3] as u32);
            let pair = HostObject::array(vec![x, y]);
            Ok(Some(host.heap.alloc(pair.into()) as i32))
        });
        let dtor = mock.entry(2, |_, _| Ok(None));
        let (f, _) = make_mut_closure(A, B, dtor, thunk);

        let out = f.call(&mut mock, &HostValue::Undefined, &[21.into()]).unwrap();
        let out = out.as_object().unwrap().clone();
        assert_eq!(out.element(0).unwrap().as_number(), Some(21.0));
        assert!(out.element(1).unwrap().is_undefined());
        assert_eq!(mock.calls[0].1[3] as u32, UNDEFINED);

        // Surplus arguments are ignored.
        let out = f
            .call(&mut mock, &HostValue::Undefined, &[1.into(), 2.into(), 3.into()])
            .unwrap();
        assert_eq!(debug_string(&out), "[1, 2]");
        assert_eq!(mock.heap.stats().live, 0);
    }

    #[test]
    fn test_finalizer_runs_destructor_for_leaked_wrapper() {
        let mut mock = MockHost::new();
        let (thunk, dtor) = guest(&mut mock);
        let mut registry = FinalizationRegistry::default();

        let (leaked, leaked_state) = make_mut_closure(A, B, dtor, thunk);
        registry.register(&leaked, leaked_state.clone());
        let (kept, kept_state) = make_mut_closure(1, 2, dtor, thunk);
        registry.register(&kept, kept_state);

        assert!(registry.collect().is_empty());
        drop(leaked);

        let dead = registry.collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(finalize_all(&mut mock, dead).unwrap(), 1);
        assert_eq!(mock.calls_to(dtor), 1);
        assert!(leaked_state.is_destroyed());
        assert_eq!(registry.len(), 1);

        // Explicitly released closures are dropped from the registry.
        kept.release(&mut mock).unwrap();
        drop(kept);
        assert!(registry.collect().is_empty());
        assert!(registry.is_empty());
        assert_eq!(mock.calls_to(dtor), 2);
    }

    #[test]
    fn test_sweep_runs_every_destructor_after_a_failure() {
        let mut mock = MockHost::new();
        let (thunk, _) = guest(&mut mock);
        let dtor = mock.entry(2, |_, args| {
            if args[1] == 1 {
                return Err(HostError::trap("destructor failed"));
            }
            Ok(None)
        });
        let states: Vec<_> = (1..=3).map(|b| make_mut_closure(A, b, dtor, thunk).1).collect();

        let err = finalize_all(&mut mock, states.clone()).unwrap_err();
        assert!(err.is_trap());
        assert_eq!(mock.calls_to(dtor), 3);
        assert!(states.iter().all(|state| state.is_destroyed()));
    }

    #[test]
    fn test_finalize_after_destroy_is_noop() {
        let mut mock = MockHost::new();
        let (thunk, dtor) = guest(&mut mock);
        let (f, state) = make_mut_closure(A, B, dtor, thunk);
        f.release(&mut mock).unwrap();
        assert!(!state.finalize(&mut mock).unwrap());
        assert_eq!(mock.calls_to(dtor), 1);
    }

    #[test]
    fn test_scoped_closure_invalid_after_scope() {
        let mut mock = MockHost::new();
        let thunk = mock.entry(2, |_, _| Ok(None));
        let (f, guard) = scoped_closure(A, B, thunk);

        f.call(&mut mock, &HostValue::Undefined, &[]).unwrap();
        assert_eq!(mock.calls[0].1, vec![A as i32, B as i32]);

        guard.end();
        assert!(f.call(&mut mock, &HostValue::Undefined, &[]).unwrap_err().is_trap());
        assert_eq!(mock.calls_to(thunk), 1);
    }
}
