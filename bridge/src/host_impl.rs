//! Per-instance mutable state held in the Wasmtime Store, and the host
//! context built over it.
//!
//! `HostState` owns everything the bridge keeps between calls: the handle
//! table, the memory view cache, the text decoder, the microtask queue and the
//! closure finalization registry. `Cx` borrows the store for the duration of
//! one host operation and implements [`HostContext`] on top of it, so host
//! functions can allocate handles and call back into the guest.

use std::collections::VecDeque;

use wasmtime::{AsContext, AsContextMut, Func, Memory, Ref, StoreContextMut, StoreLimits, StoreLimitsBuilder, Table, TypedFunc, Val};

use polyglot_hostapi::{
    Exception, HostContext, HostError, HostResult, HostString, HostValue, Job,
};

use crate::closure::FinalizationRegistry;
use crate::config::BridgeConfig;
use crate::heap::HandleTable;
use crate::marshal::{self, GuestAlloc, TextDecoder};
use crate::memory::MemoryViews;

/// Guest support exports, resolved once after instantiation.
#[derive(Default)]
pub struct GuestExports {
    pub memory: Option<Memory>,
    pub malloc: Option<TypedFunc<(i32, i32), i32>>,
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub free: Option<TypedFunc<(i32, i32, i32), ()>>,
    pub exn_store: Option<TypedFunc<i32, ()>>,
    pub table: Option<Table>,
}

/// Per-instance mutable state held in the Wasmtime `Store`.
pub struct HostState {
    pub heap: HandleTable,
    pub views: MemoryViews,
    pub decoder: TextDecoder,
    pub microtasks: VecDeque<Job>,
    pub finalizers: FinalizationRegistry,
    pub guest: GuestExports,
    /// Exception raised by a guest `throw`, parked while the guest unwinds.
    pub pending_throw: Option<HostValue>,
    /// Exceptions that escaped microtasks.
    pub uncaught: Vec<Exception>,
    pub limits: StoreLimits,
    pub config: BridgeConfig,
}

impl HostState {
    pub fn new(config: BridgeConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();
        Self {
            heap: HandleTable::new(),
            views: MemoryViews::new(),
            decoder: TextDecoder::with_threshold(config.decoder_threshold),
            microtasks: VecDeque::new(),
            finalizers: FinalizationRegistry::default(),
            guest: GuestExports::default(),
            pending_throw: None,
            uncaught: Vec::new(),
            limits,
            config,
        }
    }
}

/// Marker error a guest `throw` unwinds with. The thrown value itself is in
/// [`HostState::pending_throw`].
#[derive(Debug, thiserror::Error)]
#[error("guest threw: {message}")]
pub(crate) struct Unwind {
    pub message: String,
}

/// Host context over a borrowed store.
pub struct Cx<'a> {
    store: StoreContextMut<'a, HostState>,
}

impl<'a> Cx<'a> {
    pub fn new(store: StoreContextMut<'a, HostState>) -> Self {
        Self { store }
    }

    pub fn state(&self) -> &HostState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    pub fn store_mut(&mut self) -> StoreContextMut<'_, HostState> {
        self.store.as_context_mut()
    }

    fn memory(&self) -> HostResult<Memory> {
        self.state()
            .guest
            .memory
            .ok_or_else(|| HostError::trap("guest exports no linear memory"))
    }

    /// Run `f` over the current memory buffer and the host state.
    pub fn with_memory<R>(
        &mut self,
        f: impl FnOnce(&mut [u8], &mut HostState) -> HostResult<R>,
    ) -> HostResult<R> {
        let memory = self.memory()?;
        let (data, state) = memory.data_and_store_mut(&mut self.store);
        state.views.observe(data);
        f(data, state)
    }

    /// Decode a `(ptr, len)` UTF-8 string from guest memory.
    pub fn read_str(&mut self, ptr: u32, len: u32) -> HostResult<HostString> {
        self.with_memory(|data, state| {
            let HostState { views, decoder, .. } = state;
            let bytes = views.bytes(data);
            let text = decoder.decode(bytes.read(ptr, len as usize)?)?;
            Ok(text)
        })
    }

    pub fn read_bytes(&mut self, ptr: u32, len: u32) -> HostResult<Vec<u8>> {
        self.with_memory(|data, state| {
            Ok(state.views.bytes(data).read(ptr, len as usize)?.to_vec())
        })
    }

    pub fn read_words32(&mut self, ptr: u32, count: u32) -> HostResult<Vec<u32>> {
        self.with_memory(|data, state| state.views.words32(data).read(ptr, count as usize))
    }

    /// Write a `(ptr, len)` pair at a return pointer.
    pub fn write_pair(&mut self, retptr: u32, ptr: u32, len: u32) -> HostResult<()> {
        self.with_memory(|data, state| {
            let mut view = state.views.data_view(data);
            view.set_i32(retptr, ptr as i32)?;
            view.set_i32(retptr + 4, len as i32)
        })
    }

    /// Write an optional number as `(is_some: i32, pad, value: f64)`.
    pub fn write_opt_f64(&mut self, retptr: u32, value: Option<f64>) -> HostResult<()> {
        self.with_memory(|data, state| {
            let mut view = state.views.data_view(data);
            view.set_f64(retptr + 8, value.unwrap_or(0.0))?;
            view.set_i32(retptr, i32::from(value.is_some()))
        })
    }

    /// Copy a host string into a fresh guest buffer.
    pub fn pass_string(&mut self, text: &HostString) -> HostResult<(u32, u32)> {
        marshal::encode_into(self, text)
    }

    /// Release a guest buffer through `__wbindgen_free`.
    pub fn free_guest(&mut self, ptr: u32, len: u32, align: u32) -> HostResult<()> {
        let free = self
            .state()
            .guest
            .free
            .clone()
            .ok_or_else(|| HostError::trap("guest does not export __wbindgen_free"))?;
        free.call(&mut self.store, (ptr as i32, len as i32, align as i32))
            .map_err(|err| self.unwound(err))
    }

    /// Deliver a thrown host value to the guest error sink.
    ///
    /// The value gets exactly one handle, passed to `__wbindgen_exn_store`.
    /// Without a sink the exception cannot be delivered and becomes a trap.
    pub fn route_exception(&mut self, exception: Exception) -> anyhow::Result<()> {
        let sink = match self.state().guest.exn_store.clone() {
            Some(sink) => sink,
            None => anyhow::bail!("host exception with no guest error sink: {}", exception),
        };
        let handle = self.state_mut().heap.alloc(exception.into_value());
        tracing::trace!(handle, "exception routed to guest error sink");
        sink.call(&mut self.store, handle as i32)
    }

    /// Convert an error returned by a guest call. A guest `throw` becomes
    /// the thrown value again; anything else stays a trap.
    pub(crate) fn unwound(&mut self, err: anyhow::Error) -> HostError {
        if err.downcast_ref::<Unwind>().is_some() {
            if let Some(value) = self.state_mut().pending_throw.take() {
                return HostError::Thrown(Exception::new(value));
            }
        }
        HostError::Trap(err)
    }

    fn entry(&mut self, entry: u32) -> HostResult<Func> {
        let table = self
            .state()
            .guest
            .table
            .ok_or_else(|| HostError::trap("guest exports no __indirect_function_table"))?;
        match table.get(&mut self.store, entry.into()) {
            Some(Ref::Func(Some(func))) => Ok(func),
            _ => Err(HostError::trap(format!(
                "function table entry {} is not a function",
                entry
            ))),
        }
    }
}

impl HostContext for Cx<'_> {
    fn add_ref(&mut self, value: HostValue) -> u32 {
        self.state_mut().heap.add(value)
    }

    fn get_ref(&self, handle: u32) -> HostValue {
        self.state().heap.get(handle).clone()
    }

    fn take_ref(&mut self, handle: u32) -> HostValue {
        self.state_mut().heap.take(handle)
    }

    fn entry_arity(&mut self, entry: u32) -> HostResult<usize> {
        let func = self.entry(entry)?;
        Ok(func.ty(self.store.as_context()).params().len())
    }

    fn call_entry(&mut self, entry: u32, args: &[i32]) -> HostResult<Option<i32>> {
        let func = self.entry(entry)?;
        let ty = func.ty(self.store.as_context());
        if ty.params().len() != args.len() {
            return Err(HostError::trap(format!(
                "function table entry {} takes {} arguments, called with {}",
                entry,
                ty.params().len(),
                args.len()
            )));
        }
        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];
        match func.call(&mut self.store, &params, &mut results) {
            Ok(()) => Ok(results.first().and_then(Val::i32)),
            Err(err) => Err(self.unwound(err)),
        }
    }

    fn enqueue(&mut self, job: Job) {
        self.state_mut().microtasks.push_back(job);
    }
}

impl GuestAlloc for Cx<'_> {
    fn malloc(&mut self, size: u32, align: u32) -> HostResult<u32> {
        let malloc = self
            .state()
            .guest
            .malloc
            .clone()
            .ok_or_else(|| HostError::trap("guest does not export __wbindgen_malloc"))?;
        match malloc.call(&mut self.store, (size as i32, align as i32)) {
            Ok(ptr) => Ok(ptr as u32),
            Err(err) => Err(self.unwound(err)),
        }
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> HostResult<u32> {
        let realloc = self
            .state()
            .guest
            .realloc
            .clone()
            .ok_or_else(|| HostError::trap("guest does not export __wbindgen_realloc"))?;
        let args = (ptr as i32, old_size as i32, new_size as i32, align as i32);
        match realloc.call(&mut self.store, args) {
            Ok(ptr) => Ok(ptr as u32),
            Err(err) => Err(self.unwound(err)),
        }
    }

    fn memory_mut(&mut self) -> HostResult<&mut [u8]> {
        let memory = self.memory()?;
        let (data, state) = memory.data_and_store_mut(&mut self.store);
        state.views.observe(data);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Linker, Module, Store};

    // Minimal guest: bump malloc, growing realloc, an error sink that
    // records the last handle at address 0, and a two-entry function table.
    const GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $bump (mut i32) (i32.const 1024))
            (table (export "__indirect_function_table") 2 funcref)
            (elem (i32.const 0) $add $nop)
            (func $add (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add)
            (func $nop (param i32 i32 i32))
            (func (export "__wbindgen_malloc") (param i32 i32) (result i32)
                (local $p i32)
                global.get $bump
                local.set $p
                global.get $bump
                local.get 0
                i32.add
                global.set $bump
                local.get $p)
            (func (export "__wbindgen_realloc") (param i32 i32 i32 i32) (result i32)
                (local $p i32)
                global.get $bump
                local.set $p
                (memory.copy (local.get $p) (local.get 0) (local.get 1))
                global.get $bump
                local.get 2
                i32.add
                global.set $bump
                local.get $p)
            (func (export "__wbindgen_exn_store") (param i32)
                i32.const 0
                local.get 0
                i32.store)
        )
    "#;

    fn guest_store() -> Store<HostState> {
        let engine = Engine::default();
        let module = Module::new(&engine, GUEST).unwrap();
        let mut store = Store::new(&engine, HostState::new(BridgeConfig::default()));
        let instance = Linker::new(&engine).instantiate(&mut store, &module).unwrap();
        let guest = GuestExports {
            memory: instance.get_memory(&mut store, "memory"),
            malloc: instance.get_typed_func(&mut store, "__wbindgen_malloc").ok(),
            realloc: instance.get_typed_func(&mut store, "__wbindgen_realloc").ok(),
            free: None,
            exn_store: instance.get_typed_func(&mut store, "__wbindgen_exn_store").ok(),
            table: instance.get_table(&mut store, "__indirect_function_table"),
        };
        store.data_mut().guest = guest;
        store
    }

    #[test]
    fn test_string_through_guest_allocator() {
        let mut store = guest_store();
        let mut cx = Cx::new(store.as_context_mut());
        let (ptr, len) = cx.pass_string(&HostString::from("gr\u{fc}\u{df}e")).unwrap();
        // Non-ASCII forces one realloc past the initial 5-byte buffer.
        assert_eq!((ptr, len), (1029, 7));
        assert_eq!(cx.read_str(ptr, len).unwrap(), "gr\u{fc}\u{df}e");
    }

    #[test]
    fn test_invalid_utf8_is_a_thrown_type_error() {
        let mut store = guest_store();
        let mut cx = Cx::new(store.as_context_mut());
        cx.with_memory(|data, _| {
            data[100] = 0xc3;
            Ok(())
        })
        .unwrap();
        let err = cx.read_str(100, 1).unwrap_err();
        let exn = err.into_exception().unwrap();
        assert_eq!(exn.value().as_object().unwrap().class_name(), "TypeError");
    }

    #[test]
    fn test_call_entry_by_table_index() {
        let mut store = guest_store();
        let mut cx = Cx::new(store.as_context_mut());
        assert_eq!(cx.entry_arity(0).unwrap(), 2);
        assert_eq!(cx.call_entry(0, &[40, 2]).unwrap(), Some(42));
        assert_eq!(cx.call_entry(1, &[1, 2, 3]).unwrap(), None);
        assert!(cx.call_entry(0, &[1]).unwrap_err().is_trap());
        assert!(cx.call_entry(7, &[]).unwrap_err().is_trap());
    }

    #[test]
    fn test_route_exception_allocates_one_handle() {
        let mut store = guest_store();
        let mut cx = Cx::new(store.as_context_mut());
        let before = cx.state().heap.stats().live;
        cx.route_exception(Exception::error("boom")).unwrap();
        assert_eq!(cx.state().heap.stats().live, before + 1);

        let handle = cx.with_memory(|data, _| crate::memory::read_i32(data, 0)).unwrap() as u32;
        let value = cx.get_ref(handle);
        assert_eq!(value.as_object().unwrap().get("message").as_string().unwrap(), "boom");
    }

    #[test]
    fn test_return_pointer_writes() {
        let mut store = guest_store();
        let mut cx = Cx::new(store.as_context_mut());
        cx.write_pair(16, 1024, 5).unwrap();
        cx.write_opt_f64(32, Some(2.5)).unwrap();
        cx.with_memory(|data, state| {
            let view = state.views.data_view(data);
            assert_eq!(view.get_i32(16)?, 1024);
            assert_eq!(view.get_i32(20)?, 5);
            assert_eq!(view.get_i32(32)?, 1);
            assert_eq!(view.get_f64(40)?, 2.5);
            Ok(())
        })
        .unwrap();
    }
}
