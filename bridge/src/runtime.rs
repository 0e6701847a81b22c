//! Bridge runtime: Wasmtime engine, module loading, and guest instances.
//!
//! [`Bridge`] compiles and validates a guest module once. Each call to
//! [`Bridge::instantiate`] creates a fresh store, so instances never share
//! handles, closures or microtasks.

use std::path::Path;

use wasmtime::{AsContextMut, Config, Engine, ExternType, Instance, Linker, Module, Store, Val};

use polyglot_hostapi::{
    Exception, HostError, HostFunction, HostObject, HostString, HostValue, Settlement,
};

use crate::closure::finalize_all;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::heap::HeapStats;
use crate::host_impl::{Cx, GuestExports, HostState, Unwind};
use crate::linker::register_intrinsics;
use crate::thunk::Imports;
use crate::validation::{validate_imports, validate_module};

/// A compiled, validated guest module.
pub struct Bridge {
    engine: Engine,
    module: Module,
    config: BridgeConfig,
}

impl Bridge {
    /// Compile a guest module from binary or WAT text.
    pub fn new(wasm: impl AsRef<[u8]>, config: BridgeConfig) -> Result<Self, BridgeError> {
        let engine = create_engine(&config)?;
        let module = Module::new(&engine, wasm)?;
        validate_module(&module)?;
        Ok(Self {
            engine,
            module,
            config,
        })
    }

    /// Load from a `.wasm` or `.wat` file path.
    pub fn from_file(path: &Path, config: BridgeConfig) -> Result<Self, BridgeError> {
        let engine = create_engine(&config)?;
        let module = Module::from_file(&engine, path)?;
        validate_module(&module)?;
        Ok(Self {
            engine,
            module,
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create an instance wired to the intrinsics and the embedder's imports.
    ///
    /// Runs `__wbindgen_start` when the guest exports it.
    pub fn instantiate(&self, imports: &Imports) -> Result<GuestInstance, BridgeError> {
        validate_imports(&self.module, imports)?;

        let mut store = Store::new(&self.engine, HostState::new(self.config.clone()));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel_limit {
            store.set_fuel(fuel)?;
        }

        let mut linker = Linker::new(&self.engine);
        register_intrinsics(&mut linker)?;
        imports.define(&mut linker)?;
        imports.install_well_known(&mut store.data_mut().heap);

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(BridgeError::from_trap)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::MemoryError("no memory export".into()))?;
        let guest = GuestExports {
            memory: Some(memory),
            malloc: instance.get_typed_func(&mut store, "__wbindgen_malloc").ok(),
            realloc: instance.get_typed_func(&mut store, "__wbindgen_realloc").ok(),
            free: instance.get_typed_func(&mut store, "__wbindgen_free").ok(),
            exn_store: instance.get_typed_func(&mut store, "__wbindgen_exn_store").ok(),
            table: instance.get_table(&mut store, "__indirect_function_table"),
        };
        tracing::debug!(
            imports = imports.len(),
            pages = memory.size(&store),
            error_sink = guest.exn_store.is_some(),
            function_table = guest.table.is_some(),
            "guest instantiated"
        );
        store.data_mut().guest = guest;

        let mut guest_instance = GuestInstance {
            store,
            instance,
            module: self.module.clone(),
        };
        if let Ok(start) = instance.get_typed_func::<(), ()>(&mut guest_instance.store, "__wbindgen_start") {
            let result = start.call(&mut guest_instance.store, ());
            result.map_err(|err| guest_instance.guest_error(err))?;
        }
        Ok(guest_instance)
    }
}

/// Create a Wasmtime engine for the bridge.
fn create_engine(config: &BridgeConfig) -> Result<Engine, BridgeError> {
    let mut wasm_config = Config::new();

    // Fuel metering only when a limit is configured
    wasm_config.consume_fuel(config.fuel_limit.is_some());

    // Single-threaded host model
    wasm_config.wasm_threads(false);

    Ok(Engine::new(&wasm_config)?)
}

/// One live guest: its store, instance and host-side state.
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    module: Module,
}

impl GuestInstance {
    /// Names of the guest's function exports.
    pub fn exports(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Current contents of linear memory.
    pub fn memory(&self) -> &[u8] {
        match self.store.data().guest.memory {
            Some(memory) => memory.data(&self.store),
            None => &[],
        }
    }

    /// Call a numeric kernel `fn(iterations: u32) -> u32`.
    pub fn call_kernel(&mut self, name: &str, iterations: u32) -> Result<u32, BridgeError> {
        let func = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, name)
            .map_err(|_| BridgeError::MissingExport(name.to_string()))?;
        let result = func.call(&mut self.store, iterations as i32);
        result.map(|v| v as u32).map_err(|err| self.guest_error(err))
    }

    /// Call a kernel that returns a promise handle.
    pub fn call_kernel_async(&mut self, name: &str, iterations: u32) -> Result<HostObject, BridgeError> {
        let handle = self.call_kernel(name, iterations)?;
        let value = self.store.data_mut().heap.take(handle);
        match value.as_object() {
            Some(object) if object.as_promise().is_some() => Ok(object.clone()),
            _ => Err(BridgeError::UnexpectedValue(format!(
                "{} returned {}, expected a promise",
                name,
                value.type_name()
            ))),
        }
    }

    /// Call an async kernel and wait for its result.
    pub fn await_kernel(&mut self, name: &str, iterations: u32) -> Result<u32, BridgeError> {
        let promise = self.call_kernel_async(name, iterations)?;
        match self.settle(&promise)? {
            Settlement::Fulfilled(value) => Ok(value.to_uint32()),
            Settlement::Rejected(reason) => Err(BridgeError::Rejected(Exception::new(reason))),
        }
    }

    /// Drain the microtask queue, then report how `promise` settled.
    pub fn settle(&mut self, promise: &HostObject) -> Result<Settlement, BridgeError> {
        self.run_microtasks()?;
        let cell = promise
            .as_promise()
            .ok_or_else(|| BridgeError::UnexpectedValue(format!("{} is not a promise", promise.class_name())))?;
        cell.settlement().ok_or(BridgeError::StillPending)
    }

    /// Call any export with i32 arguments.
    pub fn call_export(&mut self, name: &str, args: &[i32]) -> Result<Vec<i32>, BridgeError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];
        let result = func.call(&mut self.store, &params, &mut results);
        result.map_err(|err| self.guest_error(err))?;
        results
            .iter()
            .map(|v| {
                v.i32()
                    .ok_or_else(|| BridgeError::UnexpectedValue(format!("{} returned a non-i32 value", name)))
            })
            .collect()
    }

    /// Call a host function (typically a closure wrapper) from the embedder.
    pub fn invoke(
        &mut self,
        function: &HostFunction,
        this: &HostValue,
        args: &[HostValue],
    ) -> Result<HostValue, BridgeError> {
        let mut cx = Cx::new(self.store.as_context_mut());
        Ok(function.call(&mut cx, this, args)?)
    }

    /// Drop one reference to a closure wrapper.
    pub fn release(&mut self, function: &HostFunction) -> Result<(), BridgeError> {
        let mut cx = Cx::new(self.store.as_context_mut());
        Ok(function.release(&mut cx)?)
    }

    pub fn add_ref(&mut self, value: HostValue) -> u32 {
        self.store.data_mut().heap.add(value)
    }

    pub fn get_ref(&self, handle: u32) -> HostValue {
        self.store.data().heap.get(handle).clone()
    }

    pub fn take_ref(&mut self, handle: u32) -> HostValue {
        self.store.data_mut().heap.take(handle)
    }

    /// Run queued microtasks until the queue is empty.
    ///
    /// Exceptions escaping a job are logged and kept in [`Self::uncaught`];
    /// the drain continues. Returns the number of jobs run.
    pub fn run_microtasks(&mut self) -> Result<usize, BridgeError> {
        let limit = self.store.data().config.max_microtasks;
        let mut ran = 0;
        while let Some(job) = self.store.data_mut().microtasks.pop_front() {
            if ran == limit {
                self.store.data_mut().microtasks.push_front(job);
                return Err(BridgeError::MicrotaskLimit(limit));
            }
            ran += 1;
            let mut cx = Cx::new(self.store.as_context_mut());
            match job(&mut cx) {
                Ok(()) => {}
                Err(HostError::Thrown(exception)) => {
                    tracing::warn!(error = %exception.message(), "uncaught exception in microtask");
                    self.store.data_mut().uncaught.push(exception);
                }
                Err(HostError::Trap(err)) => return Err(BridgeError::from_trap(err)),
            }
        }
        if self.store.data().config.enable_finalizers {
            self.collect_garbage()?;
        }
        Ok(ran)
    }

    /// Sweep the finalization registry. Returns how many destructors ran.
    pub fn collect_garbage(&mut self) -> Result<usize, BridgeError> {
        let dead = self.store.data_mut().finalizers.collect();
        let mut cx = Cx::new(self.store.as_context_mut());
        Ok(finalize_all(&mut cx, dead)?)
    }

    pub fn heap(&self) -> HeapStats {
        self.store.data().heap.stats()
    }

    /// Exceptions that escaped microtasks, oldest first.
    pub fn uncaught(&self) -> &[Exception] {
        &self.store.data().uncaught
    }

    pub fn pending_microtasks(&self) -> usize {
        self.store.data().microtasks.len()
    }

    /// Closure wrappers still tracked for finalization.
    pub fn tracked_closures(&self) -> usize {
        self.store.data().finalizers.len()
    }

    pub fn decoder_generation(&self) -> u64 {
        self.store.data().decoder.generation()
    }

    pub fn view_rebuilds(&self) -> u64 {
        self.store.data().views.rebuilds()
    }

    /// Fuel left, when metering is enabled.
    pub fn fuel_remaining(&self) -> Option<u64> {
        self.store.data().config.fuel_limit?;
        self.store.get_fuel().ok()
    }

    /// Copy a string into a fresh guest buffer.
    pub fn pass_string(&mut self, text: &str) -> Result<(u32, u32), BridgeError> {
        let mut cx = Cx::new(self.store.as_context_mut());
        Ok(cx.pass_string(&HostString::from(text))?)
    }

    /// Decode a UTF-8 string from guest memory.
    pub fn read_string(&mut self, ptr: u32, len: u32) -> Result<String, BridgeError> {
        let bytes = Cx::new(self.store.as_context_mut()).read_bytes(ptr, len)?;
        let text = self.store.data_mut().decoder.decode(&bytes)?;
        Ok(text.to_string_lossy())
    }

    /// Classify an error that unwound a top-level guest call.
    fn guest_error(&mut self, err: anyhow::Error) -> BridgeError {
        if err.downcast_ref::<Unwind>().is_some() {
            if let Some(value) = self.store.data_mut().pending_throw.take() {
                return BridgeError::Uncaught(Exception::new(value));
            }
        }
        BridgeError::from_trap(err)
    }
}
