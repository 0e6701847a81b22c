//! Host context trait: what host code can ask of the bridge while it runs.
//!
//! Host functions and microtask jobs receive a `&mut dyn HostContext`. It is
//! the only way back into the guest: handles are allocated through it and
//! guest entry points (closure shims, destructors) are invoked through it.
//! The bridge implements it over the live store; tests implement it over a
//! plain handle table.

use crate::error::HostResult;
use crate::value::HostValue;

/// A deferred unit of host work, run by the microtask queue.
pub type Job = Box<dyn FnOnce(&mut dyn HostContext) -> HostResult<()>>;

/// Host-side view of a running bridge instance.
pub trait HostContext {
    // ── Handle table ──

    /// Store a value in the handle table and return its handle.
    ///
    /// Well-known constants (`undefined`, `null`, booleans) are not
    /// allocated; their fixed handles are returned instead.
    fn add_ref(&mut self, value: HostValue) -> u32;

    /// Read the value behind a live handle without consuming it.
    fn get_ref(&self, handle: u32) -> HostValue;

    /// Move a value out of the table, freeing the handle.
    fn take_ref(&mut self, handle: u32) -> HostValue;

    // ── Guest entry points ──

    /// Parameter count of a guest entry point in the function table.
    fn entry_arity(&mut self, entry: u32) -> HostResult<usize>;

    /// Invoke a guest entry point by function-table index.
    ///
    /// Returns the single `i32` result, if the entry has one. A guest throw
    /// surfaces as [`HostError::Thrown`](crate::HostError::Thrown).
    fn call_entry(&mut self, entry: u32, args: &[i32]) -> HostResult<Option<i32>>;

    // ── Scheduling ──

    /// Queue a job on the microtask queue. Jobs run in FIFO order once the
    /// current guest call has returned.
    fn enqueue(&mut self, job: Job);
}
