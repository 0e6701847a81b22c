//! In-memory `HostContext` for unit tests.
//!
//! Guest entry points are Rust closures registered by index, so closure and
//! promise logic can be exercised without compiling a module.

use std::collections::VecDeque;
use std::rc::Rc;

use polyglot_hostapi::{HostContext, HostError, HostResult, HostValue, Job};

use crate::heap::HandleTable;

type Entry = Rc<dyn Fn(&mut MockHost, &[i32]) -> HostResult<Option<i32>>>;

#[derive(Default)]
pub struct MockHost {
    pub heap: HandleTable,
    entries: Vec<(usize, Entry)>,
    pub queue: VecDeque<Job>,
    /// Every entry call, in order: `(entry, args)`.
    pub calls: Vec<(u32, Vec<i32>)>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point taking `arity` arguments; returns its index.
    pub fn entry(
        &mut self,
        arity: usize,
        f: impl Fn(&mut MockHost, &[i32]) -> HostResult<Option<i32>> + 'static,
    ) -> u32 {
        self.entries.push((arity, Rc::new(f)));
        (self.entries.len() - 1) as u32
    }

    /// Number of recorded calls to `entry`.
    pub fn calls_to(&self, entry: u32) -> usize {
        self.calls.iter().filter(|(e, _)| *e == entry).count()
    }

    /// Run queued jobs until the queue is empty; returns the thrown values.
    pub fn drain(&mut self) -> Vec<HostValue> {
        let mut thrown = Vec::new();
        while let Some(job) = self.queue.pop_front() {
            match job(self) {
                Ok(()) => {}
                Err(HostError::Thrown(exn)) => thrown.push(exn.into_value()),
                Err(HostError::Trap(err)) => panic!("job trapped: {:#}", err),
            }
        }
        thrown
    }
}

impl HostContext for MockHost {
    fn add_ref(&mut self, value: HostValue) -> u32 {
        self.heap.add(value)
    }

    fn get_ref(&self, handle: u32) -> HostValue {
        self.heap.get(handle).clone()
    }

    fn take_ref(&mut self, handle: u32) -> HostValue {
        self.heap.take(handle)
    }

    fn entry_arity(&mut self, entry: u32) -> HostResult<usize> {
        self.entries
            .get(entry as usize)
            .map(|(arity, _)| *arity)
            .ok_or_else(|| HostError::trap(format!("no entry {}", entry)))
    }

    fn call_entry(&mut self, entry: u32, args: &[i32]) -> HostResult<Option<i32>> {
        let f = self
            .entries
            .get(entry as usize)
            .map(|(_, f)| f.clone())
            .ok_or_else(|| HostError::trap(format!("no entry {}", entry)))?;
        self.calls.push((entry, args.to_vec()));
        f(self, args)
    }

    fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job);
    }
}
