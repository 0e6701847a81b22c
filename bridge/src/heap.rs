//! Handle table: small integers standing for host values.
//!
//! Layout:
//!
//! | handles    | contents                                        |
//! |------------|-------------------------------------------------|
//! | `0`        | "absent" (optional handles); never dereferenced |
//! | `1..128`   | well-known objects installed per instance       |
//! | `128..132` | `undefined`, `null`, `true`, `false`            |
//! | `132..`    | dynamic handles                                 |
//!
//! Free dynamic slots form a singly linked list rooted at `heap_next`; the
//! most recently freed slot is reused first (LIFO). Handles below
//! [`CONSTANT_REGION`] are never recycled.

use polyglot_hostapi::HostValue;

/// Start of the constant singletons; also the end of the well-known region.
pub const RESERVED: u32 = 128;
pub const UNDEFINED: u32 = 128;
pub const NULL: u32 = 129;
pub const TRUE: u32 = 130;
pub const FALSE: u32 = 131;
/// First dynamic handle.
pub const CONSTANT_REGION: u32 = 132;

enum Slot {
    /// Reserved handle with nothing installed.
    Vacant,
    Occupied(HostValue),
    /// Free slot; holds the next free index.
    Free(u32),
}

/// Occupancy statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Live dynamic handles.
    pub live: usize,
    /// Dynamic slots ever created.
    pub capacity: usize,
    /// High-water mark of live dynamic handles.
    pub peak: usize,
}

pub struct HandleTable {
    slots: Vec<Slot>,
    heap_next: u32,
    live: usize,
    peak: usize,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        let mut slots: Vec<Slot> = (0..RESERVED).map(|_| Slot::Vacant).collect();
        slots.push(Slot::Occupied(HostValue::Undefined));
        slots.push(Slot::Occupied(HostValue::Null));
        slots.push(Slot::Occupied(HostValue::Bool(true)));
        slots.push(Slot::Occupied(HostValue::Bool(false)));
        Self {
            slots,
            heap_next: CONSTANT_REGION,
            live: 0,
            peak: 0,
        }
    }

    /// Store `value` in a fresh dynamic slot.
    pub fn alloc(&mut self, value: HostValue) -> u32 {
        if self.heap_next as usize == self.slots.len() {
            self.slots.push(Slot::Free(self.slots.len() as u32 + 1));
        }
        let handle = self.heap_next;
        let slot = std::mem::replace(&mut self.slots[handle as usize], Slot::Occupied(value));
        match slot {
            Slot::Free(next) => self.heap_next = next,
            _ => panic!("handle table free list corrupted at {}", handle),
        }
        self.live += 1;
        self.peak = self.peak.max(self.live);
        tracing::trace!(handle, live = self.live, "handle allocated");
        handle
    }

    /// Like [`alloc`](Self::alloc), but constants map to their fixed handles.
    pub fn add(&mut self, value: HostValue) -> u32 {
        match value {
            HostValue::Undefined => UNDEFINED,
            HostValue::Null => NULL,
            HostValue::Bool(true) => TRUE,
            HostValue::Bool(false) => FALSE,
            other => self.alloc(other),
        }
    }

    /// Dereference a live handle.
    ///
    /// # Panics
    ///
    /// If the handle is free, vacant or past the end of the table.
    pub fn get(&self, handle: u32) -> &HostValue {
        match self.slots.get(handle as usize) {
            Some(Slot::Occupied(value)) => value,
            Some(Slot::Free(_)) => panic!("use of freed handle {}", handle),
            Some(Slot::Vacant) => panic!("use of uninstalled reserved handle {}", handle),
            None => panic!("use of unknown handle {}", handle),
        }
    }

    /// Free a handle. Constant-region handles are ignored.
    ///
    /// # Panics
    ///
    /// On double free or an unknown handle.
    pub fn free(&mut self, handle: u32) {
        let _ = self.release(handle);
    }

    /// Dereference and free in one step.
    pub fn take(&mut self, handle: u32) -> HostValue {
        if handle < CONSTANT_REGION {
            return self.get(handle).clone();
        }
        self.release(handle)
            .unwrap_or_else(|| panic!("use of freed handle {}", handle))
    }

    /// A second handle to the value behind `handle`.
    pub fn clone_ref(&mut self, handle: u32) -> u32 {
        let value = self.get(handle).clone();
        self.alloc(value)
    }

    fn release(&mut self, handle: u32) -> Option<HostValue> {
        if handle < CONSTANT_REGION {
            return None;
        }
        let slot = match self.slots.get_mut(handle as usize) {
            Some(slot) => slot,
            None => panic!("free of unknown handle {}", handle),
        };
        if !matches!(slot, Slot::Occupied(_)) {
            panic!("double free of handle {}", handle);
        }
        let value = match std::mem::replace(slot, Slot::Free(self.heap_next)) {
            Slot::Occupied(value) => value,
            _ => unreachable!(),
        };
        self.heap_next = handle;
        self.live -= 1;
        tracing::trace!(handle, live = self.live, "handle freed");
        Some(value)
    }

    /// Install a well-known object at a reserved handle.
    ///
    /// # Panics
    ///
    /// If `index` is `0` or outside the well-known region.
    pub fn install(&mut self, index: u32, value: HostValue) {
        assert!(
            (1..RESERVED).contains(&index),
            "well-known handle {} outside 1..{}",
            index,
            RESERVED
        );
        self.slots[index as usize] = Slot::Occupied(value);
    }

    pub fn is_live(&self, handle: u32) -> bool {
        matches!(self.slots.get(handle as usize), Some(Slot::Occupied(_)))
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live: self.live,
            capacity: self.slots.len() - CONSTANT_REGION as usize,
            peak: self.peak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn number(h: &HandleTable, handle: u32) -> f64 {
        h.get(handle).as_number().unwrap()
    }

    #[test]
    fn test_constants() {
        let mut heap = HandleTable::new();
        assert!(heap.get(UNDEFINED).is_undefined());
        assert!(heap.get(NULL).is_null());
        assert_eq!(heap.add(HostValue::Bool(true)), TRUE);
        assert_eq!(heap.add(HostValue::Bool(false)), FALSE);
        assert_eq!(heap.add(HostValue::Null), NULL);

        // Constants are never recycled.
        heap.free(TRUE);
        heap.free(TRUE);
        assert!(heap.take(NULL).is_null());
        assert!(heap.is_live(NULL));
        assert_eq!(heap.stats().live, 0);
    }

    #[test]
    fn test_dynamic_handles_start_after_constants() {
        let mut heap = HandleTable::new();
        assert_eq!(heap.alloc(1.0.into()), CONSTANT_REGION);
        assert_eq!(heap.alloc(2.0.into()), CONSTANT_REGION + 1);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut heap = HandleTable::new();
        let a = heap.alloc(1.into());
        let b = heap.alloc(2.into());
        let c = heap.alloc(3.into());
        heap.free(a);
        heap.free(c);
        // Most recently freed first, then the older one, then growth.
        assert_eq!(heap.alloc(4.into()), c);
        assert_eq!(heap.alloc(5.into()), a);
        assert_eq!(heap.alloc(6.into()), c + 1);
        assert_eq!(number(&heap, b), 2.0);
        assert_eq!(heap.stats().capacity, 4);
    }

    #[test]
    fn test_take_frees() {
        let mut heap = HandleTable::new();
        let h = heap.alloc("x".into());
        assert!(heap.take(h).is_string());
        assert!(!heap.is_live(h));
        assert_eq!(heap.alloc(HostValue::Number(0.0)), h);
    }

    #[test]
    fn test_clone_ref_shares_identity() {
        let mut heap = HandleTable::new();
        let obj = polyglot_hostapi::HostObject::plain();
        let h = heap.alloc(obj.clone().into());
        let h2 = heap.clone_ref(h);
        assert_ne!(h, h2);
        heap.free(h);
        assert!(heap.get(h2).as_object().unwrap().ptr_eq(&obj));
    }

    #[test]
    fn test_install_well_known() {
        let mut heap = HandleTable::new();
        heap.install(1, "gpu".into());
        assert_eq!(heap.get(1).as_string().unwrap(), "gpu");
        heap.free(1);
        assert!(heap.is_live(1));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut heap = HandleTable::new();
        let h = heap.alloc(1.into());
        heap.free(h);
        heap.free(h);
    }

    #[test]
    #[should_panic(expected = "use of freed handle")]
    fn test_get_after_free_panics() {
        let mut heap = HandleTable::new();
        let h = heap.alloc(1.into());
        heap.free(h);
        heap.get(h);
    }

    #[test]
    #[should_panic(expected = "uninstalled reserved handle")]
    fn test_vacant_reserved_panics() {
        HandleTable::new().get(5);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_install_outside_region_panics() {
        HandleTable::new().install(CONSTANT_REGION, HostValue::Null);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Free(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![3 => Just(Op::Alloc), 2 => any::<usize>().prop_map(Op::Free)],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn prop_live_handles_resolve_to_their_values(ops in ops()) {
            let mut heap = HandleTable::new();
            let mut live: Vec<(u32, f64)> = Vec::new();
            let mut freed: Vec<u32> = Vec::new();
            let mut counter = 0.0;

            for op in ops {
                match op {
                    Op::Alloc => {
                        counter += 1.0;
                        let expected = freed.pop();
                        let h = heap.alloc(HostValue::Number(counter));
                        match expected {
                            // Reuse before growth, most recently freed first.
                            Some(slot) => prop_assert_eq!(h, slot),
                            None => prop_assert_eq!(h as usize, CONSTANT_REGION as usize + heap.stats().capacity - 1),
                        }
                        prop_assert!(h >= CONSTANT_REGION);
                        live.push((h, counter));
                    }
                    Op::Free(i) if !live.is_empty() => {
                        let (h, _) = live.swap_remove(i % live.len());
                        heap.free(h);
                        freed.push(h);
                    }
                    Op::Free(_) => {}
                }
                for &(h, v) in &live {
                    prop_assert_eq!(number(&heap, h), v);
                }
                prop_assert_eq!(heap.stats().live, live.len());
            }
        }
    }
}
