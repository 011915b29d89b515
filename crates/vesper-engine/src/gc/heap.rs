//! The garbage-collected heap.
//!
//! The heap is an arena of slots addressed by generational handles. Freeing
//! a slot bumps its generation, so a stale handle can never alias a later
//! allocation. Collection is mark-sweep: the VM marks its roots, the heap
//! traces the object graph through an explicit gray worklist, and the sweep
//! walks the arena's slots directly — there is no intrusive list of
//! allocations to maintain.

use rustc_hash::FxHashMap;

use crate::runtime::object::{Obj, ObjData};
use crate::runtime::value::Value;

/// Collection is first considered once this many bytes are live.
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// The next threshold is the surviving byte count times this factor.
const HEAP_GROWTH_FACTOR: usize = 2;

/// A generational reference to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Creates a handle from raw parts. Only useful for tests; real handles
    /// come from [`Heap::allocate`].
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index of this handle.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// One arena slot.
#[derive(Debug)]
struct Slot {
    generation: u32,
    obj: Option<Obj>,
}

/// Counters reported by [`Heap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Objects currently live
    pub live_objects: usize,
    /// Approximate live bytes
    pub bytes_allocated: usize,
    /// Completed collection cycles
    pub collections: usize,
}

/// The garbage-collected heap arena.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Weak string-intern table: entries are dropped when their string dies
    interned: FxHashMap<String, Handle>,
    /// Rooting stack for values mid-construction (and compile-phase products)
    temp_roots: Vec<Value>,
    /// Gray worklist for the current mark phase
    gray: Vec<Handle>,
    collections: usize,
}

impl Heap {
    /// Creates a new empty heap.
    pub fn new() -> Self {
        Self {
            next_gc: INITIAL_GC_THRESHOLD,
            ..Self::default()
        }
    }

    /// Allocates a new object and returns its handle.
    ///
    /// The heap never collects on its own: the VM's allocation wrapper
    /// checks [`Heap::should_collect`] and runs a cycle first, so every
    /// value the new object will reference is still rooted when this runs.
    pub fn allocate(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        let obj = Obj::new(class, data);
        self.bytes_allocated += obj.size_bytes();

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.obj = Some(obj);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                obj: Some(obj),
            });
            Handle {
                index,
                generation: 0,
            }
        }
    }

    /// Returns the object behind a handle.
    ///
    /// Panics on a stale handle; handles are engine-internal and a stale
    /// dereference is a rooting bug, never a user error.
    pub fn get(&self, handle: Handle) -> &Obj {
        let slot = &self.slots[handle.index()];
        debug_assert_eq!(slot.generation, handle.generation, "stale handle");
        slot.obj.as_ref().expect("stale handle")
    }

    /// Mutable variant of [`Heap::get`].
    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        let slot = &mut self.slots[handle.index()];
        debug_assert_eq!(slot.generation, handle.generation, "stale handle");
        slot.obj.as_mut().expect("stale handle")
    }

    /// Returns the object behind a handle if it is still live.
    pub fn try_get(&self, handle: Handle) -> Option<&Obj> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.obj.as_ref()
    }

    /// Returns the interned string for `handle`.
    ///
    /// Panics if the handle does not reference a string.
    pub fn string(&self, handle: Handle) -> &str {
        match &self.get(handle).data {
            ObjData::Str(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    /// Interns a string, returning the canonical handle for its contents.
    ///
    /// Interned strings bypass the collection trigger (they are leaf
    /// objects), but their bytes still count toward the live total.
    pub fn intern(&mut self, text: &str) -> Handle {
        if let Some(handle) = self.interned.get(text) {
            return *handle;
        }
        let handle = self.allocate(None, ObjData::Str(text.to_string()));
        self.interned.insert(text.to_string(), handle);
        handle
    }

    /// Whether the allocation budget has been exceeded.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Pushes a temporary root, keeping a value alive while a larger
    /// structure referencing it is under construction.
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    /// Pops the most recent temporary root.
    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    /// Marks a value as reachable.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_handle(handle);
        }
    }

    /// Marks an object as reachable and queues it for tracing.
    pub fn mark_handle(&mut self, handle: Handle) {
        let obj = self.get_mut(handle);
        if !obj.marked {
            obj.marked = true;
            self.gray.push(handle);
        }
    }

    /// Traces from every marked object and sweeps the unreachable rest.
    ///
    /// The caller (the VM) must have marked its roots first; the temporary
    /// root stack is marked here.
    pub fn finish_collection(&mut self) {
        for value in std::mem::take(&mut self.temp_roots) {
            self.mark_value(value);
            self.temp_roots.push(value);
        }
        self.trace();
        self.sweep();
        self.collections += 1;
        self.next_gc = (self.bytes_allocated * HEAP_GROWTH_FACTOR).max(INITIAL_GC_THRESHOLD);
    }

    /// Convenience for tests and embedders: a full cycle with explicit roots.
    pub fn collect(&mut self, roots: &[Value]) {
        for value in roots {
            self.mark_value(*value);
        }
        self.finish_collection();
    }

    /// Breadth-first trace over the gray worklist. Iterative, so deeply
    /// nested object graphs cannot exhaust the Rust call stack.
    fn trace(&mut self) {
        let mut refs = Vec::new();
        while let Some(handle) = self.gray.pop() {
            refs.clear();
            self.get(handle).trace_refs(&mut refs);
            for child in &refs {
                self.mark_handle(*child);
            }
        }
    }

    fn sweep(&mut self) {
        // The intern table holds weak references: drop entries whose string
        // did not survive marking, before the slots are freed below.
        self.interned.retain(|_, handle| {
            self.slots[handle.index()]
                .obj
                .as_ref()
                .is_some_and(|obj| obj.marked)
        });

        let mut bytes_live = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match &mut slot.obj {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    bytes_live += obj.size_bytes();
                }
                Some(_) => {
                    slot.obj = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated = bytes_live;
    }

    /// Returns current heap counters.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.slots.iter().filter(|s| s.obj.is_some()).count(),
            bytes_allocated: self.bytes_allocated,
            collections: self.collections,
        }
    }
}
