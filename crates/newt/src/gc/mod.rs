// Ownership layer: reference counting via strong handles plus a chain of
// weak handles swept by an explicit stop-the-world mark and sweep pass.
// Refcount death is synchronous; the sweep exists only to break cycles.

mod handle;
mod string_interner;

pub use handle::{GcBox, GcHeader, GcRef, GcWeak, Trace};
pub use string_interner::StringInterner;

use std::rc::{Rc, Weak};

use crate::newt_value::NewtValue;

/// Mark-phase worklist. Tracing pushes unmarked collectables; `drain`
/// walks them until the reachable set is closed.
pub struct Marker {
    work: Vec<Rc<GcBox<dyn Trace>>>,
}

impl Marker {
    fn new() -> Self {
        Self { work: Vec::new() }
    }

    pub fn mark_object(&mut self, obj: Rc<GcBox<dyn Trace>>) {
        if !obj.header().set_mark() {
            self.work.push(obj);
        }
    }

    pub fn mark_value(&mut self, value: &NewtValue) {
        match value {
            NewtValue::Table(t) => self.mark_object(t.as_dyn()),
            NewtValue::Array(a) => self.mark_object(a.as_dyn()),
            NewtValue::Closure(c) => self.mark_object(c.as_dyn()),
            NewtValue::NativeClosure(c) => self.mark_object(c.as_dyn()),
            NewtValue::Generator(g) => self.mark_object(g.as_dyn()),
            NewtValue::Class(c) => self.mark_object(c.as_dyn()),
            NewtValue::Instance(i) => self.mark_object(i.as_dyn()),
            NewtValue::UserData(u) => self.mark_object(u.as_dyn()),
            NewtValue::Thread(t) => self.mark_object(t.as_dyn()),
            // Scalars are not heap-managed; strings and prototypes are
            // refcount-only leaves; weak references own nothing.
            _ => {}
        }
    }

    pub fn mark_values(&mut self, values: &[NewtValue]) {
        for value in values {
            self.mark_value(value);
        }
    }

    fn drain(&mut self) {
        while let Some(obj) = self.work.pop() {
            obj.body().borrow().trace(self);
        }
    }
}

/// The collectable chain: a weak handle to every collectable allocated
/// through the shared state.
pub struct GcChain {
    chain: Vec<Weak<GcBox<dyn Trace>>>,
}

impl GcChain {
    pub fn new() -> Self {
        Self { chain: Vec::new() }
    }

    pub fn track(&mut self, obj: Rc<GcBox<dyn Trace>>) {
        self.chain.push(Rc::downgrade(&obj));
    }

    /// Number of live tracked objects.
    pub fn live_count(&self) -> usize {
        self.chain.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// One full collection cycle. `trace_roots` marks the root set; an
    /// empty closure turns this into full teardown.
    ///
    /// Returns the number of objects finalized.
    pub fn collect<F>(&mut self, trace_roots: F) -> usize
    where
        F: FnOnce(&mut Marker),
    {
        let mut marker = Marker::new();
        trace_roots(&mut marker);
        marker.drain();

        // Everything still unmarked is unreachable. Hold strong handles
        // while finalizing so breaking one object's edges cannot free a
        // sibling we are about to visit; dropping the handles afterwards
        // releases whatever actually reached refcount zero.
        let mut garbage: Vec<Rc<GcBox<dyn Trace>>> = Vec::new();
        for weak in &self.chain {
            if let Some(obj) = weak.upgrade() {
                if !obj.header().is_marked() {
                    garbage.push(obj);
                }
            }
        }
        let finalized = garbage.len();
        for obj in &garbage {
            obj.finalize_box();
        }
        drop(garbage);

        // Survivors stay tracked with their marks cleared; dead entries
        // fall out of the chain.
        self.chain.retain(|weak| match weak.upgrade() {
            Some(obj) => {
                obj.header().clear_mark();
                true
            }
            None => false,
        });

        finalized
    }
}

impl Default for GcChain {
    fn default() -> Self {
        Self::new()
    }
}
