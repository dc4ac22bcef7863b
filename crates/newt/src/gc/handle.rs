use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use crate::gc::Marker;
use crate::newt_value::WeakRef;

/// Header shared by every collectable object: the mark bit used by the
/// cycle collector and the lazily created weak reference cache.
pub struct GcHeader {
    mark: Cell<bool>,
    weak_ref: RefCell<Option<WeakRef>>,
}

impl GcHeader {
    fn new() -> Self {
        Self {
            mark: Cell::new(false),
            weak_ref: RefCell::new(None),
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.get()
    }

    #[inline]
    pub fn set_mark(&self) -> bool {
        self.mark.replace(true)
    }

    #[inline]
    pub fn clear_mark(&self) {
        self.mark.set(false);
    }

    pub fn cached_weak_ref(&self) -> Option<WeakRef> {
        self.weak_ref.borrow().clone()
    }

    pub fn cache_weak_ref(&self, weak: WeakRef) {
        *self.weak_ref.borrow_mut() = Some(weak);
    }
}

/// Tracing and finalization, implemented by every collectable body type.
pub trait Trace {
    /// Mark the object's outgoing strong edges.
    fn trace(&self, marker: &mut Marker);

    /// Null out contained values, breaking outgoing strong edges. The
    /// shell stays allocated so sweep can still visit siblings that
    /// reference it.
    fn finalize(&mut self);
}

/// A collectable allocation: header plus interior-mutable body.
///
/// The body cell is only ever borrowed for the duration of a single
/// operation, never across a nested call, so tracing and finalization can
/// always get at it.
pub struct GcBox<T: Trace + ?Sized> {
    header: GcHeader,
    body: RefCell<T>,
}

impl<T: Trace> GcBox<T> {
    fn new(body: T) -> Self {
        Self {
            header: GcHeader::new(),
            body: RefCell::new(body),
        }
    }
}

impl<T: Trace + ?Sized> GcBox<T> {
    #[inline]
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    #[inline]
    pub fn body(&self) -> &RefCell<T> {
        &self.body
    }

    /// Break outgoing edges and detach the cached weak reference, leaving
    /// an empty shell. Safe to call more than once.
    pub fn finalize_box(&self) {
        if let Some(weak) = self.header.weak_ref.borrow_mut().take() {
            weak.clear();
        }
        self.body.borrow_mut().finalize();
    }
}

/// Strong handle to a collectable object. Cloning retains, dropping
/// releases; when the last strong handle goes away the object is freed
/// synchronously.
pub struct GcRef<T: Trace + ?Sized>(Rc<GcBox<T>>);

impl<T: Trace> GcRef<T> {
    pub(crate) fn new(body: T) -> Self {
        GcRef(Rc::new(GcBox::new(body)))
    }
}

impl<T: Trace + ?Sized> GcRef<T> {
    #[inline]
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.body.borrow()
    }

    #[inline]
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.body.borrow_mut()
    }

    #[inline]
    pub fn header(&self) -> &GcHeader {
        self.0.header()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identity of the allocation; used for the last-resort
    /// comparison order and for display.
    #[inline]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    #[inline]
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> GcWeak<T> {
        GcWeak(Rc::downgrade(&self.0))
    }
}

impl<T: Trace + 'static> GcRef<T> {
    /// Erase the body type for chain bookkeeping.
    pub(crate) fn as_dyn(&self) -> Rc<GcBox<dyn Trace>> {
        self.0.clone()
    }
}

impl<T: Trace + ?Sized> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        GcRef(self.0.clone())
    }
}

/// Weak handle; upgrade yields a strong handle while the target lives.
pub struct GcWeak<T: Trace + ?Sized>(Weak<GcBox<T>>);

impl<T: Trace + ?Sized> GcWeak<T> {
    pub fn upgrade(&self) -> Option<GcRef<T>> {
        self.0.upgrade().map(GcRef)
    }
}

impl<T: Trace + ?Sized> Clone for GcWeak<T> {
    fn clone(&self) -> Self {
        GcWeak(self.0.clone())
    }
}
