use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::GcWeak;
use crate::newt_value::newt_string::WeakString;
use crate::newt_value::{
    NativeClosure, NewtArray, NewtClass, NewtClosure, NewtGenerator, NewtInstance, NewtTable,
    NewtUserData, NewtValue,
};
use crate::newt_vm::NewtThread;

/// Weak reference value: owns nothing, reads as Null once the target is
/// finalized or freed.
///
/// Exactly one exists per target; it is created lazily and cached on the
/// target, so weak references to the same object compare identical.
#[derive(Clone)]
pub struct WeakRef(Rc<WeakRefCell>);

struct WeakRefCell {
    target: RefCell<Option<WeakTarget>>,
}

#[derive(Clone)]
pub(crate) enum WeakTarget {
    String(WeakString),
    Table(GcWeak<NewtTable>),
    Array(GcWeak<NewtArray>),
    Closure(GcWeak<NewtClosure>),
    NativeClosure(GcWeak<NativeClosure>),
    Generator(GcWeak<NewtGenerator>),
    Class(GcWeak<NewtClass>),
    Instance(GcWeak<NewtInstance>),
    UserData(GcWeak<NewtUserData>),
    Thread(GcWeak<NewtThread>),
}

impl WeakRef {
    pub(crate) fn new(target: WeakTarget) -> Self {
        WeakRef(Rc::new(WeakRefCell {
            target: RefCell::new(Some(target)),
        }))
    }

    /// The referenced value, or Null if the target is gone.
    pub fn deref_value(&self) -> NewtValue {
        let target = self.0.target.borrow();
        let Some(target) = target.as_ref() else {
            return NewtValue::Null;
        };
        match target {
            WeakTarget::String(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::String),
            WeakTarget::Table(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Table),
            WeakTarget::Array(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Array),
            WeakTarget::Closure(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Closure),
            WeakTarget::NativeClosure(w) => {
                w.upgrade().map_or(NewtValue::Null, NewtValue::NativeClosure)
            }
            WeakTarget::Generator(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Generator),
            WeakTarget::Class(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Class),
            WeakTarget::Instance(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Instance),
            WeakTarget::UserData(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::UserData),
            WeakTarget::Thread(w) => w.upgrade().map_or(NewtValue::Null, NewtValue::Thread),
        }
    }

    /// Detach from the target. Called when the target is finalized so the
    /// reference can never observe a half-dead object.
    pub(crate) fn clear(&self) {
        *self.0.target.borrow_mut() = None;
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self.deref_value(), NewtValue::Null)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

/// Get-or-create the unique weak reference for a value.
///
/// Scalars cannot be weakly referenced; following the original semantics
/// they are returned as themselves.
pub fn weak_ref_value(value: &NewtValue) -> NewtValue {
    match value {
        NewtValue::String(s) => {
            if let Some(cached) = s.cached_weak_ref() {
                return NewtValue::WeakRef(cached);
            }
            let weak = WeakRef::new(WeakTarget::String(s.downgrade()));
            s.cache_weak_ref(weak.clone());
            NewtValue::WeakRef(weak)
        }
        NewtValue::Table(r) => cached_or_new(r.header(), WeakTarget::Table(r.downgrade())),
        NewtValue::Array(r) => cached_or_new(r.header(), WeakTarget::Array(r.downgrade())),
        NewtValue::Closure(r) => cached_or_new(r.header(), WeakTarget::Closure(r.downgrade())),
        NewtValue::NativeClosure(r) => {
            cached_or_new(r.header(), WeakTarget::NativeClosure(r.downgrade()))
        }
        NewtValue::Generator(r) => cached_or_new(r.header(), WeakTarget::Generator(r.downgrade())),
        NewtValue::Class(r) => cached_or_new(r.header(), WeakTarget::Class(r.downgrade())),
        NewtValue::Instance(r) => cached_or_new(r.header(), WeakTarget::Instance(r.downgrade())),
        NewtValue::UserData(r) => cached_or_new(r.header(), WeakTarget::UserData(r.downgrade())),
        NewtValue::Thread(r) => cached_or_new(r.header(), WeakTarget::Thread(r.downgrade())),
        other => other.clone(),
    }
}

fn cached_or_new(header: &crate::gc::GcHeader, target: WeakTarget) -> NewtValue {
    if let Some(cached) = header.cached_weak_ref() {
        return NewtValue::WeakRef(cached);
    }
    let weak = WeakRef::new(target);
    header.cache_weak_ref(weak.clone());
    NewtValue::WeakRef(weak)
}
