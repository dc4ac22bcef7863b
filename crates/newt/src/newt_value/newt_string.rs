use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use smol_str::SmolStr;

use crate::newt_value::WeakRef;

/// Interned immutable string with its hash computed once at intern time.
///
/// All strings are created through the shared interner, so equal content
/// implies pointer equality on the hot path; the content comparison only
/// runs for strings that outlived their interner.
#[derive(Clone)]
pub struct NewtString(Rc<StrInner>);

pub(crate) struct StrInner {
    hash: u64,
    data: SmolStr,
    // Strings are refcount-only (never in the GC chain), so the weak
    // reference cache lives here instead of a collectable header.
    weak_ref: RefCell<Option<WeakRef>>,
}

impl NewtString {
    pub(crate) fn new_with_hash(s: &str, hash: u64) -> Self {
        NewtString(Rc::new(StrInner {
            hash,
            data: SmolStr::new(s),
            weak_ref: RefCell::new(None),
        }))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    #[inline]
    pub fn cached_hash(&self) -> u64 {
        self.0.hash
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakString {
        WeakString(Rc::downgrade(&self.0))
    }

    pub(crate) fn cached_weak_ref(&self) -> Option<WeakRef> {
        self.0.weak_ref.borrow().clone()
    }

    pub(crate) fn cache_weak_ref(&self, weak: WeakRef) {
        *self.0.weak_ref.borrow_mut() = Some(weak);
    }
}

/// Weak handle used by the interner buckets and by weak references.
#[derive(Clone)]
pub(crate) struct WeakString(Weak<StrInner>);

impl WeakString {
    pub(crate) fn upgrade(&self) -> Option<NewtString> {
        self.0.upgrade().map(NewtString)
    }
}

impl PartialEq for NewtString {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.0.hash == other.0.hash && self.0.data == other.0.data
    }
}

impl Eq for NewtString {}

impl Hash for NewtString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialOrd for NewtString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NewtString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for NewtString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NewtString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
