mod function_proto;
mod newt_array;
mod newt_class;
mod newt_closure;
mod newt_generator;
pub(crate) mod newt_string;
mod newt_table;
mod newt_userdata;
pub(crate) mod weak_ref;

pub use function_proto::{FunctionProto, LineInfo, LocalVarInfo, OuterDesc, OuterKind};
pub use newt_array::NewtArray;
pub use newt_class::{ClassNewSlot, ClassSlot, NewtClass, NewtInstance};
pub use newt_closure::{
    parse_typemask, typemask_accepts, NativeClosure, NativeReturn, NewtClosure, OuterCell,
    OuterState, ParamCheck,
};
pub use newt_generator::{GeneratorState, NewtGenerator, SavedFrame};
pub use newt_string::NewtString;
pub use newt_table::{set_table_delegate, NewtTable};
pub use newt_userdata::{NewtUserData, ReleaseHook};
pub use weak_ref::{weak_ref_value, WeakRef};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::gc::{GcHeader, GcRef};
use crate::newt_vm::NewtThread;

/// A Newt value: scalars inline, everything else a strong handle.
///
/// Cloning a reference variant retains the object; dropping releases it.
/// Scalars are copied by value and never touch the heap.
#[derive(Clone)]
pub enum NewtValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    /// Opaque host pointer, compared by value.
    UserPointer(usize),
    String(NewtString),
    FuncProto(Rc<FunctionProto>),
    Table(GcRef<NewtTable>),
    Array(GcRef<NewtArray>),
    Closure(GcRef<NewtClosure>),
    NativeClosure(GcRef<NativeClosure>),
    Generator(GcRef<NewtGenerator>),
    Class(GcRef<NewtClass>),
    Instance(GcRef<NewtInstance>),
    UserData(GcRef<NewtUserData>),
    Thread(GcRef<NewtThread>),
    WeakRef(WeakRef),
}

/// Type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    UserPointer,
    String,
    Table,
    Array,
    Closure,
    NativeClosure,
    Generator,
    Class,
    Instance,
    UserData,
    Thread,
    FuncProto,
    WeakRef,
}

impl NewtValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            NewtValue::Null => ValueKind::Null,
            NewtValue::Bool(_) => ValueKind::Bool,
            NewtValue::Integer(_) => ValueKind::Integer,
            NewtValue::Float(_) => ValueKind::Float,
            NewtValue::UserPointer(_) => ValueKind::UserPointer,
            NewtValue::String(_) => ValueKind::String,
            NewtValue::FuncProto(_) => ValueKind::FuncProto,
            NewtValue::Table(_) => ValueKind::Table,
            NewtValue::Array(_) => ValueKind::Array,
            NewtValue::Closure(_) => ValueKind::Closure,
            NewtValue::NativeClosure(_) => ValueKind::NativeClosure,
            NewtValue::Generator(_) => ValueKind::Generator,
            NewtValue::Class(_) => ValueKind::Class,
            NewtValue::Instance(_) => ValueKind::Instance,
            NewtValue::UserData(_) => ValueKind::UserData,
            NewtValue::Thread(_) => ValueKind::Thread,
            NewtValue::WeakRef(_) => ValueKind::WeakRef,
        }
    }

    /// The name `typeof` reports. Both closure kinds and prototypes read
    /// as "function".
    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::UserPointer => "userpointer",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Array => "array",
            ValueKind::Closure | ValueKind::NativeClosure | ValueKind::FuncProto => "function",
            ValueKind::Generator => "generator",
            ValueKind::Class => "class",
            ValueKind::Instance => "instance",
            ValueKind::UserData => "userdata",
            ValueKind::Thread => "thread",
            ValueKind::WeakRef => "weakref",
        }
    }

    // ============ predicates ============

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, NewtValue::Null)
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, NewtValue::Integer(_) | NewtValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, NewtValue::String(_))
    }

    /// Callable directly: closures, native closures, and classes
    /// (constructor call).
    #[inline]
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            NewtValue::Closure(_) | NewtValue::NativeClosure(_) | NewtValue::Class(_)
        )
    }

    /// False, Null and numeric zero are falsy; everything else is truthy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(
            self,
            NewtValue::Null | NewtValue::Bool(false) | NewtValue::Integer(0)
        ) && !matches!(self, NewtValue::Float(f) if *f == 0.0)
    }

    // ============ accessors ============

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            NewtValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric read with integer promotion.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            NewtValue::Integer(i) => Some(*i as f64),
            NewtValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NewtValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<&NewtString> {
        match self {
            NewtValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table(&self) -> Option<&GcRef<NewtTable>> {
        match self {
            NewtValue::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(&self) -> Option<&GcRef<NewtArray>> {
        match self {
            NewtValue::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn as_closure(&self) -> Option<&GcRef<NewtClosure>> {
        match self {
            NewtValue::Closure(c) => Some(c),
            _ => None,
        }
    }

    #[inline]
    pub fn as_class(&self) -> Option<&GcRef<NewtClass>> {
        match self {
            NewtValue::Class(c) => Some(c),
            _ => None,
        }
    }

    #[inline]
    pub fn as_instance(&self) -> Option<&GcRef<NewtInstance>> {
        match self {
            NewtValue::Instance(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_generator(&self) -> Option<&GcRef<NewtGenerator>> {
        match self {
            NewtValue::Generator(g) => Some(g),
            _ => None,
        }
    }

    #[inline]
    pub fn as_thread(&self) -> Option<&GcRef<NewtThread>> {
        match self {
            NewtValue::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// The collectable header, for reference variants that carry one.
    pub(crate) fn gc_header(&self) -> Option<&GcHeader> {
        match self {
            NewtValue::Table(r) => Some(r.header()),
            NewtValue::Array(r) => Some(r.header()),
            NewtValue::Closure(r) => Some(r.header()),
            NewtValue::NativeClosure(r) => Some(r.header()),
            NewtValue::Generator(r) => Some(r.header()),
            NewtValue::Class(r) => Some(r.header()),
            NewtValue::Instance(r) => Some(r.header()),
            NewtValue::UserData(r) => Some(r.header()),
            NewtValue::Thread(r) => Some(r.header()),
            _ => None,
        }
    }

    /// Stable per-object identity for reference variants; scalars have
    /// none.
    pub fn identity_addr(&self) -> Option<usize> {
        match self {
            NewtValue::String(s) => Some(s.addr()),
            NewtValue::FuncProto(p) => Some(Rc::as_ptr(p) as usize),
            NewtValue::Table(r) => Some(r.addr()),
            NewtValue::Array(r) => Some(r.addr()),
            NewtValue::Closure(r) => Some(r.addr()),
            NewtValue::NativeClosure(r) => Some(r.addr()),
            NewtValue::Generator(r) => Some(r.addr()),
            NewtValue::Class(r) => Some(r.addr()),
            NewtValue::Instance(r) => Some(r.addr()),
            NewtValue::UserData(r) => Some(r.addr()),
            NewtValue::Thread(r) => Some(r.addr()),
            NewtValue::WeakRef(w) => Some(w.addr()),
            _ => None,
        }
    }
}

/// Strict equality: tags must match; reference variants compare by
/// identity; floats compare by bit pattern so the pair is a coherent
/// `Eq`/`Hash` for table keys. The engine's `==` additionally unifies
/// integers with floats; see `execute::compare`.
impl PartialEq for NewtValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NewtValue::Null, NewtValue::Null) => true,
            (NewtValue::Bool(a), NewtValue::Bool(b)) => a == b,
            (NewtValue::Integer(a), NewtValue::Integer(b)) => a == b,
            (NewtValue::Float(a), NewtValue::Float(b)) => a.to_bits() == b.to_bits(),
            (NewtValue::UserPointer(a), NewtValue::UserPointer(b)) => a == b,
            (NewtValue::String(a), NewtValue::String(b)) => a == b,
            (NewtValue::FuncProto(a), NewtValue::FuncProto(b)) => Rc::ptr_eq(a, b),
            (NewtValue::Table(a), NewtValue::Table(b)) => a.ptr_eq(b),
            (NewtValue::Array(a), NewtValue::Array(b)) => a.ptr_eq(b),
            (NewtValue::Closure(a), NewtValue::Closure(b)) => a.ptr_eq(b),
            (NewtValue::NativeClosure(a), NewtValue::NativeClosure(b)) => a.ptr_eq(b),
            (NewtValue::Generator(a), NewtValue::Generator(b)) => a.ptr_eq(b),
            (NewtValue::Class(a), NewtValue::Class(b)) => a.ptr_eq(b),
            (NewtValue::Instance(a), NewtValue::Instance(b)) => a.ptr_eq(b),
            (NewtValue::UserData(a), NewtValue::UserData(b)) => a.ptr_eq(b),
            (NewtValue::Thread(a), NewtValue::Thread(b)) => a.ptr_eq(b),
            (NewtValue::WeakRef(a), NewtValue::WeakRef(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for NewtValue {}

impl Hash for NewtValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            NewtValue::Null => {}
            NewtValue::Bool(b) => b.hash(state),
            NewtValue::Integer(i) => i.hash(state),
            NewtValue::Float(f) => f.to_bits().hash(state),
            NewtValue::UserPointer(p) => p.hash(state),
            NewtValue::String(s) => state.write_u64(s.cached_hash()),
            other => {
                if let Some(addr) = other.identity_addr() {
                    addr.hash(state);
                }
            }
        }
    }
}

impl Default for NewtValue {
    fn default() -> Self {
        NewtValue::Null
    }
}

impl From<bool> for NewtValue {
    fn from(v: bool) -> Self {
        NewtValue::Bool(v)
    }
}

impl From<i64> for NewtValue {
    fn from(v: i64) -> Self {
        NewtValue::Integer(v)
    }
}

impl From<f64> for NewtValue {
    fn from(v: f64) -> Self {
        NewtValue::Float(v)
    }
}

impl From<NewtString> for NewtValue {
    fn from(v: NewtString) -> Self {
        NewtValue::String(v)
    }
}

/// Default rendering: scalars print their value, reference types print
/// `(<type> : 0x<addr>)`. The engine's to-string op builds on this after
/// giving the `_tostring` metamethod its chance.
impl fmt::Display for NewtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewtValue::Null => f.write_str("null"),
            NewtValue::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            NewtValue::Integer(i) => {
                let mut buf = itoa::Buffer::new();
                f.write_str(buf.format(*i))
            }
            NewtValue::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            NewtValue::UserPointer(p) => write!(f, "(userpointer : {:#x})", p),
            NewtValue::String(s) => f.write_str(s.as_str()),
            other => {
                let addr = other.identity_addr().unwrap_or(0);
                write!(f, "({} : {:#x})", other.type_name(), addr)
            }
        }
    }
}

impl fmt::Debug for NewtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewtValue::String(s) => write!(f, "{:?}", s.as_str()),
            other => write!(f, "{}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_zero_rules() {
        assert!(!NewtValue::Null.is_truthy());
        assert!(!NewtValue::Bool(false).is_truthy());
        assert!(!NewtValue::Integer(0).is_truthy());
        assert!(!NewtValue::Float(0.0).is_truthy());
        assert!(!NewtValue::Float(-0.0).is_truthy());
        assert!(NewtValue::Bool(true).is_truthy());
        assert!(NewtValue::Integer(-1).is_truthy());
        assert!(NewtValue::Float(0.5).is_truthy());
    }

    #[test]
    fn strict_equality_keeps_int_and_float_apart() {
        assert_eq!(NewtValue::Integer(1), NewtValue::Integer(1));
        assert_ne!(NewtValue::Integer(1), NewtValue::Float(1.0));
        assert_eq!(NewtValue::Float(f64::NAN), NewtValue::Float(f64::NAN));
        assert_ne!(NewtValue::Null, NewtValue::Bool(false));
    }

    #[test]
    fn display_formats_scalars() {
        assert_eq!(NewtValue::Null.to_string(), "null");
        assert_eq!(NewtValue::Integer(-42).to_string(), "-42");
        assert_eq!(NewtValue::Float(2.0).to_string(), "2.0");
        assert_eq!(NewtValue::Float(2.5).to_string(), "2.5");
        assert_eq!(NewtValue::Bool(true).to_string(), "true");
    }
}
