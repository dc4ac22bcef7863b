use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::{GcRef, Marker, Trace};
use crate::newt_value::function_proto::FunctionProto;
use crate::newt_value::weak_ref::WeakRef;
use crate::newt_value::{NewtClass, NewtValue, ValueKind};
use crate::newt_vm::newt_thread::StackHandle;
use crate::newt_vm::NativeFn;

// ============ outer cells ============

pub enum OuterState {
    /// Variable still lives in a frame slot of the owning thread.
    Open { stack: StackHandle, slot: usize },
    /// Frame is gone; the cell owns the value.
    Closed(NewtValue),
}

/// Shared captured variable. Every closure capturing the same local holds
/// the same cell, so writes through one closure are seen by all of them,
/// before and after the defining frame returns.
#[derive(Clone)]
pub struct OuterCell(Rc<RefCell<OuterState>>);

impl OuterCell {
    pub fn open(stack: StackHandle, slot: usize) -> Self {
        Self(Rc::new(RefCell::new(OuterState::Open { stack, slot })))
    }

    pub fn closed(value: NewtValue) -> Self {
        Self(Rc::new(RefCell::new(OuterState::Closed(value))))
    }

    pub fn get(&self) -> NewtValue {
        match &*self.0.borrow() {
            OuterState::Open { stack, slot } => stack.borrow()[*slot].clone(),
            OuterState::Closed(value) => value.clone(),
        }
    }

    pub fn set(&self, value: NewtValue) {
        match &mut *self.0.borrow_mut() {
            OuterState::Open { stack, slot } => stack.borrow_mut()[*slot] = value,
            OuterState::Closed(slot) => *slot = value,
        }
    }

    /// Detach from the stack, capturing the current value.
    pub fn close(&self) {
        let mut state = self.0.borrow_mut();
        if let OuterState::Open { stack, slot } = &*state {
            let value = stack.borrow()[*slot].clone();
            *state = OuterState::Closed(value);
        }
    }

    /// Point a closed cell back at a live slot. Used when a suspended
    /// frame is spliced onto a thread again; the caller has already put
    /// the cell's value into the slot.
    pub fn reopen(&self, stack: StackHandle, slot: usize) {
        *self.0.borrow_mut() = OuterState::Open { stack, slot };
    }

    pub fn is_open_at(&self, stack: &StackHandle, slot: usize) -> bool {
        match &*self.0.borrow() {
            OuterState::Open {
                stack: own_stack,
                slot: own_slot,
            } => Rc::ptr_eq(own_stack, stack) && *own_slot == slot,
            OuterState::Closed(_) => false,
        }
    }

    /// Slot index when still open on the given stack.
    pub fn open_slot(&self, stack: &StackHandle) -> Option<usize> {
        match &*self.0.borrow() {
            OuterState::Open {
                stack: own_stack,
                slot,
            } if Rc::ptr_eq(own_stack, stack) => Some(*slot),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &OuterCell) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn trace_into(&self, marker: &mut Marker) {
        // Open cells read through the owning thread's stack, which that
        // thread traces itself.
        if let OuterState::Closed(value) = &*self.0.borrow() {
            marker.mark_value(value);
        }
    }
}

// ============ script closures ============

/// Instantiated function: shared prototype plus captured outers and the
/// default argument values evaluated at instantiation time.
pub struct NewtClosure {
    pub proto: Rc<FunctionProto>,
    pub outers: Vec<OuterCell>,
    pub default_params: Vec<NewtValue>,
    /// Replacement environment from bind_env, weakly held.
    pub env: Option<WeakRef>,
    /// Base class of the class this closure was installed into as a
    /// method; what the base-load op reads.
    pub base: Option<GcRef<NewtClass>>,
}

impl NewtClosure {
    pub fn new(proto: Rc<FunctionProto>) -> Self {
        Self {
            proto,
            outers: Vec::new(),
            default_params: Vec::new(),
            env: None,
            base: None,
        }
    }

    /// Copy sharing prototype and outer cells, with a bound environment.
    pub fn with_env(&self, env: WeakRef) -> NewtClosure {
        NewtClosure {
            proto: self.proto.clone(),
            outers: self.outers.clone(),
            default_params: self.default_params.clone(),
            env: Some(env),
            base: self.base.clone(),
        }
    }

    /// Copy re-parented under a class base, made when a closure becomes
    /// a method of a derived class.
    pub fn with_base(&self, base: GcRef<NewtClass>) -> NewtClosure {
        NewtClosure {
            proto: self.proto.clone(),
            outers: self.outers.clone(),
            default_params: self.default_params.clone(),
            env: self.env.clone(),
            base: Some(base),
        }
    }
}

impl Trace for NewtClosure {
    fn trace(&self, marker: &mut Marker) {
        for outer in &self.outers {
            outer.trace_into(marker);
        }
        marker.mark_values(&self.default_params);
        if let Some(base) = &self.base {
            marker.mark_object(base.as_dyn());
        }
    }

    fn finalize(&mut self) {
        self.outers.clear();
        self.default_params.clear();
        self.env = None;
        self.base = None;
    }
}

// ============ native closures ============

/// What a native function hands back to the dispatcher.
pub enum NativeReturn {
    NoValue,
    Value(NewtValue),
    /// Suspend the running thread; only meaningful on a side thread.
    Suspend,
}

/// Parameter count contract: no check, an exact count, or a minimum,
/// the invisible receiver included in the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamCheck {
    None,
    Exact(usize),
    AtLeast(usize),
}

pub struct NativeClosure {
    pub function: NativeFn,
    pub name: NewtValue,
    /// Values bound at creation, readable by the native while it runs.
    pub free_vars: Vec<NewtValue>,
    pub param_check: ParamCheck,
    pub typemask: Option<Vec<u32>>,
    pub env: Option<WeakRef>,
}

impl NativeClosure {
    pub fn new(function: NativeFn) -> Self {
        Self {
            function,
            name: NewtValue::Null,
            free_vars: Vec::new(),
            param_check: ParamCheck::None,
            typemask: None,
            env: None,
        }
    }

    pub fn with_env(&self, env: WeakRef) -> NativeClosure {
        NativeClosure {
            function: self.function,
            name: self.name.clone(),
            free_vars: self.free_vars.clone(),
            param_check: self.param_check,
            typemask: self.typemask.clone(),
            env: Some(env),
        }
    }

    pub fn name_str(&self) -> &str {
        match &self.name {
            NewtValue::String(s) => s.as_str(),
            _ => "unknown",
        }
    }
}

impl Trace for NativeClosure {
    fn trace(&self, marker: &mut Marker) {
        marker.mark_values(&self.free_vars);
    }

    fn finalize(&mut self) {
        self.free_vars.clear();
        self.env = None;
    }
}

// ============ typemask ============

#[inline]
fn kind_bit(kind: ValueKind) -> u32 {
    1 << kind as u32
}

fn mask_for(c: char) -> Option<u32> {
    Some(match c {
        '.' => u32::MAX,
        'o' => kind_bit(ValueKind::Null),
        'b' => kind_bit(ValueKind::Bool),
        'i' => kind_bit(ValueKind::Integer),
        'f' => kind_bit(ValueKind::Float),
        'n' => kind_bit(ValueKind::Integer) | kind_bit(ValueKind::Float),
        'p' => kind_bit(ValueKind::UserPointer),
        's' => kind_bit(ValueKind::String),
        't' => kind_bit(ValueKind::Table),
        'a' => kind_bit(ValueKind::Array),
        'c' => {
            kind_bit(ValueKind::Closure)
                | kind_bit(ValueKind::NativeClosure)
                | kind_bit(ValueKind::Class)
        }
        'g' => kind_bit(ValueKind::Generator),
        'u' => kind_bit(ValueKind::UserData),
        'v' => kind_bit(ValueKind::Thread),
        'x' => kind_bit(ValueKind::Instance),
        'y' => kind_bit(ValueKind::Class),
        'r' => kind_bit(ValueKind::WeakRef),
        _ => return None,
    })
}

/// Parse a parameter type mask, one letter per parameter with `|` for
/// alternatives, e.g. `".sn|o"`. None when the string is malformed.
pub fn parse_typemask(mask: &str) -> Option<Vec<u32>> {
    let mut masks = Vec::new();
    let mut chars = mask.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ' ' {
            continue;
        }
        let mut combined = mask_for(c)?;
        while chars.peek() == Some(&'|') {
            chars.next();
            combined |= chars.next().and_then(mask_for)?;
        }
        masks.push(combined);
    }
    if masks.is_empty() {
        None
    } else {
        Some(masks)
    }
}

/// Whether `value` satisfies the mask entry for one parameter.
#[inline]
pub fn typemask_accepts(mask: u32, value: &NewtValue) -> bool {
    mask & kind_bit(value.kind()) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typemask_parses_alternation() {
        let masks = parse_typemask(".sn|o").unwrap();
        assert_eq!(masks.len(), 3);
        assert!(typemask_accepts(masks[0], &NewtValue::Integer(1)));
        assert!(!typemask_accepts(masks[1], &NewtValue::Null));
        assert!(typemask_accepts(masks[2], &NewtValue::Integer(3)));
        assert!(typemask_accepts(masks[2], &NewtValue::Float(1.0)));
        assert!(typemask_accepts(masks[2], &NewtValue::Null));
        assert!(!typemask_accepts(masks[2], &NewtValue::Bool(true)));
    }

    #[test]
    fn typemask_rejects_unknown_letters() {
        assert!(parse_typemask("sz").is_none());
        assert!(parse_typemask("").is_none());
        assert!(parse_typemask("s|").is_none());
    }

    #[test]
    fn outer_cell_shares_and_closes() {
        let stack: StackHandle = Rc::new(RefCell::new(vec![
            NewtValue::Integer(1),
            NewtValue::Integer(2),
        ]));
        let cell = OuterCell::open(stack.clone(), 1);
        let alias = cell.clone();
        assert_eq!(cell.get(), NewtValue::Integer(2));
        alias.set(NewtValue::Integer(20));
        assert_eq!(stack.borrow()[1], NewtValue::Integer(20));

        cell.close();
        stack.borrow_mut()[1] = NewtValue::Null;
        assert_eq!(alias.get(), NewtValue::Integer(20));
        alias.set(NewtValue::Integer(30));
        assert_eq!(cell.get(), NewtValue::Integer(30));
        assert_eq!(stack.borrow()[1], NewtValue::Null);
    }
}
