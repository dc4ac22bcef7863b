use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::{Marker, Trace};
use crate::newt_value::{NewtValue, OuterCell};
use crate::newt_vm::call_info::{CallInfo, Trap};
use crate::newt_vm::{NewtError, NewtResult};

pub type StackHandle = Rc<RefCell<Vec<NewtValue>>>;
pub type ControlHandle = Rc<RefCell<ThreadControl>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// No frames; ready for a fresh call.
    Idle,
    Running,
    /// Parked mid-call, waiting for a wakeup.
    Suspended,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Idle => "idle",
            ThreadStatus::Running => "running",
            ThreadStatus::Suspended => "suspended",
        }
    }
}

/// Mutable execution state of one thread. Dispatch borrows this once at
/// the host boundary and threads it through nested calls as `&mut`, so
/// the collector can recognize a thread that is mid-flight (its borrow
/// fails) and fall back to tracing the value stack alone.
pub struct ThreadControl {
    pub call_stack: Vec<CallInfo>,
    pub traps: Vec<Trap>,
    pub stack_base: usize,
    pub stack_top: usize,
    pub status: ThreadStatus,
    pub open_outers: Vec<OuterCell>,
    /// Nonzero while a metamethod runs; stack reallocation is refused.
    pub no_resize: u32,
    /// Recursion depth of host re-entry, bounded separately from frames.
    pub native_depth: usize,
    /// Register (frame-relative) awaiting a wakeup value, when suspended
    /// from inside a native call.
    pub suspended_target: Option<i32>,
}

impl ThreadControl {
    fn new() -> Self {
        Self {
            call_stack: Vec::new(),
            traps: Vec::new(),
            stack_base: 0,
            stack_top: 0,
            status: ThreadStatus::Idle,
            open_outers: Vec::new(),
            no_resize: 0,
            native_depth: 0,
            suspended_target: None,
        }
    }

    #[inline]
    pub fn current_frame(&self) -> Option<&CallInfo> {
        self.call_stack.last()
    }

    #[inline]
    pub fn current_frame_mut(&mut self) -> Option<&mut CallInfo> {
        self.call_stack.last_mut()
    }

    #[inline]
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Find or create the shared cell for a live frame slot.
    pub fn capture_outer(&mut self, stack: &StackHandle, slot: usize) -> OuterCell {
        for cell in &self.open_outers {
            if cell.is_open_at(stack, slot) {
                return cell.clone();
            }
        }
        let cell = OuterCell::open(stack.clone(), slot);
        self.open_outers.push(cell.clone());
        cell
    }

    /// Close every cell open at or above `from_slot` on this stack.
    pub fn close_outers_from(&mut self, stack: &StackHandle, from_slot: usize) {
        self.open_outers.retain(|cell| {
            match cell.open_slot(stack) {
                Some(slot) if slot >= from_slot => {
                    cell.close();
                    false
                }
                _ => true,
            }
        });
    }

    /// Detach cells open inside `[base, top)` for a suspending frame,
    /// yielding (relative slot, cell) pairs with each cell closed against
    /// its current value.
    pub fn detach_outers_in(
        &mut self,
        stack: &StackHandle,
        base: usize,
        top: usize,
    ) -> Vec<(usize, OuterCell)> {
        let mut detached = Vec::new();
        self.open_outers.retain(|cell| {
            match cell.open_slot(stack) {
                Some(slot) if slot >= base && slot < top => {
                    cell.close();
                    detached.push((slot - base, cell.clone()));
                    false
                }
                _ => true,
            }
        });
        detached
    }

    /// Re-open previously detached cells against a re-spliced window.
    pub fn reattach_outers(
        &mut self,
        stack: &StackHandle,
        base: usize,
        detached: Vec<(usize, OuterCell)>,
    ) {
        for (rel, cell) in detached {
            let slot = base + rel;
            stack.borrow_mut()[slot] = cell.get();
            cell.reopen(stack.clone(), slot);
            self.open_outers.push(cell);
        }
    }
}

/// One execution thread: a value stack and its control block, each behind
/// its own cell so they can be borrowed independently of the thread's
/// collectable body.
pub struct NewtThread {
    pub(crate) stack: StackHandle,
    pub(crate) control: ControlHandle,
    pub is_main: bool,
}

impl NewtThread {
    pub(crate) fn new(initial_stack_size: usize, is_main: bool) -> Self {
        let mut stack = Vec::new();
        stack.resize(initial_stack_size, NewtValue::Null);
        Self {
            stack: Rc::new(RefCell::new(stack)),
            control: Rc::new(RefCell::new(ThreadControl::new())),
            is_main,
        }
    }

    #[inline]
    pub(crate) fn stack_handle(&self) -> StackHandle {
        self.stack.clone()
    }

    #[inline]
    pub(crate) fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn status(&self) -> ThreadStatus {
        match self.control.try_borrow() {
            Ok(ctl) => ctl.status,
            Err(_) => ThreadStatus::Running,
        }
    }
}

/// Make room for `top + extra` slots, filling new ones with Null.
/// Growth is refused while a metamethod is on the stack and capped by
/// the configured limit.
pub fn reserve_stack(
    stack: &StackHandle,
    ctl: &ThreadControl,
    top: usize,
    extra: usize,
    max_stack_size: usize,
) -> NewtResult<()> {
    let needed = top + extra;
    let len = stack.borrow().len();
    if needed <= len {
        return Ok(());
    }
    if ctl.no_resize > 0 {
        return Err(NewtError::StackOverflow);
    }
    if needed > max_stack_size {
        return Err(NewtError::StackOverflow);
    }
    let new_len = (len.max(2) * 2).max(needed).min(max_stack_size);
    stack.borrow_mut().resize(new_len, NewtValue::Null);
    Ok(())
}

impl Trace for NewtThread {
    fn trace(&self, marker: &mut Marker) {
        if let Ok(stack) = self.stack.try_borrow() {
            marker.mark_values(&stack);
        }
        // The control block is unborrowable exactly when this thread is
        // executing; its frames' closures are then covered by the stack:
        // call frames park theirs below their base, and a resumed
        // generator frame's closure is held by the generator object in
        // the resuming frame's window.
        if let Ok(ctl) = self.control.try_borrow() {
            for ci in &ctl.call_stack {
                marker.mark_value(&ci.closure);
            }
            for cell in &ctl.open_outers {
                cell.trace_into(marker);
            }
        }
    }

    fn finalize(&mut self) {
        if let Ok(mut ctl) = self.control.try_borrow_mut() {
            let cells: Vec<OuterCell> = ctl.open_outers.drain(..).collect();
            for cell in cells {
                cell.close();
            }
            ctl.call_stack.clear();
            ctl.traps.clear();
            ctl.stack_base = 0;
            ctl.stack_top = 0;
            ctl.status = ThreadStatus::Idle;
            ctl.suspended_target = None;
        }
        if let Ok(mut stack) = self.stack.try_borrow_mut() {
            stack.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_returns_the_same_cell_per_slot() {
        let thread = NewtThread::new(8, true);
        let stack = thread.stack_handle();
        let mut ctl = thread.control.borrow_mut();
        let a = ctl.capture_outer(&stack, 3);
        let b = ctl.capture_outer(&stack, 3);
        let c = ctl.capture_outer(&stack, 4);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(ctl.open_outers.len(), 2);
    }

    #[test]
    fn closing_from_a_slot_detaches_cells_above_it() {
        let thread = NewtThread::new(8, true);
        let stack = thread.stack_handle();
        stack.borrow_mut()[2] = NewtValue::Integer(5);
        stack.borrow_mut()[5] = NewtValue::Integer(50);
        let mut ctl = thread.control.borrow_mut();
        let low = ctl.capture_outer(&stack, 2);
        let high = ctl.capture_outer(&stack, 5);

        ctl.close_outers_from(&stack, 4);
        assert_eq!(ctl.open_outers.len(), 1);
        assert_eq!(high.get(), NewtValue::Integer(50));
        stack.borrow_mut()[5] = NewtValue::Null;
        assert_eq!(high.get(), NewtValue::Integer(50));
        assert_eq!(low.get(), NewtValue::Integer(5));
        stack.borrow_mut()[2] = NewtValue::Integer(6);
        assert_eq!(low.get(), NewtValue::Integer(6));
    }

    #[test]
    fn reserve_refuses_growth_inside_metamethods() {
        let thread = NewtThread::new(4, true);
        let stack = thread.stack_handle();
        let mut ctl = thread.control.borrow_mut();
        assert!(reserve_stack(&stack, &ctl, 2, 10, 1000).is_ok());
        assert!(stack.borrow().len() >= 12);

        ctl.no_resize = 1;
        let len = stack.borrow().len();
        assert!(reserve_stack(&stack, &ctl, len, 1, 1000).is_err());
        assert!(reserve_stack(&stack, &ctl, 0, len, 1000).is_ok());
    }
}
