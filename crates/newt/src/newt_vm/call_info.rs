use crate::gc::GcWeak;
use crate::newt_value::{NewtGenerator, NewtValue};

/// Discard marker for a call's result register.
pub const TARGET_NONE: i32 = -1;

/// One activation record. The executing closure is also kept in the slot
/// right below the frame's base, so a stack walk alone reaches it.
pub struct CallInfo {
    pub closure: NewtValue,
    pub ip: usize,
    /// Caller frame geometry to restore on return.
    pub prev_base: usize,
    pub prev_top: usize,
    /// Register in the caller's frame that receives the result;
    /// TARGET_NONE discards it.
    pub target: i32,
    /// Traps owned by this frame, counted so unwinding knows how many of
    /// the thread's trap stack belong here.
    pub n_traps: usize,
    /// Outermost frame of one dispatch invocation; returning from it
    /// leaves the dispatch loop.
    pub root: bool,
    /// Backref to the generator this frame runs inside of, so teardown
    /// can kill it. Weak: the generator owns the frame only while
    /// suspended.
    pub generator: Option<GcWeak<NewtGenerator>>,
}

impl CallInfo {
    pub fn new(closure: NewtValue, prev_base: usize, prev_top: usize, target: i32) -> Self {
        Self {
            closure,
            ip: 0,
            prev_base,
            prev_top,
            target,
            n_traps: 0,
            root: false,
            generator: None,
        }
    }
}

/// Error trap installed by `push_trap`: where to resume, the stack
/// geometry to restore, and the frame register that receives the error
/// value.
#[derive(Debug, Clone, Copy)]
pub struct Trap {
    pub ip: usize,
    pub stack_base: usize,
    pub stack_size: usize,
    pub target: u8,
}
