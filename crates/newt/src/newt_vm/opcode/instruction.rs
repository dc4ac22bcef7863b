use super::Op;

/// Sentinel for "no target register".
pub const ARG_NONE: u8 = 0xFF;

/// One fixed-width instruction: an operation plus four operands.
///
/// `a1` is the wide operand and carries signed jumps, literal indexes and
/// immediate integers; the byte operands address registers and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub a0: u8,
    pub a1: i32,
    pub a2: u8,
    pub a3: u8,
}

impl Instruction {
    #[inline(always)]
    pub const fn new(op: Op, a0: u8, a1: i32, a2: u8, a3: u8) -> Self {
        Self { op, a0, a1, a2, a3 }
    }

    /// op with only the wide operand.
    #[inline(always)]
    pub const fn wide(op: Op, a1: i32) -> Self {
        Self::new(op, 0, a1, 0, 0)
    }

    /// op with a target register and the wide operand.
    #[inline(always)]
    pub const fn ab(op: Op, a0: u8, a1: i32) -> Self {
        Self::new(op, a0, a1, 0, 0)
    }

    /// Three-operand form: target, wide, register.
    #[inline(always)]
    pub const fn abc(op: Op, a0: u8, a1: i32, a2: u8) -> Self {
        Self::new(op, a0, a1, a2, 0)
    }
}
