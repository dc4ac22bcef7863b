mod instruction;

pub use instruction::{ARG_NONE, Instruction};

/// Bytecode operations.
///
/// Register references are relative to the current frame base. `a1` is
/// the wide operand (signed 32-bit); `a0`, `a2`, `a3` are byte operands.
/// `ARG_NONE` (0xFF) marks an unused target register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Debug hook line event; a1 = source line.
    Line = 0,
    /// R[a0] = literals[a1]
    LoadLiteral,
    /// R[a0] = a1 as Integer
    LoadInt,
    /// R[a0] = a1 != 0
    LoadBool,
    /// R[a0 .. a0+a1) = Null
    LoadNulls,
    /// R[a0] = R[a1]
    Move,
    /// R[a0] = the root table
    LoadRoot,
    /// a3 = NEWOBJ_*; table: a1 = capacity hint; array: a1 = length;
    /// class: a1 = base register or -1, a2 = attributes register or ARG_NONE
    NewObj,
    /// array R[a0] append R[a1]
    AppendArray,
    /// create slot R[a2] = R[a3] in R[a1]; if a0 != ARG_NONE, R[a0] = R[a3]
    NewSlot,
    /// class slot with attributes: a0 = NEWSLOT_FLAG_*, a1 = class,
    /// a2 = key register (attributes at a2 - 1), a3 = value
    NewSlotA,
    /// R[a1][R[a2]] = R[a3]; if a0 != ARG_NONE, R[a0] = R[a3]
    Set,
    /// R[a0] = R[a1][R[a2]]; a3 = GET_FLAG_* bits
    Get,
    /// R[a0] = delete R[a1][R[a2]] (yields the removed value)
    DeleteSlot,
    /// R[a0] = outers[a1]
    GetOuter,
    /// outers[a1] = R[a2]; if a0 != ARG_NONE, R[a0] = R[a2]
    SetOuter,
    /// R[a0] = R[a1](R[a2] .. R[a2]+a3); a3 counts arguments including
    /// the environment object at R[a2]. The slot below R[a2] must be
    /// free; the callee is parked there for the duration of the call
    Call,
    /// R[a0] = R[a2] == R[a1]
    Equals,
    /// R[a0] = R[a2] != R[a1]
    NotEquals,
    /// a3 = CMP_*; R[a0] = R[a2] <op> R[a1]
    Cmp,
    /// a3 = ascii of + - * / %; R[a0] = R[a2] <op> R[a1]
    Arith,
    /// R[a0] = -R[a1]
    Neg,
    /// R[a0] = !truthy(R[a1])
    Not,
    /// R[a0] = ~R[a1] (integers only)
    BwNot,
    /// a3 = BW_*; R[a0] = R[a2] <op> R[a1] (integers only)
    Bitw,
    /// ip += a1
    Jmp,
    /// if !truthy(R[a0]): ip += a1
    JmpFalse,
    /// if !truthy(R[a2]): R[a0] = R[a2], ip += a1
    And,
    /// if truthy(R[a2]): R[a0] = R[a2], ip += a1
    Or,
    /// R[a0] = object R[a1] has slot R[a2]
    Exists,
    /// R[a0] = R[a2] is an instance of class R[a1]
    InstanceOf,
    /// R[a0] = type name of R[a1]
    TypeOf,
    /// R[a0] = shallow clone of R[a1]
    Clone,
    /// R[a0] = closure over protos[a1] of the running function
    Closure,
    /// return R[a1] if a0 != ARG_NONE, else return no value
    Return,
    /// suspend the owning generator; yields R[a1] if a0 != ARG_NONE
    Yield,
    /// R[a0] = resume generator R[a1]
    Resume,
    /// iterate R[a0]: key -> R[a2], value -> R[a2+1], cursor -> R[a2+2];
    /// jumps a1 past the loop body when exhausted
    Foreach,
    /// push trap: error target R[a0], handler at ip + a1
    PushTrap,
    /// pop a0 traps
    PopTrap,
    /// raise R[a0] as the error value
    Throw,
    /// close open outers aliasing slots >= base + a1
    Close,
    /// R[a0] = base class of the running closure
    GetBase,
}

impl Op {
    pub fn from_u8(value: u8) -> Option<Op> {
        use Op::*;
        const OPS: [Op; 43] = [
            Line, LoadLiteral, LoadInt, LoadBool, LoadNulls, Move, LoadRoot, NewObj, AppendArray,
            NewSlot, NewSlotA, Set, Get, DeleteSlot, GetOuter, SetOuter, Call, Equals, NotEquals,
            Cmp, Arith, Neg, Not, BwNot, Bitw, Jmp, JmpFalse, And, Or, Exists, InstanceOf, TypeOf,
            Clone, Closure, Return, Yield, Resume, Foreach, PushTrap, PopTrap, Throw, Close,
            GetBase,
        ];
        OPS.get(value as usize).copied()
    }
}

// NewObj kinds (a3)
pub const NEWOBJ_TABLE: u8 = 0;
pub const NEWOBJ_ARRAY: u8 = 1;
pub const NEWOBJ_CLASS: u8 = 2;
/// Class that refuses instantiation.
pub const NEWOBJ_CLASS_ABSTRACT: u8 = 3;

// Get flags (a3)
/// The lookup is through the implicit environment object; a miss falls
/// back to the root table before erroring.
pub const GET_FLAG_THIS: u8 = 0x01;
/// Skip delegate and metamethod fallback.
pub const GET_FLAG_RAW: u8 = 0x02;

// NewSlotA flags (a0)
pub const NEWSLOT_FLAG_ATTRS: u8 = 0x01;
pub const NEWSLOT_FLAG_STATIC: u8 = 0x02;

// Cmp kinds (a3)
pub const CMP_GREATER: u8 = 0;
pub const CMP_GREATER_EQ: u8 = 1;
pub const CMP_LESS: u8 = 2;
pub const CMP_LESS_EQ: u8 = 3;
/// Three-way compare: yields -1 / 0 / 1 as an Integer.
pub const CMP_3WAY: u8 = 4;

// Bitwise kinds (a3)
pub const BW_AND: u8 = 0;
pub const BW_OR: u8 = 1;
pub const BW_XOR: u8 = 2;
pub const BW_SHL: u8 = 3;
pub const BW_SHR: u8 = 4;
pub const BW_USHR: u8 = 5;
