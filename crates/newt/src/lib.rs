// Newt Runtime
// An embeddable bytecode VM for the Newt scripting language

#[cfg(test)]
mod test;

pub mod gc;
pub mod newt_value;
pub mod newt_vm;

pub use gc::{GcRef, GcWeak, StringInterner};
pub use newt_value::{
    FunctionProto, GeneratorState, NativeClosure, NativeReturn, NewtArray, NewtClass, NewtClosure,
    NewtGenerator, NewtInstance, NewtString, NewtTable, NewtUserData, NewtValue, OuterCell,
    OuterDesc, OuterKind, ParamCheck, ReleaseHook, ValueKind, WeakRef,
};
pub use newt_vm::{
    DebugHook, HookEvent, Instruction, MetaMethod, NativeFn, NewtError, NewtResult, NewtThread,
    NewtVm, Op, PrintFn, SerializeError, StackInfo, ThreadReturn, ThreadStatus, VmContext,
    VmOptions, ARG_NONE,
};
