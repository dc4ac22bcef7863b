/// Side threads: running calls on them, suspending from natives and
/// delivering wakeup values.
use super::support::{error_text, run, Asm};
use crate::newt_value::{NativeReturn, NewtValue};
use crate::newt_vm::{
    Instruction, NewtResult, NewtVm, Op, ThreadReturn, ThreadStatus, VmContext,
};

fn pause(_ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    Ok(NativeReturn::Suspend)
}

/// Calls its bound callable; a suspension inside must be refused.
fn relay(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let Some(target) = ctx.free_var(0) else {
        return Err(ctx.raise("missing free variable"));
    };
    let root = ctx.root_table();
    let value = ctx.call_value(&target, root, &[])?;
    Ok(NativeReturn::Value(value))
}

#[test]
fn test_side_thread_runs_to_completion() {
    let mut vm = NewtVm::open_default();
    let mut a = Asm::new(&mut vm, "seven");
    a.emit(Instruction::ab(Op::LoadInt, 1, 7));
    a.emit(Instruction::ab(Op::Return, 0, 1));
    let f = vm.closure_from_proto(a.build());

    let thread = vm.new_thread(64);
    assert_eq!(vm.thread_status(&thread).unwrap(), ThreadStatus::Idle);
    let root = vm.root_table();
    let outcome = vm.thread_call(&thread, &f, root, &[]).unwrap();
    assert_eq!(outcome, ThreadReturn::Returned(NewtValue::Integer(7)));
    assert_eq!(vm.thread_status(&thread).unwrap(), ThreadStatus::Idle);
}

#[test]
fn test_suspend_and_wakeup_in_script_frame() {
    let mut vm = NewtVm::open_default();
    let pause_fn = vm.new_native_closure(pause);

    // The wakeup value lands in the register the suspending call was
    // targeting.
    let mut a = Asm::new(&mut vm, "waiter");
    let lp = a.lit(pause_fn);
    a.emit(Instruction::ab(Op::LoadLiteral, 1, lp));
    a.emit(Instruction::ab(Op::Move, 3, 0));
    a.emit(Instruction::new(Op::Call, 2, 1, 3, 1));
    a.emit(Instruction::ab(Op::Return, 0, 2));
    let f = vm.closure_from_proto(a.build());

    let thread = vm.new_thread(64);
    let root = vm.root_table();
    let outcome = vm.thread_call(&thread, &f, root, &[]).unwrap();
    assert_eq!(outcome, ThreadReturn::Suspended);
    assert_eq!(vm.thread_status(&thread).unwrap(), ThreadStatus::Suspended);

    let outcome = vm
        .thread_wakeup(&thread, Some(NewtValue::Integer(5)))
        .unwrap();
    assert_eq!(outcome, ThreadReturn::Returned(NewtValue::Integer(5)));
    assert_eq!(vm.thread_status(&thread).unwrap(), ThreadStatus::Idle);
}

#[test]
fn test_root_native_suspend() {
    let mut vm = NewtVm::open_default();
    let pause_fn = vm.new_native_closure(pause);
    let thread = vm.new_thread(64);
    let root = vm.root_table();

    // With no script frame below, the wakeup value comes straight back.
    let outcome = vm.thread_call(&thread, &pause_fn, root, &[]).unwrap();
    assert_eq!(outcome, ThreadReturn::Suspended);
    let outcome = vm
        .thread_wakeup(&thread, Some(NewtValue::Integer(9)))
        .unwrap();
    assert_eq!(outcome, ThreadReturn::Returned(NewtValue::Integer(9)));
}

#[test]
fn test_main_thread_cannot_suspend() {
    let mut vm = NewtVm::open_default();
    let pause_fn = vm.new_native_closure(pause);
    let root = vm.root_table();
    assert!(vm.call(&pause_fn, root, &[]).is_err());
    assert_eq!(error_text(&vm), "cannot suspend the main thread");
}

#[test]
fn test_thread_state_gates() {
    let mut vm = NewtVm::open_default();
    let pause_fn = vm.new_native_closure(pause);
    let thread = vm.new_thread(64);
    let root = vm.root_table();

    assert!(vm.thread_wakeup(&thread, None).is_err());
    assert_eq!(error_text(&vm), "thread is not suspended");

    vm.thread_call(&thread, &pause_fn, root.clone(), &[]).unwrap();
    assert!(vm.thread_call(&thread, &pause_fn, root, &[]).is_err());
    assert_eq!(error_text(&vm), "thread is already running or suspended");

    assert!(vm.thread_status(&NewtValue::Integer(1)).is_err());
    assert_eq!(error_text(&vm), "expected a thread");
}

#[test]
fn test_suspend_through_native_call_refused() {
    let mut vm = NewtVm::open_default();
    let pause_fn = vm.new_native_closure(pause);
    let relay_fn = vm.new_native_closure_with(relay, vec![pause_fn]);
    let thread = vm.new_thread(64);
    let root = vm.root_table();

    assert!(vm.thread_call(&thread, &relay_fn, root, &[]).is_err());
    assert_eq!(
        error_text(&vm),
        "cannot suspend through native calls or metamethods"
    );
}

#[test]
fn test_threads_share_the_root_table() {
    let mut vm = NewtVm::open_default();
    let root = vm.root_table();
    let k = vm.intern("shared");
    vm.new_slot(&root, k.clone(), NewtValue::Integer(1)).unwrap();

    // A side thread reads the same globals the main thread sees.
    let mut a = Asm::new(&mut vm, "reader");
    let lk = a.lit_str(&mut vm, "shared");
    a.emit(Instruction::ab(Op::LoadRoot, 1, 0));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, lk));
    a.emit(Instruction::new(Op::Get, 3, 1, 2, 0));
    a.emit(Instruction::ab(Op::Return, 0, 3));
    let f = vm.closure_from_proto(a.build());
    let thread = vm.new_thread(64);
    let outcome = vm.thread_call(&thread, &f, root, &[]).unwrap();
    assert_eq!(outcome, ThreadReturn::Returned(NewtValue::Integer(1)));

    // And still runs fine on the main thread.
    let mut a = Asm::new(&mut vm, "reader2");
    let lk = a.lit_str(&mut vm, "shared");
    a.emit(Instruction::ab(Op::LoadRoot, 1, 0));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, lk));
    a.emit(Instruction::new(Op::Get, 3, 1, 2, 0));
    a.emit(Instruction::ab(Op::Return, 0, 3));
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(1));
}
