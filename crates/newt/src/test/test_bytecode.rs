/// Closure serialization: flattening to bytes, restoring, environment
/// binding and the shapes that refuse to travel.
use super::support::{error_text, run, Asm};
use crate::newt_value::{NativeReturn, NewtValue};
use crate::newt_vm::{Instruction, NewtResult, NewtVm, Op, VmContext};

fn noop(_ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    Ok(NativeReturn::NoValue)
}

#[test]
fn test_round_trip_restores_behavior() {
    let mut vm = NewtVm::open_default();

    // A nested capturing function and a float literal ride along in the
    // prototype tree.
    let mut child = Asm::new(&mut vm, "plus_ten");
    child.capture_local(&mut vm, "x", 1);
    child.emit(Instruction::ab(Op::GetOuter, 1, 0));
    child.emit(Instruction::ab(Op::LoadInt, 2, 10));
    child.emit(Instruction::new(Op::Arith, 3, 2, 1, b'+'));
    child.emit(Instruction::ab(Op::Return, 0, 3));

    let mut a = Asm::new(&mut vm, "adder");
    a.param(&mut vm, "x");
    let ci = a.child(child);
    let lf = a.lit(NewtValue::Float(0.5));
    a.line(0, 1);
    a.emit(Instruction::ab(Op::Closure, 2, ci));
    a.emit(Instruction::ab(Op::Move, 4, 0));
    a.emit(Instruction::new(Op::Call, 3, 2, 4, 1));
    a.emit(Instruction::ab(Op::LoadLiteral, 4, lf));
    a.emit(Instruction::new(Op::Arith, 5, 3, 4, b'+'));
    a.emit(Instruction::ab(Op::Return, 0, 5));
    let f = vm.closure_from_proto(a.build());

    let bytes = vm.write_closure(&f).unwrap();
    drop(f);
    let g = vm.read_closure(&bytes, None).unwrap();
    let root = vm.root_table();
    let args = [NewtValue::Integer(32)];
    assert_eq!(vm.call(&g, root, &args).unwrap(), NewtValue::Float(42.5));
}

#[test]
fn test_read_closure_binds_an_environment() {
    let mut vm = NewtVm::open_default();
    let mut a = Asm::new(&mut vm, "who");
    a.emit(Instruction::ab(Op::Return, 0, 0));
    let f = vm.closure_from_proto(a.build());
    let bytes = vm.write_closure(&f).unwrap();

    let env = vm.new_table();
    let g = vm.read_closure(&bytes, Some(&env)).unwrap();
    let root = vm.root_table();
    assert_eq!(vm.call(&g, root.clone(), &[]).unwrap(), env);

    // Restored without a binding it answers with the caller's receiver.
    let h = vm.read_closure(&bytes, None).unwrap();
    assert_eq!(vm.call(&h, root.clone(), &[]).unwrap(), root);
}

#[test]
fn test_only_plain_script_closures_serialize() {
    let mut vm = NewtVm::open_default();

    let nc = vm.new_native_closure(noop);
    assert!(vm.write_closure(&nc).is_err());
    assert_eq!(error_text(&vm), "only script closures can be serialized");
    assert!(vm.write_closure(&NewtValue::Integer(3)).is_err());
    assert_eq!(error_text(&vm), "only script closures can be serialized");

    // A closure holding captured cells refers to live frames and cannot
    // be flattened.
    let mut counter = Asm::new(&mut vm, "counter");
    counter.capture_local(&mut vm, "seed", 1);
    counter.emit(Instruction::ab(Op::GetOuter, 1, 0));
    counter.emit(Instruction::ab(Op::Return, 0, 1));
    let mut maker = Asm::new(&mut vm, "maker");
    let ci = maker.child(counter);
    maker.emit(Instruction::ab(Op::LoadInt, 1, 100));
    maker.emit(Instruction::ab(Op::Closure, 2, ci));
    maker.emit(Instruction::ab(Op::Return, 0, 2));
    let captured = run(&mut vm, maker, &[]).unwrap();

    assert!(vm.write_closure(&captured).is_err());
    assert_eq!(
        error_text(&vm),
        "cannot serialize a closure with captured outer variables"
    );
}

#[test]
fn test_unserializable_literals_are_refused() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    let mut a = Asm::new(&mut vm, "holder");
    let lt = a.lit(t);
    a.emit(Instruction::ab(Op::LoadLiteral, 1, lt));
    a.emit(Instruction::ab(Op::Return, 0, 1));
    let f = vm.closure_from_proto(a.build());

    assert!(vm.write_closure(&f).is_err());
    assert_eq!(error_text(&vm), "a table literal cannot be serialized");
}

#[test]
fn test_bad_streams_are_rejected() {
    let mut vm = NewtVm::open_default();
    assert!(vm.read_closure(b"not bytecode", None).is_err());
    assert_eq!(error_text(&vm), "not a newt bytecode stream");

    let mut a = Asm::new(&mut vm, "whole");
    a.emit(Instruction::ab(Op::LoadInt, 1, 1));
    a.emit(Instruction::ab(Op::Return, 0, 1));
    let f = vm.closure_from_proto(a.build());
    let bytes = vm.write_closure(&f).unwrap();

    let cut = &bytes[..bytes.len() / 2];
    assert!(vm.read_closure(cut, None).is_err());
    assert_eq!(error_text(&vm), "bytecode stream is truncated");

    let mut wrong = bytes.clone();
    wrong[5] = 9;
    assert!(vm.read_closure(&wrong, None).is_err());
    assert_eq!(error_text(&vm), "unsupported bytecode version 9");
}
