/// The foreach protocol over every iterable shape.
use super::support::{error_text, run, Asm};
use crate::newt_value::{NativeReturn, NewtValue};
use crate::newt_vm::{
    Instruction, NewtResult, NewtVm, Op, VmContext, ARG_NONE, NEWOBJ_ARRAY, NEWOBJ_TABLE,
};

/// `_nexti`: keys 0, 1, 2, then done.
fn nexti_keys(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let prev = ctx.arg(1);
    let next = match prev {
        NewtValue::Null => 0,
        NewtValue::Integer(i) if i < 2 => i + 1,
        _ => return Ok(NativeReturn::Value(NewtValue::Null)),
    };
    Ok(NativeReturn::Value(NewtValue::Integer(next)))
}

/// `_get`: every key maps to ten times itself.
fn geti_tens(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let key = ctx.arg(1);
    match key.as_integer() {
        Some(i) => Ok(NativeReturn::Value(NewtValue::Integer(i * 10))),
        None => Err(ctx.raise_value(NewtValue::Null)),
    }
}

/// Loop skeleton: iterate the container literal, folding values with
/// `+` into register 2.
fn sum_program(vm: &mut NewtVm, container: NewtValue) -> Asm {
    let mut a = Asm::new(vm, "fold");
    let lc = a.lit(container);
    a.emit(Instruction::ab(Op::LoadLiteral, 1, lc));
    a.emit(Instruction::ab(Op::LoadInt, 2, 0));
    a.emit(Instruction::abc(Op::Foreach, 1, 2, 3));
    a.emit(Instruction::new(Op::Arith, 2, 4, 2, b'+'));
    a.emit(Instruction::wide(Op::Jmp, -3));
    a.emit(Instruction::ab(Op::Return, 0, 2));
    a
}

#[test]
fn test_foreach_visits_array_in_order() {
    let mut vm = NewtVm::open_default();
    let arr = vm.new_array(0);
    {
        let mut body = arr.as_array().unwrap().borrow_mut();
        body.push(NewtValue::Integer(7));
        body.push(NewtValue::Integer(8));
        body.push(NewtValue::Integer(9));
    }

    let mut a = Asm::new(&mut vm, "collect");
    let lc = a.lit(arr);
    a.emit(Instruction::ab(Op::LoadLiteral, 1, lc));
    a.emit(Instruction::new(Op::NewObj, 2, 0, 0, NEWOBJ_ARRAY));
    a.emit(Instruction::abc(Op::Foreach, 1, 2, 3));
    a.emit(Instruction::ab(Op::AppendArray, 2, 4));
    a.emit(Instruction::wide(Op::Jmp, -3));
    a.emit(Instruction::ab(Op::Return, 0, 2));
    let result = run(&mut vm, a, &[]).unwrap();
    assert_eq!(
        result.as_array().unwrap().borrow().to_vec(),
        vec![
            NewtValue::Integer(7),
            NewtValue::Integer(8),
            NewtValue::Integer(9),
        ]
    );
}

#[test]
fn test_foreach_walks_string_bytes() {
    let mut vm = NewtVm::open_default();
    let s = vm.intern("ab");
    let a = sum_program(&mut vm, s);
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(195));
}

#[test]
fn test_foreach_yields_table_pairs() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    for (name, value) in [("a", 1), ("b", 2), ("c", 3)] {
        let key = vm.intern(name);
        vm.new_slot(&t, key, NewtValue::Integer(value)).unwrap();
    }

    // Copy every pair into a fresh table and compare from the host.
    let mut a = Asm::new(&mut vm, "pairs");
    let lc = a.lit(t);
    a.emit(Instruction::ab(Op::LoadLiteral, 1, lc));
    a.emit(Instruction::new(Op::NewObj, 7, 0, 0, NEWOBJ_TABLE));
    a.emit(Instruction::abc(Op::Foreach, 1, 2, 3));
    a.emit(Instruction::new(Op::NewSlot, ARG_NONE, 7, 3, 4));
    a.emit(Instruction::wide(Op::Jmp, -3));
    a.emit(Instruction::ab(Op::Return, 0, 7));
    let result = run(&mut vm, a, &[]).unwrap();
    assert_eq!(result.as_table().unwrap().borrow().len(), 3);
    for (name, value) in [("a", 1), ("b", 2), ("c", 3)] {
        let key = vm.intern(name);
        assert_eq!(vm.get(&result, &key).unwrap(), NewtValue::Integer(value));
    }
}

#[test]
fn test_foreach_covers_class_members() {
    let mut vm = NewtVm::open_default();
    let cls = vm.new_class(None, false).unwrap();
    let a_key = vm.intern("a");
    vm.new_slot(&cls, a_key, NewtValue::Integer(1)).unwrap();
    let b_key = vm.intern("b");
    vm.new_slot(&cls, b_key, NewtValue::Integer(2)).unwrap();

    let a = sum_program(&mut vm, cls);
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(3));
}

#[test]
fn test_foreach_drives_instances_through_nexti() {
    let mut vm = NewtVm::open_default();
    let cls = vm.new_class(None, false).unwrap();
    let nexti = vm.intern("_nexti");
    let h = vm.new_native_closure(nexti_keys);
    vm.new_slot(&cls, nexti, h).unwrap();
    let get = vm.intern("_get");
    let h = vm.new_native_closure(geti_tens);
    vm.new_slot(&cls, get, h).unwrap();
    let root = vm.root_table();
    let inst = vm.call(&cls, root, &[]).unwrap();

    let a = sum_program(&mut vm, inst);
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(30));
}

#[test]
fn test_foreach_pumps_generators() {
    let mut vm = NewtVm::open_default();
    let mut g = Asm::new(&mut vm, "gen");
    g.generator();
    g.emit(Instruction::ab(Op::LoadInt, 1, 10));
    g.emit(Instruction::ab(Op::Yield, 0, 1));
    g.emit(Instruction::ab(Op::LoadInt, 1, 20));
    g.emit(Instruction::ab(Op::Yield, 0, 1));
    g.emit(Instruction::ab(Op::LoadInt, 1, 999));
    g.emit(Instruction::ab(Op::Return, 0, 1));
    let gf = vm.closure_from_proto(g.build());
    let root = vm.root_table();
    let r#gen = vm.call(&gf, root, &[]).unwrap();

    // Yields drive the loop; the final return value is dropped.
    let a = sum_program(&mut vm, r#gen);
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(30));
}

#[test]
fn test_foreach_rejects_scalars() {
    let mut vm = NewtVm::open_default();
    let a = sum_program(&mut vm, NewtValue::Integer(5));
    assert!(run(&mut vm, a, &[]).is_err());
    assert_eq!(error_text(&vm), "cannot iterate a integer");
}
