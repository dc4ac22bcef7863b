/// Slot access: raw hits, delegation, metamethod fallback and the
/// receiver/root lookup rules.
use super::support::{error_text, run, Asm};
use crate::newt_value::{set_table_delegate, NativeReturn, NewtValue};
use crate::newt_vm::{
    Instruction, NativeFn, NewtResult, NewtVm, Op, VmContext, ARG_NONE, GET_FLAG_RAW,
    GET_FLAG_THIS, NEWOBJ_ARRAY,
};

/// `_get` handler: serves "a", signals a clean miss for anything else.
fn mm_get(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let key = ctx.arg(1);
    let served = ctx.intern("a");
    if key == served {
        Ok(NativeReturn::Value(NewtValue::Integer(1)))
    } else {
        Err(ctx.raise_value(NewtValue::Null))
    }
}

/// `_get` handler that fails for real.
fn mm_get_boom(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    Err(ctx.raise("boom"))
}

/// `_set` handler: records the write into the root table.
fn mm_set(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let key = ctx.arg(1);
    let value = ctx.arg(2);
    let root = ctx.root_table();
    let k = ctx.intern("set_key");
    ctx.new_slot_value(&root, k, key, false)?;
    let v = ctx.intern("set_val");
    ctx.new_slot_value(&root, v, value, false)?;
    Ok(NativeReturn::NoValue)
}

/// `_newslot` handler: records the creation, does not insert.
fn mm_newslot(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let key = ctx.arg(1);
    let root = ctx.root_table();
    let k = ctx.intern("ns_key");
    ctx.new_slot_value(&root, k, key, false)?;
    Ok(NativeReturn::NoValue)
}

fn mm_delslot(_ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    Ok(NativeReturn::Value(NewtValue::Integer(123)))
}

fn mm_tostring(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let s = ctx.intern("custom");
    Ok(NativeReturn::Value(s))
}

/// `_cloned` handler: marks the copy and records the original.
fn mm_cloned(ctx: &mut VmContext) -> NewtResult<NativeReturn> {
    let clone = ctx.receiver();
    let original = ctx.arg(1);
    let marker = ctx.intern("copied");
    ctx.new_slot_value(&clone, marker, NewtValue::Bool(true), false)?;
    let root = ctx.root_table();
    let from = ctx.intern("cloned_from");
    ctx.new_slot_value(&root, from, original, false)?;
    Ok(NativeReturn::NoValue)
}

/// Table whose delegate carries `name` bound to `f`.
fn delegated_table(vm: &mut NewtVm, name: &str, f: NativeFn) -> NewtValue {
    let d = vm.new_table();
    let key = vm.intern(name);
    let native = vm.new_native_closure(f);
    vm.new_slot(&d, key, native).unwrap();
    let t = vm.new_table();
    let ok = set_table_delegate(
        t.as_table().unwrap(),
        Some(d.as_table().unwrap().clone()),
    );
    assert!(ok);
    t
}

#[test]
fn test_host_slot_round_trip() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    let hp = vm.intern("hp");
    vm.new_slot(&t, hp.clone(), NewtValue::Integer(10)).unwrap();
    assert_eq!(vm.get(&t, &hp).unwrap(), NewtValue::Integer(10));

    vm.set(&t, &hp, NewtValue::Integer(99)).unwrap();
    assert_eq!(vm.get(&t, &hp).unwrap(), NewtValue::Integer(99));

    assert_eq!(vm.delete_slot(&t, &hp).unwrap(), NewtValue::Integer(99));
    assert!(vm.get(&t, &hp).is_err());
    assert_eq!(error_text(&vm), "the index 'hp' does not exist");
}

#[test]
fn test_set_requires_existing_slot() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    let x = vm.intern("x");
    assert!(vm.set(&t, &x, NewtValue::Integer(1)).is_err());
    assert_eq!(error_text(&vm), "the index 'x' does not exist");
}

#[test]
fn test_null_key_rejected() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    assert!(vm
        .new_slot(&t, NewtValue::Null, NewtValue::Integer(1))
        .is_err());
    assert_eq!(error_text(&vm), "null cannot be used as index");
}

#[test]
fn test_delegate_chain_reads_and_writes() {
    let mut vm = NewtVm::open_default();
    let parent = vm.new_table();
    let k = vm.intern("k");
    vm.new_slot(&parent, k.clone(), NewtValue::Integer(1)).unwrap();
    let child = vm.new_table();
    assert!(set_table_delegate(
        child.as_table().unwrap(),
        Some(parent.as_table().unwrap().clone()),
    ));

    // Reads walk up; writes to an inherited slot land on the owner.
    assert_eq!(vm.get(&child, &k).unwrap(), NewtValue::Integer(1));
    vm.set(&child, &k, NewtValue::Integer(2)).unwrap();
    assert_eq!(
        parent.as_table().unwrap().borrow().get(&k),
        Some(NewtValue::Integer(2))
    );
    assert!(child.as_table().unwrap().borrow().get(&k).is_none());
}

#[test]
fn test_delegate_cycle_rejected() {
    let mut vm = NewtVm::open_default();
    let a = vm.new_table();
    let b = vm.new_table();
    assert!(set_table_delegate(
        a.as_table().unwrap(),
        Some(b.as_table().unwrap().clone()),
    ));
    assert!(!set_table_delegate(
        b.as_table().unwrap(),
        Some(a.as_table().unwrap().clone()),
    ));
}

#[test]
fn test_get_metamethod_and_clean_miss() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_get", mm_get);
    let a = vm.intern("a");
    assert_eq!(vm.get(&t, &a).unwrap(), NewtValue::Integer(1));

    // A clean miss falls through to the normal missing-index error.
    let b = vm.intern("b");
    assert!(vm.get(&t, &b).is_err());
    assert_eq!(error_text(&vm), "the index 'b' does not exist");
}

#[test]
fn test_get_metamethod_error_propagates() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_get", mm_get_boom);
    let key = vm.intern("anything");
    assert!(vm.get(&t, &key).is_err());
    assert_eq!(error_text(&vm), "boom");
}

#[test]
fn test_set_metamethod_intercepts_missing() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_set", mm_set);
    let key = vm.intern("x");
    vm.set(&t, &key, NewtValue::Integer(5)).unwrap();

    // The handler took the write; the table itself stays empty.
    assert!(t.as_table().unwrap().borrow().get(&key).is_none());
    let root = vm.root_table();
    let sk = vm.intern("set_key");
    assert_eq!(vm.get(&root, &sk).unwrap(), key);
    let sv = vm.intern("set_val");
    assert_eq!(vm.get(&root, &sv).unwrap(), NewtValue::Integer(5));
}

#[test]
fn test_newslot_metamethod_takes_over() {
    let mut vm = NewtVm::open_default();
    let t = vm.new_table();
    let y = vm.intern("y");
    vm.new_slot(&t, y.clone(), NewtValue::Integer(1)).unwrap();

    let d = vm.new_table();
    let name = vm.intern("_newslot");
    let native = vm.new_native_closure(mm_newslot);
    vm.new_slot(&d, name, native).unwrap();
    assert!(set_table_delegate(
        t.as_table().unwrap(),
        Some(d.as_table().unwrap().clone()),
    ));

    // Fresh keys go to the handler and are not inserted.
    let x = vm.intern("x");
    vm.new_slot(&t, x.clone(), NewtValue::Integer(2)).unwrap();
    assert!(t.as_table().unwrap().borrow().get(&x).is_none());
    let root = vm.root_table();
    let nk = vm.intern("ns_key");
    assert_eq!(vm.get(&root, &nk).unwrap(), x);

    // Keys the table already owns update in place.
    vm.new_slot(&t, y.clone(), NewtValue::Integer(3)).unwrap();
    assert_eq!(
        t.as_table().unwrap().borrow().get(&y),
        Some(NewtValue::Integer(3))
    );
}

#[test]
fn test_delslot_metamethod_takes_over() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_delslot", mm_delslot);
    let key = vm.intern("k");
    assert_eq!(vm.delete_slot(&t, &key).unwrap(), NewtValue::Integer(123));

    let plain = vm.new_table();
    let zzz = vm.intern("zzz");
    assert!(vm.delete_slot(&plain, &zzz).is_err());
    assert_eq!(error_text(&vm), "the index 'zzz' does not exist");
}

#[test]
fn test_this_writes_update_root() {
    let mut vm = NewtVm::open_default();
    let root = vm.root_table();
    let g = vm.intern("g");
    vm.new_slot(&root, g.clone(), NewtValue::Integer(1)).unwrap();

    let mut a = Asm::new(&mut vm, "this_set");
    let k = a.lit_str(&mut vm, "g");
    a.emit(Instruction::ab(Op::LoadLiteral, 1, k));
    a.emit(Instruction::ab(Op::LoadInt, 2, 77));
    a.emit(Instruction::new(Op::Set, ARG_NONE, 0, 1, 2));
    a.emit(Instruction::new(Op::Return, ARG_NONE, 0, 0, 0));

    // Receiver is a plain table without the slot; the write falls
    // through to the root table.
    let t = vm.new_table();
    let f = vm.closure_from_proto(a.build());
    vm.call(&f, t.clone(), &[]).unwrap();
    assert_eq!(vm.get(&root, &g).unwrap(), NewtValue::Integer(77));
    assert!(t.as_table().unwrap().borrow().get(&g).is_none());
}

#[test]
fn test_this_reads_fall_back_to_root() {
    let mut vm = NewtVm::open_default();
    let root = vm.root_table();
    let h = vm.intern("h");
    vm.new_slot(&root, h, NewtValue::Integer(5)).unwrap();

    let mut a = Asm::new(&mut vm, "this_get");
    let k = a.lit_str(&mut vm, "h");
    a.emit(Instruction::ab(Op::LoadLiteral, 1, k));
    a.emit(Instruction::new(Op::Get, 2, 0, 1, GET_FLAG_THIS));
    a.emit(Instruction::ab(Op::Return, 0, 2));

    let t = vm.new_table();
    let f = vm.closure_from_proto(a.build());
    assert_eq!(vm.call(&f, t, &[]).unwrap(), NewtValue::Integer(5));
}

#[test]
fn test_root_table_swap() {
    let mut vm = NewtVm::open_default();
    let old_root = vm.root_table();
    let g = vm.intern("g");
    vm.new_slot(&old_root, g.clone(), NewtValue::Integer(1))
        .unwrap();

    let fresh = vm.new_table();
    vm.new_slot(&fresh, g, NewtValue::Integer(2)).unwrap();
    let returned = vm.set_root_table(fresh.clone()).unwrap();
    assert_eq!(returned, old_root);
    assert_eq!(vm.root_table(), fresh);

    // Running code reaches the replacement through LoadRoot.
    let mut a = Asm::new(&mut vm, "root_read");
    let k = a.lit_str(&mut vm, "g");
    a.emit(Instruction::ab(Op::LoadRoot, 1, 0));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, k));
    a.emit(Instruction::new(Op::Get, 3, 1, 2, 0));
    a.emit(Instruction::ab(Op::Return, 0, 3));
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(2));

    assert!(vm.set_root_table(NewtValue::Integer(3)).is_err());
    assert_eq!(error_text(&vm), "root must be a table");
}

#[test]
fn test_raw_get_skips_delegation() {
    let mut vm = NewtVm::open_default();
    let parent = vm.new_table();
    let k = vm.intern("k");
    vm.new_slot(&parent, k, NewtValue::Integer(1)).unwrap();
    let child = vm.new_table();
    assert!(set_table_delegate(
        child.as_table().unwrap(),
        Some(parent.as_table().unwrap().clone()),
    ));

    let mut a = Asm::new(&mut vm, "raw_get");
    let c = a.lit(child.clone());
    let key = a.lit_str(&mut vm, "k");
    a.emit(Instruction::ab(Op::LoadLiteral, 1, c));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, key));
    a.emit(Instruction::new(Op::Get, 3, 1, 2, GET_FLAG_RAW));
    a.emit(Instruction::ab(Op::Return, 0, 3));
    assert!(run(&mut vm, a, &[]).is_err());
    assert_eq!(error_text(&vm), "the index 'k' does not exist");

    let mut a = Asm::new(&mut vm, "deleg_get");
    let c = a.lit(child);
    let key = a.lit_str(&mut vm, "k");
    a.emit(Instruction::ab(Op::LoadLiteral, 1, c));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, key));
    a.emit(Instruction::new(Op::Get, 3, 1, 2, 0));
    a.emit(Instruction::ab(Op::Return, 0, 3));
    assert_eq!(run(&mut vm, a, &[]).unwrap(), NewtValue::Integer(1));
}

#[test]
fn test_exists_is_raw() {
    let mut vm = NewtVm::open_default();
    let parent = vm.new_table();
    let k = vm.intern("k");
    vm.new_slot(&parent, k, NewtValue::Integer(1)).unwrap();
    let child = vm.new_table();
    assert!(set_table_delegate(
        child.as_table().unwrap(),
        Some(parent.as_table().unwrap().clone()),
    ));

    let mut a = Asm::new(&mut vm, "exists");
    let c = a.lit(child);
    let p = a.lit(parent);
    let key = a.lit_str(&mut vm, "k");
    a.emit(Instruction::ab(Op::LoadLiteral, 1, c));
    a.emit(Instruction::ab(Op::LoadLiteral, 2, p));
    a.emit(Instruction::ab(Op::LoadLiteral, 3, key));
    a.emit(Instruction::abc(Op::Exists, 4, 1, 3));
    a.emit(Instruction::abc(Op::Exists, 5, 2, 3));
    a.emit(Instruction::new(Op::NewObj, 6, 0, 0, NEWOBJ_ARRAY));
    a.emit(Instruction::ab(Op::AppendArray, 6, 4));
    a.emit(Instruction::ab(Op::AppendArray, 6, 5));
    a.emit(Instruction::ab(Op::Return, 0, 6));
    let result = run(&mut vm, a, &[]).unwrap();
    assert_eq!(
        result.as_array().unwrap().borrow().to_vec(),
        vec![NewtValue::Bool(false), NewtValue::Bool(true)]
    );
}

#[test]
fn test_string_byte_index() {
    let mut vm = NewtVm::open_default();
    let s = vm.intern("abc");
    assert_eq!(
        vm.get(&s, &NewtValue::Integer(-1)).unwrap(),
        NewtValue::Integer(99)
    );
    assert_eq!(
        vm.get(&s, &NewtValue::Float(1.9)).unwrap(),
        NewtValue::Integer(98)
    );
    assert!(vm.get(&s, &NewtValue::Integer(7)).is_err());
}

#[test]
fn test_array_indexing() {
    let mut vm = NewtVm::open_default();
    let arr = vm.new_array(2);
    vm.set(&arr, &NewtValue::Integer(0), NewtValue::Integer(10))
        .unwrap();
    assert_eq!(
        vm.get(&arr, &NewtValue::Integer(0)).unwrap(),
        NewtValue::Integer(10)
    );
    assert_eq!(
        vm.get(&arr, &NewtValue::Integer(1)).unwrap(),
        NewtValue::Null
    );

    assert!(vm
        .set(&arr, &NewtValue::Integer(5), NewtValue::Integer(1))
        .is_err());
    assert_eq!(error_text(&vm), "index out of range");

    let key = vm.intern("nope");
    assert!(vm.set(&arr, &key, NewtValue::Integer(1)).is_err());
    assert_eq!(error_text(&vm), "indexing an array with a string");
}

#[test]
fn test_display_rendering() {
    let mut vm = NewtVm::open_default();
    let cases = [
        (NewtValue::Integer(42), "42"),
        (NewtValue::Float(1.5), "1.5"),
        (NewtValue::Float(3.0), "3.0"),
        (NewtValue::Bool(true), "true"),
        (NewtValue::Null, "null"),
    ];
    for (value, text) in cases {
        let rendered = vm.to_display_string(&value).unwrap();
        let expected = vm.intern(text);
        assert_eq!(rendered, expected);
    }
}

#[test]
fn test_tostring_metamethod() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_tostring", mm_tostring);
    let rendered = vm.to_display_string(&t).unwrap();
    let expected = vm.intern("custom");
    assert_eq!(rendered, expected);
}

#[test]
fn test_clone_is_shallow() {
    let mut vm = NewtVm::open_default();
    let arr = vm.new_array(0);
    arr.as_array().unwrap().borrow_mut().push(NewtValue::Integer(5));
    let copy = vm.clone_value(&arr).unwrap();
    arr.as_array().unwrap().borrow_mut().push(NewtValue::Integer(6));
    assert_eq!(
        copy.as_array().unwrap().borrow().to_vec(),
        vec![NewtValue::Integer(5)]
    );

    assert!(vm.clone_value(&NewtValue::Integer(1)).is_err());
    assert_eq!(error_text(&vm), "cloning a integer");
}

#[test]
fn test_cloned_metamethod_on_tables() {
    let mut vm = NewtVm::open_default();
    let t = delegated_table(&mut vm, "_cloned", mm_cloned);
    let copy = vm.clone_value(&t).unwrap();

    let marker = vm.intern("copied");
    assert_eq!(
        copy.as_table().unwrap().borrow().get(&marker),
        Some(NewtValue::Bool(true))
    );
    assert!(t.as_table().unwrap().borrow().get(&marker).is_none());
    let root = vm.root_table();
    let from = vm.intern("cloned_from");
    assert_eq!(vm.get(&root, &from).unwrap(), t);
}
