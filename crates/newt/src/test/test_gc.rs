/// Ownership: synchronous refcount death, release hooks, weak
/// references and the cycle collector.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::support::error_text;
use crate::newt_value::{NewtValue, ReleaseHook};
use crate::newt_vm::NewtVm;

#[test]
fn test_fresh_machine_has_nothing_to_collect() {
    let mut vm = NewtVm::open_default();
    let live = vm.live_object_count();
    assert!(live > 0);
    assert_eq!(vm.collect_garbage(), 0);
    assert_eq!(vm.collect_garbage(), 0);
    assert_eq!(vm.live_object_count(), live);
}

#[test]
fn test_release_hook_fires_on_last_handle_drop() {
    let mut vm = NewtVm::open_default();
    let ud = vm.new_user_data(4);
    {
        let NewtValue::UserData(ref u) = ud else {
            panic!("expected user data");
        };
        u.borrow_mut().data.copy_from_slice(&[1, 2, 3, 4]);
    }
    let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    vm.set_release_hook(
        &ud,
        Rc::new(move |buf: &mut [u8]| sink.borrow_mut().extend_from_slice(buf)),
    )
    .unwrap();

    let live = vm.live_object_count();
    assert!(seen.borrow().is_empty());

    // Refcount death is synchronous; no collection pass is needed.
    drop(ud);
    assert_eq!(seen.borrow().as_slice(), [1, 2, 3, 4]);
    assert_eq!(vm.live_object_count(), live - 1);
}

#[test]
fn test_release_hook_rejects_other_types() {
    let mut vm = NewtVm::open_default();
    let hook: ReleaseHook = Rc::new(|_buf: &mut [u8]| {});

    let t = vm.new_table();
    assert!(vm.set_release_hook(&t, hook.clone()).is_err());
    assert_eq!(
        error_text(&vm),
        "release hooks apply to instances, classes and user data"
    );
    assert!(vm.set_release_hook(&NewtValue::Integer(1), hook).is_err());
    assert_eq!(
        error_text(&vm),
        "release hooks apply to instances, classes and user data"
    );
}

#[test]
fn test_instance_cycle_reclaimed_by_collection() {
    let mut vm = NewtVm::open_default();
    let cls = vm.new_class(None, false).unwrap();
    let next = vm.intern("next");
    vm.new_slot(&cls, next.clone(), NewtValue::Null).unwrap();
    let registry = vm.registry();
    let pin = vm.intern("cycle_class");
    vm.new_slot(&registry, pin, cls.clone()).unwrap();

    let root = vm.root_table();
    let a = vm.call(&cls, root.clone(), &[]).unwrap();
    let b = vm.call(&cls, root, &[]).unwrap();
    vm.set(&a, &next, b.clone()).unwrap();
    vm.set(&b, &next, a.clone()).unwrap();

    let hits: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let h = hits.clone();
    let hook: ReleaseHook = Rc::new(move |_buf: &mut [u8]| h.set(h.get() + 1));
    vm.set_release_hook(&a, hook.clone()).unwrap();
    vm.set_release_hook(&b, hook).unwrap();

    // The mutual field references keep both instances alive after the
    // host lets go.
    let live = vm.live_object_count();
    drop(a);
    drop(b);
    assert_eq!(hits.get(), 0);
    assert_eq!(vm.live_object_count(), live);

    assert_eq!(vm.collect_garbage(), 2);
    assert_eq!(hits.get(), 2);
    assert_eq!(vm.live_object_count(), live - 2);
    assert_eq!(vm.collect_garbage(), 0);
}

#[test]
fn test_class_release_hook_sees_an_empty_buffer() {
    let mut vm = NewtVm::open_default();
    let cls = vm.new_class(None, false).unwrap();
    let len_seen: Rc<Cell<Option<usize>>> = Rc::new(Cell::new(None));
    let sink = len_seen.clone();
    vm.set_release_hook(&cls, Rc::new(move |buf: &mut [u8]| sink.set(Some(buf.len()))))
        .unwrap();
    drop(cls);
    assert_eq!(len_seen.get(), Some(0));
}

#[test]
fn test_userdata_delegate_cycle_keeps_the_buffer_for_the_hook() {
    let mut vm = NewtVm::open_default();
    let ud = vm.new_user_data(2);
    let td = vm.new_table();
    {
        let NewtValue::UserData(ref u) = ud else {
            panic!("expected user data");
        };
        let mut body = u.borrow_mut();
        body.data.copy_from_slice(&[7, 9]);
        body.delegate = Some(td.as_table().unwrap().clone());
    }
    let back = vm.intern("owner");
    vm.new_slot(&td, back, ud.clone()).unwrap();

    let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    vm.set_release_hook(
        &ud,
        Rc::new(move |buf: &mut [u8]| sink.borrow_mut().extend_from_slice(buf)),
    )
    .unwrap();

    drop(ud);
    drop(td);
    assert!(seen.borrow().is_empty());

    // Finalizing detaches the delegate but leaves the bytes for the
    // hook to see when the memory actually goes away.
    assert_eq!(vm.collect_garbage(), 2);
    assert_eq!(seen.borrow().as_slice(), [7, 9]);
}

#[test]
fn test_unrooted_host_handles_are_swept() {
    let mut vm = NewtVm::open_default();
    let kept = vm.new_table();
    let registry = vm.registry();
    let pin = vm.intern("kept");
    vm.new_slot(&registry, pin, kept.clone()).unwrap();
    let lost = vm.new_table();
    let k = vm.intern("x");
    vm.new_slot(&kept, k.clone(), NewtValue::Integer(1)).unwrap();
    vm.new_slot(&lost, k, NewtValue::Integer(1)).unwrap();

    // Host handles are not roots: the unpinned table is finalized into
    // an empty husk even though the handle keeps its shell allocated.
    assert_eq!(vm.collect_garbage(), 1);
    assert_eq!(kept.as_table().unwrap().borrow().len(), 1);
    assert_eq!(lost.as_table().unwrap().borrow().len(), 0);
}

#[test]
fn test_weak_refs_are_cached_and_clear_on_death() {
    let mut vm = NewtVm::open_default();

    // Scalars cannot be weakly referenced and come back as themselves.
    assert_eq!(vm.weak_ref(&NewtValue::Integer(7)), NewtValue::Integer(7));

    let t = vm.new_table();
    let w1 = vm.weak_ref(&t);
    let w2 = vm.weak_ref(&t);
    // One weak reference per target, so the two handles are identical.
    assert_eq!(w1, w2);
    let NewtValue::WeakRef(ref w) = w1 else {
        panic!("expected a weak reference");
    };
    assert_eq!(w.deref_value(), t);

    drop(t);
    assert_eq!(w.deref_value(), NewtValue::Null);
}

#[test]
fn test_weak_refs_clear_when_a_cycle_is_collected() {
    let mut vm = NewtVm::open_default();
    let a = vm.new_table();
    let b = vm.new_table();
    let k = vm.intern("peer");
    vm.new_slot(&a, k.clone(), b.clone()).unwrap();
    vm.new_slot(&b, k, a.clone()).unwrap();
    let wv = vm.weak_ref(&a);
    let NewtValue::WeakRef(ref w) = wv else {
        panic!("expected a weak reference");
    };

    // The cycle keeps both tables alive until a collection runs.
    drop(a);
    drop(b);
    assert!(!w.is_cleared());
    assert_eq!(vm.collect_garbage(), 2);
    assert!(w.is_cleared());
    assert_eq!(w.deref_value(), NewtValue::Null);
}
