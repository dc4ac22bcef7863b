use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::{GcChain, GcRef, Marker, StringInterner};
use crate::newt_value::{
    FunctionProto, NativeClosure, NewtArray, NewtClass, NewtClosure, NewtGenerator, NewtInstance,
    NewtString, NewtTable, NewtUserData, NewtValue,
};
use crate::newt_vm::newt_thread::NewtThread;
use crate::newt_vm::{MetaMethod, NewtError, NativeFn, VmOptions};

pub type SharedRef = Rc<RefCell<SharedState>>;

/// Host sink for print-style output.
pub type PrintFn = Rc<dyn Fn(&str)>;

/// Notification delivered to the debug hook. The borrows are valid only
/// for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    /// A line marker was crossed.
    Line { source: &'a str, line: u32 },
    /// A script frame was entered.
    Call {
        source: &'a str,
        function: &'a str,
        line: u32,
    },
    /// A script frame returned. Unwinding past a frame does not fire
    /// this.
    Return {
        source: &'a str,
        function: &'a str,
        line: u32,
    },
}

/// Debugger callback. Sees script frames only; native calls are
/// invisible to it.
pub type DebugHook = Rc<dyn Fn(HookEvent<'_>)>;

/// Per-type fallback tables consulted when a non-table value is indexed.
/// All ten are GC roots; the host fills them with native methods.
pub struct DefaultDelegates {
    pub table: NewtValue,
    pub array: NewtValue,
    pub string: NewtValue,
    pub number: NewtValue,
    pub generator: NewtValue,
    pub closure: NewtValue,
    pub thread: NewtValue,
    pub class: NewtValue,
    pub instance: NewtValue,
    pub weakref: NewtValue,
}

impl DefaultDelegates {
    /// The delegate that serves `value` when its own lookup missed.
    pub fn for_value(&self, value: &NewtValue) -> Option<&NewtValue> {
        match value {
            NewtValue::Table(_) => Some(&self.table),
            NewtValue::Array(_) => Some(&self.array),
            NewtValue::String(_) => Some(&self.string),
            NewtValue::Integer(_) | NewtValue::Float(_) | NewtValue::Bool(_) => {
                Some(&self.number)
            }
            NewtValue::Generator(_) => Some(&self.generator),
            NewtValue::Closure(_) | NewtValue::NativeClosure(_) => Some(&self.closure),
            NewtValue::Thread(_) => Some(&self.thread),
            NewtValue::Class(_) => Some(&self.class),
            NewtValue::Instance(_) => Some(&self.instance),
            NewtValue::WeakRef(_) => Some(&self.weakref),
            _ => None,
        }
    }

    fn mark_all(&self, marker: &mut Marker) {
        marker.mark_value(&self.table);
        marker.mark_value(&self.array);
        marker.mark_value(&self.string);
        marker.mark_value(&self.number);
        marker.mark_value(&self.generator);
        marker.mark_value(&self.closure);
        marker.mark_value(&self.thread);
        marker.mark_value(&self.class);
        marker.mark_value(&self.instance);
        marker.mark_value(&self.weakref);
    }
}

/// State shared by every thread of one virtual machine: the string
/// interner, the collectable chain, the root and registry tables, the
/// interned metamethod names, and the host callbacks.
pub struct SharedState {
    interner: StringInterner,
    gc: GcChain,
    pub options: VmOptions,
    pub root_table: NewtValue,
    /// Host-private table, invisible to scripts, for pinning values.
    pub registry: NewtValue,
    pub default_delegates: DefaultDelegates,
    metamethod_names: Vec<NewtString>,
    pub error_value: NewtValue,
    /// Callable invoked once per uncaught error, or Null.
    pub error_handler: NewtValue,
    pub print_fn: Option<PrintFn>,
    pub error_print_fn: Option<PrintFn>,
    pub debug_hook: Option<DebugHook>,
    pub(crate) main_thread: Option<GcRef<NewtThread>>,
}

impl SharedState {
    pub(crate) fn new(options: VmOptions) -> SharedState {
        let mut interner = StringInterner::new();
        let metamethod_names = MetaMethod::iter()
            .map(|mm| interner.intern(mm.name()))
            .collect();

        let mut state = SharedState {
            interner,
            gc: GcChain::new(),
            options,
            root_table: NewtValue::Null,
            registry: NewtValue::Null,
            default_delegates: DefaultDelegates {
                table: NewtValue::Null,
                array: NewtValue::Null,
                string: NewtValue::Null,
                number: NewtValue::Null,
                generator: NewtValue::Null,
                closure: NewtValue::Null,
                thread: NewtValue::Null,
                class: NewtValue::Null,
                instance: NewtValue::Null,
                weakref: NewtValue::Null,
            },
            metamethod_names,
            error_value: NewtValue::Null,
            error_handler: NewtValue::Null,
            print_fn: None,
            error_print_fn: None,
            debug_hook: None,
            main_thread: None,
        };

        state.root_table = NewtValue::Table(state.create_table());
        state.registry = NewtValue::Table(state.create_table());
        state.default_delegates = DefaultDelegates {
            table: NewtValue::Table(state.create_table()),
            array: NewtValue::Table(state.create_table()),
            string: NewtValue::Table(state.create_table()),
            number: NewtValue::Table(state.create_table()),
            generator: NewtValue::Table(state.create_table()),
            closure: NewtValue::Table(state.create_table()),
            thread: NewtValue::Table(state.create_table()),
            class: NewtValue::Table(state.create_table()),
            instance: NewtValue::Table(state.create_table()),
            weakref: NewtValue::Table(state.create_table()),
        };
        state
    }

    // ============ strings ============

    #[inline]
    pub fn intern(&mut self, s: &str) -> NewtString {
        self.interner.intern(s)
    }

    #[inline]
    pub fn intern_value(&mut self, s: &str) -> NewtValue {
        NewtValue::String(self.interner.intern(s))
    }

    pub fn metamethod_name(&self, mm: MetaMethod) -> NewtString {
        self.metamethod_names[mm as usize].clone()
    }

    // ============ object creation ============
    //
    // Every collectable is born here so the chain sees it.

    pub fn create_table(&mut self) -> GcRef<NewtTable> {
        let r = GcRef::new(NewtTable::new());
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_table_with_capacity(&mut self, capacity: usize) -> GcRef<NewtTable> {
        let r = GcRef::new(NewtTable::with_capacity(capacity));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_table_from(&mut self, table: NewtTable) -> GcRef<NewtTable> {
        let r = GcRef::new(table);
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_array(&mut self, len: usize) -> GcRef<NewtArray> {
        let r = GcRef::new(NewtArray::with_len(len));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_array_from(&mut self, values: Vec<NewtValue>) -> GcRef<NewtArray> {
        let r = GcRef::new(NewtArray::from_values(values));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_closure(&mut self, closure: NewtClosure) -> GcRef<NewtClosure> {
        let r = GcRef::new(closure);
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_native_closure(&mut self, function: NativeFn) -> GcRef<NativeClosure> {
        let r = GcRef::new(NativeClosure::new(function));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_native_closure_from(&mut self, closure: NativeClosure) -> GcRef<NativeClosure> {
        let r = GcRef::new(closure);
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_generator(&mut self, generator: NewtGenerator) -> GcRef<NewtGenerator> {
        let r = GcRef::new(generator);
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_class(&mut self, base: Option<GcRef<NewtClass>>, is_abstract: bool) -> GcRef<NewtClass> {
        let r = GcRef::new(NewtClass::new(base, is_abstract));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_instance(&mut self, class: GcRef<NewtClass>) -> GcRef<NewtInstance> {
        class.borrow_mut().lock();
        let r = GcRef::new(NewtInstance::new(class));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_instance_from(&mut self, instance: NewtInstance) -> GcRef<NewtInstance> {
        let r = GcRef::new(instance);
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_user_data(&mut self, size: usize) -> GcRef<NewtUserData> {
        let r = GcRef::new(NewtUserData::new(size));
        self.gc.track(r.as_dyn());
        r
    }

    pub fn create_thread(&mut self, initial_stack_size: usize) -> GcRef<NewtThread> {
        let r = GcRef::new(NewtThread::new(initial_stack_size, false));
        self.gc.track(r.as_dyn());
        r
    }

    pub(crate) fn create_main_thread(&mut self) -> GcRef<NewtThread> {
        let r = GcRef::new(NewtThread::new(self.options.initial_stack_size, true));
        self.gc.track(r.as_dyn());
        self.main_thread = Some(r.clone());
        r
    }

    // ============ errors ============

    /// Record a message as the pending error value and hand back the
    /// fieldless error to propagate with `?`.
    pub fn raise(&mut self, msg: &str) -> NewtError {
        self.error_value = self.intern_value(msg);
        NewtError::RuntimeError
    }

    pub fn raise_value(&mut self, value: NewtValue) -> NewtError {
        self.error_value = value;
        NewtError::RuntimeError
    }

    /// Take the pending error, leaving Null behind.
    pub fn take_error(&mut self) -> NewtValue {
        std::mem::take(&mut self.error_value)
    }

    // ============ collection ============

    pub fn live_object_count(&self) -> usize {
        self.gc.live_count()
    }

    /// Cycle collection. Roots are the root and registry tables, the
    /// default delegates, the pending error and handler, the main thread
    /// and the invoking thread. Values only the host holds are not roots;
    /// pin them in the registry to keep them across collections.
    pub fn collect_garbage(&mut self, invoking: Option<&GcRef<NewtThread>>) -> usize {
        let SharedState {
            gc,
            interner,
            root_table,
            registry,
            default_delegates,
            error_value,
            error_handler,
            main_thread,
            ..
        } = self;
        let finalized = gc.collect(|marker| {
            marker.mark_value(root_table);
            marker.mark_value(registry);
            default_delegates.mark_all(marker);
            marker.mark_value(error_value);
            marker.mark_value(error_handler);
            if let Some(main) = main_thread {
                marker.mark_object(main.as_dyn());
            }
            if let Some(thread) = invoking {
                marker.mark_object(thread.as_dyn());
            }
        });
        interner.prune_dead();
        finalized
    }

    /// Finalize every collectable regardless of reachability; the VM is
    /// going away.
    pub(crate) fn teardown(&mut self) {
        self.root_table = NewtValue::Null;
        self.registry = NewtValue::Null;
        self.error_value = NewtValue::Null;
        self.error_handler = NewtValue::Null;
        self.main_thread = None;
        self.gc.collect(|_| {});
        self.interner.prune_dead();
    }
}
