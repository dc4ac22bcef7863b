pub mod call_info;
mod execute;
mod metamethod;
mod newt_error;
pub(crate) mod newt_thread;
mod opcode;
mod proto_serializer;
mod shared_state;
mod vm_options;

pub use call_info::{CallInfo, Trap, TARGET_NONE};
pub use metamethod::{MetaMethod, MM_COUNT};
pub use newt_error::{NewtError, NewtResult};
pub use newt_thread::{NewtThread, StackHandle, ThreadControl, ThreadStatus};
pub use opcode::{
    Instruction, Op, ARG_NONE, BW_AND, BW_OR, BW_SHL, BW_SHR, BW_USHR, BW_XOR, CMP_3WAY,
    CMP_GREATER, CMP_GREATER_EQ, CMP_LESS, CMP_LESS_EQ, GET_FLAG_RAW, GET_FLAG_THIS,
    NEWOBJ_ARRAY, NEWOBJ_CLASS, NEWOBJ_CLASS_ABSTRACT, NEWOBJ_TABLE, NEWSLOT_FLAG_ATTRS,
    NEWSLOT_FLAG_STATIC,
};
pub use proto_serializer::{read_proto, write_proto, SerializeError};
pub use shared_state::{DebugHook, HookEvent, PrintFn, SharedRef, SharedState};
pub use vm_options::VmOptions;

use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::GcRef;
use crate::newt_value::{
    weak_ref_value, FunctionProto, NativeClosure, NativeReturn, NewtClosure, NewtValue,
    ParamCheck, ReleaseHook,
};

/// Host function callable from scripts. Arguments sit in the context's
/// frame window, the receiver first.
pub type NativeFn = fn(&mut VmContext) -> NewtResult<NativeReturn>;

/// One frame of a backtrace.
#[derive(Debug, Clone)]
pub struct StackInfo {
    pub function: String,
    pub source: String,
    pub line: u32,
}

/// Execution context handed to native functions and used internally by
/// the dispatcher: the shared state, the running thread, and that
/// thread's stack and control block. The control borrow is taken once at
/// the host boundary and threaded through nested calls.
pub struct VmContext<'a> {
    pub(crate) shared: &'a SharedRef,
    pub(crate) thread: &'a GcRef<NewtThread>,
    pub(crate) stack: &'a StackHandle,
    pub(crate) ctl: &'a mut ThreadControl,
    pub(crate) current_native: Option<GcRef<NativeClosure>>,
}

impl<'a> VmContext<'a> {
    // ============ argument access ============

    /// Number of values in the current frame window, receiver included.
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.ctl.stack_top - self.ctl.stack_base
    }

    /// Argument by position; 0 is the receiver.
    pub fn arg(&self, index: usize) -> NewtValue {
        let slot = self.ctl.stack_base + index;
        if slot < self.ctl.stack_top {
            self.stack.borrow()[slot].clone()
        } else {
            NewtValue::Null
        }
    }

    #[inline]
    pub fn receiver(&self) -> NewtValue {
        self.arg(0)
    }

    /// Value bound into the running native closure at creation time.
    pub fn free_var(&self, index: usize) -> Option<NewtValue> {
        let native = self.current_native.as_ref()?;
        native.borrow().free_vars.get(index).cloned()
    }

    // ============ shared state ============

    pub fn intern(&mut self, s: &str) -> NewtValue {
        self.shared.borrow_mut().intern_value(s)
    }

    pub fn root_table(&self) -> NewtValue {
        self.shared.borrow().root_table.clone()
    }

    pub fn registry(&self) -> NewtValue {
        self.shared.borrow().registry.clone()
    }

    /// Route text through the host's print callback. Silent when none is
    /// installed; the machine never writes to stdout on its own.
    pub fn print(&self, text: &str) {
        let f = self.shared.borrow().print_fn.clone();
        if let Some(f) = f {
            f(text);
        }
    }

    /// Record `msg` as the pending error; return the error to propagate.
    pub fn raise(&mut self, msg: &str) -> NewtError {
        self.shared.borrow_mut().raise(msg)
    }

    pub fn raise_value(&mut self, value: NewtValue) -> NewtError {
        self.shared.borrow_mut().raise_value(value)
    }

    // ============ object creation ============

    pub fn new_table(&mut self) -> NewtValue {
        NewtValue::Table(self.shared.borrow_mut().create_table())
    }

    pub fn new_array(&mut self, len: usize) -> NewtValue {
        NewtValue::Array(self.shared.borrow_mut().create_array(len))
    }

    pub fn new_array_from(&mut self, values: Vec<NewtValue>) -> NewtValue {
        NewtValue::Array(self.shared.borrow_mut().create_array_from(values))
    }

    pub fn new_user_data(&mut self, size: usize) -> NewtValue {
        NewtValue::UserData(self.shared.borrow_mut().create_user_data(size))
    }

    pub fn new_native_closure(&mut self, function: NativeFn) -> NewtValue {
        NewtValue::NativeClosure(self.shared.borrow_mut().create_native_closure(function))
    }

    pub fn new_class(
        &mut self,
        base: Option<&NewtValue>,
        is_abstract: bool,
    ) -> NewtResult<NewtValue> {
        let base_ref = match base {
            None => None,
            Some(NewtValue::Class(c)) => Some(c.clone()),
            Some(_) => return Err(self.raise("class base must be a class")),
        };
        Ok(NewtValue::Class(
            self.shared.borrow_mut().create_class(base_ref, is_abstract),
        ))
    }

    pub fn new_thread(&mut self, initial_stack_size: usize) -> NewtValue {
        NewtValue::Thread(self.shared.borrow_mut().create_thread(initial_stack_size))
    }

    /// Closure over a prototype with no enclosing scope: nothing to
    /// capture, no default values evaluated.
    pub fn closure_from_proto(&mut self, proto: Rc<FunctionProto>) -> NewtValue {
        NewtValue::Closure(
            self.shared
                .borrow_mut()
                .create_closure(NewtClosure::new(proto)),
        )
    }

    // ============ introspection ============

    /// Backtrace entry `level` frames below the top; 0 is the innermost.
    pub fn stack_info(&self, level: usize) -> Option<StackInfo> {
        let depth = self.ctl.call_depth();
        if level >= depth {
            return None;
        }
        let ci = &self.ctl.call_stack[depth - 1 - level];
        Some(describe_frame(ci))
    }

    /// Run a cycle collection with this thread as the invoking root.
    pub fn collect_garbage(&mut self) -> usize {
        self.shared.borrow_mut().collect_garbage(Some(self.thread))
    }
}

fn describe_frame(ci: &CallInfo) -> StackInfo {
    match &ci.closure {
        NewtValue::Closure(c) => {
            let c = c.borrow();
            StackInfo {
                function: c.proto.name_str().to_string(),
                source: c.proto.source_str().to_string(),
                line: c.proto.line_at(ci.ip.saturating_sub(1)),
            }
        }
        NewtValue::NativeClosure(c) => StackInfo {
            function: c.borrow().name_str().to_string(),
            source: "NATIVE".to_string(),
            line: 0,
        },
        _ => StackInfo {
            function: "unknown".to_string(),
            source: "??".to_string(),
            line: 0,
        },
    }
}

/// Outcome of running a side thread: it either came back with a value or
/// parked itself waiting for a wakeup.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadReturn {
    Returned(NewtValue),
    Suspended,
}

/// An owned virtual machine: shared state plus the main thread. All host
/// interaction goes through here.
///
/// Values handed out to the host are plain strong handles, not collection
/// roots; pin anything that must survive a collection in the registry.
pub struct NewtVm {
    shared: SharedRef,
    main_thread: GcRef<NewtThread>,
}

impl NewtVm {
    pub fn open(options: VmOptions) -> NewtVm {
        let mut state = SharedState::new(options);
        let main_thread = state.create_main_thread();
        NewtVm {
            shared: Rc::new(RefCell::new(state)),
            main_thread,
        }
    }

    pub fn open_default() -> NewtVm {
        Self::open(VmOptions::default())
    }

    /// Tear the machine down, finalizing every object it still owns.
    /// Dropping the handle does the same.
    pub fn close(self) {}

    fn with_ctx<R>(
        &mut self,
        thread: &GcRef<NewtThread>,
        f: impl FnOnce(&mut VmContext) -> R,
    ) -> R {
        let stack = thread.borrow().stack_handle();
        let control = thread.borrow().control_handle();
        let mut ctl = control.borrow_mut();
        let mut ctx = VmContext {
            shared: &self.shared,
            thread,
            stack: &stack,
            ctl: &mut ctl,
            current_native: None,
        };
        f(&mut ctx)
    }

    fn with_main_ctx<R>(&mut self, f: impl FnOnce(&mut VmContext) -> R) -> R {
        let thread = self.main_thread.clone();
        self.with_ctx(&thread, f)
    }

    // ============ tables and values ============

    pub fn root_table(&self) -> NewtValue {
        self.shared.borrow().root_table.clone()
    }

    /// Swap in a different root table, returning the old one.
    pub fn set_root_table(&mut self, table: NewtValue) -> NewtResult<NewtValue> {
        if !matches!(table, NewtValue::Table(_)) {
            return Err(self.shared.borrow_mut().raise("root must be a table"));
        }
        Ok(std::mem::replace(
            &mut self.shared.borrow_mut().root_table,
            table,
        ))
    }

    pub fn registry(&self) -> NewtValue {
        self.shared.borrow().registry.clone()
    }

    /// The fallback table serving values shaped like `sample`.
    pub fn default_delegate(&self, sample: &NewtValue) -> Option<NewtValue> {
        self.shared
            .borrow()
            .default_delegates
            .for_value(sample)
            .cloned()
    }

    pub fn intern(&mut self, s: &str) -> NewtValue {
        self.shared.borrow_mut().intern_value(s)
    }

    pub fn new_table(&mut self) -> NewtValue {
        NewtValue::Table(self.shared.borrow_mut().create_table())
    }

    pub fn new_array(&mut self, len: usize) -> NewtValue {
        NewtValue::Array(self.shared.borrow_mut().create_array(len))
    }

    pub fn new_user_data(&mut self, size: usize) -> NewtValue {
        NewtValue::UserData(self.shared.borrow_mut().create_user_data(size))
    }

    pub fn new_native_closure(&mut self, function: NativeFn) -> NewtValue {
        NewtValue::NativeClosure(self.shared.borrow_mut().create_native_closure(function))
    }

    /// Native closure carrying bound free variables, readable through
    /// [`VmContext::free_var`] while it runs.
    pub fn new_native_closure_with(
        &mut self,
        function: NativeFn,
        free_vars: Vec<NewtValue>,
    ) -> NewtValue {
        let mut nc = NativeClosure::new(function);
        nc.free_vars = free_vars;
        NewtValue::NativeClosure(self.shared.borrow_mut().create_native_closure_from(nc))
    }

    pub fn new_class(
        &mut self,
        base: Option<&NewtValue>,
        is_abstract: bool,
    ) -> NewtResult<NewtValue> {
        self.with_main_ctx(|ctx| ctx.new_class(base, is_abstract))
    }

    pub fn new_thread(&mut self, initial_stack_size: usize) -> NewtValue {
        NewtValue::Thread(self.shared.borrow_mut().create_thread(initial_stack_size))
    }

    pub fn closure_from_proto(&mut self, proto: Rc<FunctionProto>) -> NewtValue {
        self.with_main_ctx(|ctx| ctx.closure_from_proto(proto))
    }

    /// Bind `closure` to run against a fixed environment object instead
    /// of the caller-supplied receiver. Returns a fresh closure; the
    /// binding is weak, so a collected environment reads as Null.
    pub fn bind_env(&mut self, closure: &NewtValue, env: &NewtValue) -> NewtResult<NewtValue> {
        if !matches!(
            env,
            NewtValue::Table(_) | NewtValue::Class(_) | NewtValue::Instance(_)
        ) {
            return Err(self
                .shared
                .borrow_mut()
                .raise("an environment must be a table, class or instance"));
        }
        let weak = match weak_ref_value(env) {
            NewtValue::WeakRef(w) => w,
            _ => return Err(self.shared.borrow_mut().raise("invalid environment")),
        };
        match closure {
            NewtValue::Closure(c) => {
                let copy = c.borrow().with_env(weak);
                Ok(NewtValue::Closure(
                    self.shared.borrow_mut().create_closure(copy),
                ))
            }
            NewtValue::NativeClosure(nc) => {
                let copy = nc.borrow().with_env(weak);
                Ok(NewtValue::NativeClosure(
                    self.shared.borrow_mut().create_native_closure_from(copy),
                ))
            }
            _ => Err(self
                .shared
                .borrow_mut()
                .raise("only closures can be bound to an environment")),
        }
    }

    pub fn weak_ref(&self, value: &NewtValue) -> NewtValue {
        weak_ref_value(value)
    }

    /// Declare the parameter contract of a native closure.
    pub fn set_param_check(
        &mut self,
        closure: &NewtValue,
        check: ParamCheck,
        typemask: Option<&str>,
    ) -> NewtResult<()> {
        let NewtValue::NativeClosure(nc) = closure else {
            return Err(self
                .shared
                .borrow_mut()
                .raise("param check applies to native closures"));
        };
        let parsed = match typemask {
            None => None,
            Some(mask) => match crate::newt_value::parse_typemask(mask) {
                Some(p) => Some(p),
                None => {
                    return Err(self.shared.borrow_mut().raise("malformed type mask"));
                }
            },
        };
        let mut body = nc.borrow_mut();
        body.param_check = check;
        body.typemask = parsed;
        Ok(())
    }

    /// Attach a release hook; fires once when the object's memory goes
    /// away. Works on instances, classes and user data.
    pub fn set_release_hook(&mut self, value: &NewtValue, hook: ReleaseHook) -> NewtResult<()> {
        match value {
            NewtValue::Instance(i) => i.borrow_mut().release_hook = Some(hook),
            NewtValue::Class(c) => c.borrow_mut().release_hook = Some(hook),
            NewtValue::UserData(u) => u.borrow_mut().release_hook = Some(hook),
            _ => {
                return Err(self
                    .shared
                    .borrow_mut()
                    .raise("release hooks apply to instances, classes and user data"))
            }
        }
        Ok(())
    }

    // ============ engine operations ============

    /// Indexed read with full delegation and metamethod fallback.
    pub fn get(&mut self, container: &NewtValue, key: &NewtValue) -> NewtResult<NewtValue> {
        let container = container.clone();
        let key = key.clone();
        self.with_main_ctx(|ctx| ctx.get_slot(&container, &key, 0))
    }

    /// Indexed write into an existing slot, with fallback.
    pub fn set(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
        value: NewtValue,
    ) -> NewtResult<()> {
        let container = container.clone();
        let key = key.clone();
        self.with_main_ctx(|ctx| ctx.set_slot(&container, &key, value, false))
    }

    /// Create-or-update a slot (tables and classes).
    pub fn new_slot(
        &mut self,
        container: &NewtValue,
        key: NewtValue,
        value: NewtValue,
    ) -> NewtResult<()> {
        let container = container.clone();
        self.with_main_ctx(|ctx| ctx.new_slot_value(&container, key, value, false))
    }

    pub fn delete_slot(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
    ) -> NewtResult<NewtValue> {
        let container = container.clone();
        let key = key.clone();
        self.with_main_ctx(|ctx| ctx.delete_slot_value(&container, &key))
    }

    /// Call a callable on the main thread. Uncaught errors invoke the
    /// registered error handler before this returns them.
    pub fn call(
        &mut self,
        callable: &NewtValue,
        this: NewtValue,
        args: &[NewtValue],
    ) -> NewtResult<NewtValue> {
        let callable = callable.clone();
        self.with_main_ctx(|ctx| ctx.host_call(callable, this, args, true))
    }

    /// Engine to-string: honors `_tostring` before the default rendering.
    pub fn to_display_string(&mut self, value: &NewtValue) -> NewtResult<NewtValue> {
        let value = value.clone();
        self.with_main_ctx(|ctx| ctx.to_display_string(&value))
    }

    pub fn clone_value(&mut self, value: &NewtValue) -> NewtResult<NewtValue> {
        let value = value.clone();
        self.with_main_ctx(|ctx| ctx.clone_value(&value))
    }

    // ============ bytecode ============

    /// Flatten a closure to a byte stream. Only closures capturing
    /// nothing can travel this way; captured outers refer to live
    /// frames.
    pub fn write_closure(&mut self, closure: &NewtValue) -> NewtResult<Vec<u8>> {
        let NewtValue::Closure(c) = closure else {
            return Err(self
                .shared
                .borrow_mut()
                .raise("only script closures can be serialized"));
        };
        let body = c.borrow();
        if !body.outers.is_empty() {
            return Err(self
                .shared
                .borrow_mut()
                .raise("cannot serialize a closure with captured outer variables"));
        }
        match write_proto(&body.proto) {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(self.shared.borrow_mut().raise(&e.to_string())),
        }
    }

    /// Rebuild a closure from `write_closure` output, optionally bound
    /// to an environment object.
    pub fn read_closure(&mut self, data: &[u8], env: Option<&NewtValue>) -> NewtResult<NewtValue> {
        let proto = {
            let mut state = self.shared.borrow_mut();
            match read_proto(&mut state, data) {
                Ok(p) => p,
                Err(e) => {
                    let msg = e.to_string();
                    return Err(state.raise(&msg));
                }
            }
        };
        let closure = self.closure_from_proto(proto);
        match env {
            Some(env) => self.bind_env(&closure, env),
            None => Ok(closure),
        }
    }

    // ============ errors ============

    pub fn last_error(&self) -> NewtValue {
        self.shared.borrow().error_value.clone()
    }

    pub fn reset_error(&mut self) {
        self.shared.borrow_mut().error_value = NewtValue::Null;
    }

    /// Install a callable invoked once per uncaught error with the error
    /// value; Null uninstalls.
    pub fn set_error_handler(&mut self, handler: NewtValue) {
        self.shared.borrow_mut().error_handler = handler;
    }

    pub fn set_print_fn(&mut self, f: Option<PrintFn>) {
        self.shared.borrow_mut().print_fn = f;
    }

    pub fn set_error_print_fn(&mut self, f: Option<PrintFn>) {
        self.shared.borrow_mut().error_print_fn = f;
    }

    /// Install a debug hook, fired on line markers and on script frame
    /// entry and return; None uninstalls.
    pub fn set_debug_hook(&mut self, f: Option<DebugHook>) {
        self.shared.borrow_mut().debug_hook = f;
    }

    // ============ collection ============

    pub fn collect_garbage(&mut self) -> usize {
        self.shared.borrow_mut().collect_garbage(None)
    }

    pub fn live_object_count(&self) -> usize {
        self.shared.borrow().live_object_count()
    }

    // ============ threads ============

    pub fn thread_status(&self, thread: &NewtValue) -> NewtResult<ThreadStatus> {
        match thread {
            NewtValue::Thread(t) => Ok(t.borrow().status()),
            _ => Err(self.shared.borrow_mut().raise("expected a thread")),
        }
    }

    /// Start a call on a side thread. The thread runs until it returns
    /// or suspends.
    pub fn thread_call(
        &mut self,
        thread: &NewtValue,
        callable: &NewtValue,
        this: NewtValue,
        args: &[NewtValue],
    ) -> NewtResult<ThreadReturn> {
        let NewtValue::Thread(t) = thread else {
            return Err(self.shared.borrow_mut().raise("expected a thread"));
        };
        if t.borrow().status() != ThreadStatus::Idle {
            return Err(self
                .shared
                .borrow_mut()
                .raise("thread is already running or suspended"));
        }
        let t = t.clone();
        let callable = callable.clone();
        let outcome =
            self.with_ctx(&t, |ctx| ctx.host_call(callable, this, args, true));
        Self::thread_outcome(outcome)
    }

    /// Resume a suspended thread, optionally delivering a value to the
    /// suspension point.
    pub fn thread_wakeup(
        &mut self,
        thread: &NewtValue,
        value: Option<NewtValue>,
    ) -> NewtResult<ThreadReturn> {
        let NewtValue::Thread(t) = thread else {
            return Err(self.shared.borrow_mut().raise("expected a thread"));
        };
        if t.borrow().status() != ThreadStatus::Suspended {
            return Err(self.shared.borrow_mut().raise("thread is not suspended"));
        }
        let t = t.clone();
        let outcome = self.with_ctx(&t, |ctx| ctx.wakeup(value));
        Self::thread_outcome(outcome)
    }

    fn thread_outcome(outcome: NewtResult<NewtValue>) -> NewtResult<ThreadReturn> {
        match outcome {
            Ok(value) => Ok(ThreadReturn::Returned(value)),
            Err(NewtError::Suspend) => Ok(ThreadReturn::Suspended),
            Err(e) => Err(e),
        }
    }

    // ============ introspection ============

    /// Backtrace entry on the main thread; level 0 is the innermost
    /// frame.
    pub fn stack_info(&self, level: usize) -> Option<StackInfo> {
        let control = self.main_thread.borrow().control_handle();
        let ctl = control.try_borrow().ok()?;
        let depth = ctl.call_depth();
        if level >= depth {
            return None;
        }
        Some(describe_frame(&ctl.call_stack[depth - 1 - level]))
    }
}

impl Drop for NewtVm {
    fn drop(&mut self) {
        self.shared.borrow_mut().teardown();
    }
}
