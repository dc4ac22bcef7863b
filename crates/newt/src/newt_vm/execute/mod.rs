mod arith;
mod compare;
mod iterate;
mod slots;

use std::rc::Rc;

use crate::gc::GcRef;
use crate::newt_value::{
    typemask_accepts, FunctionProto, GeneratorState, NativeClosure, NativeReturn, NewtClass,
    NewtClosure, NewtGenerator, NewtValue, OuterKind, ParamCheck, SavedFrame,
};
use crate::newt_vm::call_info::{CallInfo, Trap, TARGET_NONE};
use crate::newt_vm::newt_thread::{reserve_stack, ThreadStatus};
use crate::newt_vm::opcode::{
    Instruction, Op, ARG_NONE, NEWOBJ_ARRAY, NEWOBJ_CLASS, NEWOBJ_CLASS_ABSTRACT, NEWOBJ_TABLE,
    NEWSLOT_FLAG_ATTRS, NEWSLOT_FLAG_STATIC,
};
use crate::newt_vm::{HookEvent, MetaMethod, NewtError, NewtResult, VmContext};

/// How a call target was entered.
enum CallFlow {
    /// A script frame was pushed; dispatch continues inside it.
    Entered,
    /// The call completed in place with this result.
    Done(NewtValue),
}

/// Where control goes after one instruction.
enum StepFlow {
    Next,
    /// The current frame changed (call, return into caller, trap);
    /// re-read it.
    Reenter,
    /// The invocation's root frame returned this value.
    Return(NewtValue),
}

/// Where a returning or yielding frame delivers its value.
enum ReturnFlow {
    Root(NewtValue),
    Caller,
}

#[inline]
pub(crate) fn jump(ip: &mut usize, offset: i32) {
    *ip = (*ip as i64 + offset as i64) as usize;
}

impl VmContext<'_> {
    // ============ register access ============
    //
    // Bytecode operands address slots inside the current frame window.
    // Frame setup guarantees the backing vector covers the whole window,
    // and instructions are trusted to stay inside it; prototypes come
    // from the host, the serializer or a compiler, not from scripts.

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.ctl.stack_base
    }

    #[inline]
    pub(crate) fn reg(&self, r: u8) -> NewtValue {
        self.stack.borrow()[self.ctl.stack_base + r as usize].clone()
    }

    #[inline]
    pub(crate) fn reg_wide(&self, r: i32) -> NewtValue {
        self.stack.borrow()[self.ctl.stack_base + r as usize].clone()
    }

    #[inline]
    pub(crate) fn set_reg(&self, r: u8, value: NewtValue) {
        self.stack.borrow_mut()[self.ctl.stack_base + r as usize] = value;
    }

    #[inline]
    fn hook_installed(&self) -> bool {
        self.shared.borrow().debug_hook.is_some()
    }

    fn fire_hook(&self, event: HookEvent<'_>) {
        let hook = self.shared.borrow().debug_hook.clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    fn current_closure(&self) -> Option<GcRef<NewtClosure>> {
        match self.ctl.current_frame() {
            Some(CallInfo {
                closure: NewtValue::Closure(c),
                ..
            }) => Some(c.clone()),
            _ => None,
        }
    }

    fn reserve(&mut self, top: usize, extra: usize) -> NewtResult<()> {
        let max = self.shared.borrow().options.max_stack_size;
        reserve_stack(self.stack, self.ctl, top, extra, max)
    }

    // ============ host entry points ============

    /// Run `callable` on this thread as a fresh invocation. With
    /// `raise_error`, an error that no trap catches invokes the
    /// registered error handler before propagating.
    pub(crate) fn host_call(
        &mut self,
        callable: NewtValue,
        this: NewtValue,
        args: &[NewtValue],
        raise_error: bool,
    ) -> NewtResult<NewtValue> {
        self.ctl.status = ThreadStatus::Running;
        let saved_top = self.ctl.stack_top;
        let result = self.host_call_inner(callable, this, args, raise_error);
        if !matches!(result, Err(NewtError::Suspend)) {
            let top_now = self.ctl.stack_top;
            if top_now > saved_top {
                let mut stack = self.stack.borrow_mut();
                for slot in saved_top..top_now {
                    stack[slot] = NewtValue::Null;
                }
            }
            self.ctl.stack_top = saved_top;
            self.ctl.status = if self.ctl.call_stack.is_empty() {
                ThreadStatus::Idle
            } else {
                ThreadStatus::Running
            };
        }
        result
    }

    fn host_call_inner(
        &mut self,
        callable: NewtValue,
        this: NewtValue,
        args: &[NewtValue],
        raise_error: bool,
    ) -> NewtResult<NewtValue> {
        let top = self.ctl.stack_top;
        self.reserve(top, args.len() + 2)?;
        {
            let mut stack = self.stack.borrow_mut();
            stack[top] = callable.clone();
            stack[top + 1] = this;
            for (i, arg) in args.iter().enumerate() {
                stack[top + 2 + i] = arg.clone();
            }
        }
        self.ctl.stack_top = top + 2 + args.len();
        match self.start_call(callable, TARGET_NONE, top + 1, args.len() + 1, true) {
            Ok(CallFlow::Done(value)) => Ok(value),
            Ok(CallFlow::Entered) => self.dispatch(raise_error),
            Err(NewtError::Suspend) => Err(NewtError::Suspend),
            Err(err) => {
                let err = self.promote_error(err);
                if raise_error {
                    self.call_error_handler();
                }
                Err(err)
            }
        }
    }

    /// Nested call used by natives, metamethods and constructors. Runs
    /// to completion on the Rust stack, so suspension inside it is
    /// refused.
    pub fn call_value(
        &mut self,
        callable: &NewtValue,
        this: NewtValue,
        args: &[NewtValue],
    ) -> NewtResult<NewtValue> {
        let max_depth = self.shared.borrow().options.max_native_depth;
        if self.ctl.native_depth >= max_depth {
            return Err(self.raise("native stack overflow"));
        }
        self.ctl.native_depth += 1;
        let saved_top = self.ctl.stack_top;
        let result = self.host_call_inner(callable.clone(), this, args, false);
        if !matches!(result, Err(NewtError::Suspend)) {
            let top_now = self.ctl.stack_top;
            if top_now > saved_top {
                let mut stack = self.stack.borrow_mut();
                for slot in saved_top..top_now {
                    stack[slot] = NewtValue::Null;
                }
            }
            self.ctl.stack_top = saved_top;
        }
        self.ctl.native_depth -= 1;
        result
    }

    /// Metamethod invocation; the value stack cannot grow while one
    /// runs.
    pub(crate) fn call_metamethod(
        &mut self,
        mm_value: &NewtValue,
        this: NewtValue,
        args: &[NewtValue],
    ) -> NewtResult<NewtValue> {
        self.ctl.no_resize += 1;
        let result = self.call_value(mm_value, this, args);
        self.ctl.no_resize -= 1;
        result
    }

    /// Metamethod slot for a value: tables and user data resolve the
    /// interned name through their delegate, instances through their
    /// class's slot array.
    pub(crate) fn metamethod_of(&self, value: &NewtValue, mm: MetaMethod) -> Option<NewtValue> {
        match value {
            NewtValue::Table(t) => {
                let name = self.shared.borrow().metamethod_name(mm);
                let delegate = t.borrow().delegate()?.clone();
                let found = delegate.borrow().get(&NewtValue::String(name))?;
                if found.is_null() { None } else { Some(found) }
            }
            NewtValue::UserData(u) => {
                let name = self.shared.borrow().metamethod_name(mm);
                let delegate = u.borrow().delegate.clone()?;
                let found = delegate.borrow().get(&NewtValue::String(name))?;
                if found.is_null() { None } else { Some(found) }
            }
            NewtValue::Instance(i) => {
                let class = i.borrow().class.clone();
                let found = class.borrow().metamethod(mm)?;
                Some(found)
            }
            _ => None,
        }
    }

    /// Continue a suspended thread. Delivers `value` to the register
    /// the suspending call was targeting, then re-enters dispatch.
    pub(crate) fn wakeup(&mut self, value: Option<NewtValue>) -> NewtResult<NewtValue> {
        self.ctl.status = ThreadStatus::Running;
        let target = self.ctl.suspended_target.take();
        if self.ctl.call_stack.is_empty() {
            // Suspended straight out of a root native; nothing left to
            // run, the wakeup value is the call's result.
            self.settle_idle();
            return Ok(value.unwrap_or(NewtValue::Null));
        }
        if let Some(t) = target {
            if t != TARGET_NONE {
                let slot = self.ctl.stack_base + t as usize;
                self.stack.borrow_mut()[slot] = value.unwrap_or(NewtValue::Null);
            }
        }
        let result = self.dispatch(true);
        if !matches!(result, Err(NewtError::Suspend)) && self.ctl.call_stack.is_empty() {
            self.settle_idle();
        }
        result
    }

    /// The suspending call's marshal window was kept alive across the
    /// suspension; once the last frame is gone, scrub it.
    fn settle_idle(&mut self) {
        let base = self.ctl.stack_base;
        let top = self.ctl.stack_top;
        if top > base {
            let mut stack = self.stack.borrow_mut();
            for slot in base..top {
                stack[slot] = NewtValue::Null;
            }
        }
        self.ctl.stack_top = base;
        self.ctl.status = ThreadStatus::Idle;
    }

    // ============ the dispatch loop ============

    fn dispatch(&mut self, raise_error: bool) -> NewtResult<NewtValue> {
        'frame: loop {
            let proto = {
                let Some(ci) = self.ctl.current_frame() else {
                    return Err(self.raise("no frame to execute"));
                };
                match &ci.closure {
                    NewtValue::Closure(c) => c.borrow().proto.clone(),
                    other => {
                        let msg = format!("cannot execute a {}", other.type_name());
                        return Err(self.raise(&msg));
                    }
                }
            };
            let mut ip = match self.ctl.current_frame() {
                Some(ci) => ci.ip,
                None => 0,
            };
            loop {
                if ip >= proto.code.len() {
                    match self.op_return(NewtValue::Null)? {
                        ReturnFlow::Root(value) => return Ok(value),
                        ReturnFlow::Caller => continue 'frame,
                    }
                }
                let inst = proto.code[ip];
                ip += 1;
                if let Some(ci) = self.ctl.current_frame_mut() {
                    ci.ip = ip;
                }
                match self.step(&proto, inst, &mut ip) {
                    Ok(StepFlow::Next) => {}
                    Ok(StepFlow::Reenter) => continue 'frame,
                    Ok(StepFlow::Return(value)) => return Ok(value),
                    Err(NewtError::Suspend) => {
                        if let Some(ci) = self.ctl.current_frame_mut() {
                            ci.ip = ip;
                        }
                        return Err(NewtError::Suspend);
                    }
                    Err(err) => {
                        let err = self.promote_error(err);
                        if self.recover(raise_error) {
                            continue 'frame;
                        }
                        return Err(err);
                    }
                }
            }
        }
    }

    fn step(
        &mut self,
        proto: &Rc<FunctionProto>,
        inst: Instruction,
        ip: &mut usize,
    ) -> NewtResult<StepFlow> {
        let (a0, a1, a2, a3) = (inst.a0, inst.a1, inst.a2, inst.a3);
        match inst.op {
            Op::Line => {
                if self.hook_installed() {
                    self.fire_hook(HookEvent::Line {
                        source: proto.source_str(),
                        line: a1.max(0) as u32,
                    });
                }
            }
            Op::LoadLiteral => {
                let Some(value) = proto.literals.get(a1 as usize) else {
                    return Err(self.raise("literal index out of range"));
                };
                self.set_reg(a0, value.clone());
            }
            Op::LoadInt => self.set_reg(a0, NewtValue::Integer(a1 as i64)),
            Op::LoadBool => self.set_reg(a0, NewtValue::Bool(a1 != 0)),
            Op::LoadNulls => {
                let base = self.base() + a0 as usize;
                let mut stack = self.stack.borrow_mut();
                for slot in base..base + a1 as usize {
                    stack[slot] = NewtValue::Null;
                }
            }
            Op::Move => {
                let value = self.reg_wide(a1);
                self.set_reg(a0, value);
            }
            Op::LoadRoot => {
                let root = self.shared.borrow().root_table.clone();
                self.set_reg(a0, root);
            }
            Op::NewObj => match a3 {
                NEWOBJ_TABLE => {
                    let t = self
                        .shared
                        .borrow_mut()
                        .create_table_with_capacity(a1.max(0) as usize);
                    self.set_reg(a0, NewtValue::Table(t));
                }
                NEWOBJ_ARRAY => {
                    let arr = self.shared.borrow_mut().create_array(a1.max(0) as usize);
                    self.set_reg(a0, NewtValue::Array(arr));
                }
                NEWOBJ_CLASS => self.op_new_class(a0, a1, a2, false)?,
                NEWOBJ_CLASS_ABSTRACT => self.op_new_class(a0, a1, a2, true)?,
                _ => return Err(self.raise("malformed object constructor")),
            },
            Op::AppendArray => {
                let target = self.reg(a0);
                let NewtValue::Array(arr) = target else {
                    let msg = format!("cannot append to a {}", target.type_name());
                    return Err(self.raise(&msg));
                };
                let value = self.reg_wide(a1);
                arr.borrow_mut().push(value);
            }
            Op::NewSlot => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let value = self.reg(a3);
                self.new_slot_value(&container, key, value.clone(), false)?;
                if a0 != ARG_NONE {
                    self.set_reg(a0, value);
                }
            }
            Op::NewSlotA => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let value = self.reg(a3);
                let attrs = if a0 & NEWSLOT_FLAG_ATTRS != 0 {
                    self.reg(a2 - 1)
                } else {
                    NewtValue::Null
                };
                let is_static = a0 & NEWSLOT_FLAG_STATIC != 0;
                self.op_new_slot_a(&container, key, value, attrs, is_static)?;
            }
            Op::Set => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let value = self.reg(a3);
                // Writes through the receiver register may land on an
                // existing root-table slot.
                let this_set = a1 == 0;
                self.set_slot(&container, &key, value.clone(), this_set)?;
                if a0 != ARG_NONE {
                    self.set_reg(a0, value);
                }
            }
            Op::Get => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let value = self.get_slot(&container, &key, a3)?;
                self.set_reg(a0, value);
            }
            Op::DeleteSlot => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let removed = self.delete_slot_value(&container, &key)?;
                self.set_reg(a0, removed);
            }
            Op::GetOuter => {
                let Some(closure) = self.current_closure() else {
                    return Err(self.raise("no outers in this frame"));
                };
                let cell = closure.borrow().outers.get(a1 as usize).cloned();
                let Some(cell) = cell else {
                    return Err(self.raise("outer index out of range"));
                };
                self.set_reg(a0, cell.get());
            }
            Op::SetOuter => {
                let Some(closure) = self.current_closure() else {
                    return Err(self.raise("no outers in this frame"));
                };
                let cell = closure.borrow().outers.get(a1 as usize).cloned();
                let Some(cell) = cell else {
                    return Err(self.raise("outer index out of range"));
                };
                let value = self.reg(a2);
                cell.set(value.clone());
                if a0 != ARG_NONE {
                    self.set_reg(a0, value);
                }
            }
            Op::Call => {
                let target = if a0 == ARG_NONE { TARGET_NONE } else { a0 as i32 };
                return self.op_call(target, a1, a2, a3 as usize);
            }
            Op::Equals => {
                let eq = compare::vm_eq(&self.reg(a2), &self.reg_wide(a1));
                self.set_reg(a0, NewtValue::Bool(eq));
            }
            Op::NotEquals => {
                let eq = compare::vm_eq(&self.reg(a2), &self.reg_wide(a1));
                self.set_reg(a0, NewtValue::Bool(!eq));
            }
            Op::Cmp => {
                let lhs = self.reg(a2);
                let rhs = self.reg_wide(a1);
                let value = self.compare_op(&lhs, &rhs, a3)?;
                self.set_reg(a0, value);
            }
            Op::Arith => {
                let lhs = self.reg(a2);
                let rhs = self.reg_wide(a1);
                let value = self.arith(a3, lhs, rhs)?;
                self.set_reg(a0, value);
            }
            Op::Neg => {
                let value = self.neg_value(self.reg_wide(a1))?;
                self.set_reg(a0, value);
            }
            Op::Not => {
                let truthy = self.reg_wide(a1).is_truthy();
                self.set_reg(a0, NewtValue::Bool(!truthy));
            }
            Op::BwNot => {
                let value = self.reg_wide(a1);
                let NewtValue::Integer(i) = value else {
                    let msg = format!("bitwise negation of a {}", value.type_name());
                    return Err(self.raise(&msg));
                };
                self.set_reg(a0, NewtValue::Integer(!i));
            }
            Op::Bitw => {
                let lhs = self.reg(a2);
                let rhs = self.reg_wide(a1);
                let value = self.bitwise(a3, &lhs, &rhs)?;
                self.set_reg(a0, value);
            }
            Op::Jmp => jump(ip, a1),
            Op::JmpFalse => {
                if !self.reg(a0).is_truthy() {
                    jump(ip, a1);
                }
            }
            Op::And => {
                let value = self.reg(a2);
                if !value.is_truthy() {
                    self.set_reg(a0, value);
                    jump(ip, a1);
                }
            }
            Op::Or => {
                let value = self.reg(a2);
                if value.is_truthy() {
                    self.set_reg(a0, value);
                    jump(ip, a1);
                }
            }
            Op::Exists => {
                let container = self.reg_wide(a1);
                let key = self.reg(a2);
                let found = self.raw_get(&container, &key).is_some();
                self.set_reg(a0, NewtValue::Bool(found));
            }
            Op::InstanceOf => {
                let class_value = self.reg_wide(a1);
                let NewtValue::Class(class) = &class_value else {
                    let msg = format!(
                        "cannot apply instanceof between a {} and a {}",
                        self.reg(a2).type_name(),
                        class_value.type_name()
                    );
                    return Err(self.raise(&msg));
                };
                let value = self.reg(a2);
                let is = match &value {
                    NewtValue::Instance(i) => i.borrow().is_instance_of(class),
                    _ => false,
                };
                self.set_reg(a0, NewtValue::Bool(is));
            }
            Op::TypeOf => {
                let value = self.reg_wide(a1);
                let name = self.type_of_value(&value)?;
                self.set_reg(a0, name);
            }
            Op::Clone => {
                let value = self.reg_wide(a1);
                let cloned = self.clone_value(&value)?;
                self.set_reg(a0, cloned);
            }
            Op::Closure => {
                self.op_make_closure(proto, a0, a1)?;
            }
            Op::Return => {
                let value = if a0 == ARG_NONE {
                    NewtValue::Null
                } else {
                    self.reg_wide(a1)
                };
                return match self.op_return(value)? {
                    ReturnFlow::Root(value) => Ok(StepFlow::Return(value)),
                    ReturnFlow::Caller => Ok(StepFlow::Reenter),
                };
            }
            Op::Yield => {
                let value = if a0 == ARG_NONE {
                    NewtValue::Null
                } else {
                    self.reg_wide(a1)
                };
                return match self.op_yield(value, *ip)? {
                    ReturnFlow::Root(value) => Ok(StepFlow::Return(value)),
                    ReturnFlow::Caller => Ok(StepFlow::Reenter),
                };
            }
            Op::Resume => {
                let target = if a0 == ARG_NONE { TARGET_NONE } else { a0 as i32 };
                let value = self.reg_wide(a1);
                let NewtValue::Generator(g) = &value else {
                    let msg = format!("cannot resume a {}", value.type_name());
                    return Err(self.raise(&msg));
                };
                self.resume_generator(&g.clone(), target, false)?;
                return Ok(StepFlow::Reenter);
            }
            Op::Foreach => {
                self.op_foreach(inst, ip)?;
            }
            Op::PushTrap => {
                let handler = (*ip as i64 + a1 as i64) as usize;
                let base = self.ctl.stack_base;
                self.ctl.traps.push(Trap {
                    ip: handler,
                    stack_base: base,
                    stack_size: self.ctl.stack_top - base,
                    target: a0,
                });
                if let Some(ci) = self.ctl.current_frame_mut() {
                    ci.n_traps += 1;
                }
            }
            Op::PopTrap => {
                for _ in 0..a0 {
                    self.ctl.traps.pop();
                    if let Some(ci) = self.ctl.current_frame_mut() {
                        ci.n_traps = ci.n_traps.saturating_sub(1);
                    }
                }
            }
            Op::Throw => {
                let value = self.reg(a0);
                return Err(self.raise_value(value));
            }
            Op::Close => {
                let from = self.ctl.stack_base + a1 as usize;
                self.ctl.close_outers_from(self.stack, from);
            }
            Op::GetBase => {
                let base = self
                    .current_closure()
                    .and_then(|c| c.borrow().base.clone())
                    .map(NewtValue::Class)
                    .unwrap_or(NewtValue::Null);
                self.set_reg(a0, base);
            }
        }
        Ok(StepFlow::Next)
    }

    // ============ calls ============

    fn op_call(
        &mut self,
        target: i32,
        func_reg: i32,
        window_reg: u8,
        n_args: usize,
    ) -> NewtResult<StepFlow> {
        let func = self.reg_wide(func_reg);
        let abs_this = self.base() + window_reg as usize;
        match self.start_call(func, target, abs_this, n_args, false)? {
            CallFlow::Entered => Ok(StepFlow::Reenter),
            CallFlow::Done(value) => {
                if target != TARGET_NONE {
                    self.set_reg(target as u8, value);
                }
                Ok(StepFlow::Next)
            }
        }
    }

    /// Begin a call with the receiver and arguments already in place at
    /// `abs_this` onward. The slot just below holds (or receives) the
    /// callee.
    fn start_call(
        &mut self,
        func: NewtValue,
        target: i32,
        abs_this: usize,
        n_args: usize,
        root: bool,
    ) -> NewtResult<CallFlow> {
        match func {
            NewtValue::Closure(ref c) => {
                let c = c.clone();
                let (proto, env) = {
                    let body = c.borrow();
                    (body.proto.clone(), body.env.clone())
                };
                self.reserve(abs_this, proto.stack_size.max(n_args))?;
                if let Some(env) = env {
                    self.stack.borrow_mut()[abs_this] = env.deref_value();
                }
                self.bind_params(&proto, &c, abs_this, n_args)?;
                if proto.is_generator {
                    let r#gen = self.capture_generator(func.clone(), abs_this, &proto);
                    return Ok(CallFlow::Done(NewtValue::Generator(r#gen)));
                }
                self.enter_frame(func, &proto, abs_this, target, root)?;
                Ok(CallFlow::Entered)
            }
            NewtValue::NativeClosure(ref nc) => {
                let value = self.call_native(&nc.clone(), target, abs_this, n_args)?;
                Ok(CallFlow::Done(value))
            }
            NewtValue::Class(ref class) => {
                let value = self.construct_instance(&class.clone(), target, abs_this, n_args)?;
                Ok(CallFlow::Done(value))
            }
            NewtValue::Table(_) | NewtValue::Instance(_) | NewtValue::UserData(_) => {
                let Some(mm) = self.metamethod_of(&func, MetaMethod::Call) else {
                    let msg = format!("attempt to call a {}", func.type_name());
                    return Err(self.raise(&msg));
                };
                // The object becomes the receiver; the original receiver
                // and arguments follow it.
                let mut args = Vec::with_capacity(n_args);
                {
                    let stack = self.stack.borrow();
                    for i in 0..n_args {
                        args.push(stack[abs_this + i].clone());
                    }
                }
                let value = self.call_metamethod(&mm, func.clone(), &args)?;
                Ok(CallFlow::Done(value))
            }
            other => {
                let msg = format!("attempt to call a {}", other.type_name());
                Err(self.raise(&msg))
            }
        }
    }

    /// Fit `n_given` arguments to the prototype: spill varargs into an
    /// array bound to the last parameter, or fill missing trailing
    /// parameters from the closure's defaults.
    fn bind_params(
        &mut self,
        proto: &FunctionProto,
        closure: &GcRef<NewtClosure>,
        base: usize,
        n_given: usize,
    ) -> NewtResult<()> {
        let n_params = proto.param_count();
        if proto.has_varargs {
            let Some(named) = n_params.checked_sub(1) else {
                return Err(self.raise("wrong number of parameters"));
            };
            if n_given < named {
                return Err(self.raise("wrong number of parameters"));
            }
            let surplus = n_given - named;
            let mut rest = Vec::with_capacity(surplus);
            {
                let mut stack = self.stack.borrow_mut();
                for i in 0..surplus {
                    rest.push(std::mem::replace(
                        &mut stack[base + named + i],
                        NewtValue::Null,
                    ));
                }
            }
            let arr = self.shared.borrow_mut().create_array_from(rest);
            self.stack.borrow_mut()[base + named] = NewtValue::Array(arr);
        } else if n_given != n_params {
            let defaults = closure.borrow().default_params.clone();
            let missing = n_params.saturating_sub(n_given);
            if n_given < n_params && missing <= defaults.len() {
                let mut stack = self.stack.borrow_mut();
                for i in 0..missing {
                    stack[base + n_given + i] = defaults[defaults.len() - missing + i].clone();
                }
            } else {
                return Err(self.raise("wrong number of parameters"));
            }
        }
        Ok(())
    }

    fn enter_frame(
        &mut self,
        closure_value: NewtValue,
        proto: &FunctionProto,
        base: usize,
        target: i32,
        root: bool,
    ) -> NewtResult<()> {
        let max_depth = self.shared.borrow().options.max_call_depth;
        if self.ctl.call_depth() >= max_depth {
            return Err(self.raise("call stack overflow"));
        }
        {
            // The callee parks just below its frame so a stack walk alone
            // reaches every live closure, even mid-collection when the
            // control block is unborrowable.
            let mut stack = self.stack.borrow_mut();
            stack[base - 1] = closure_value.clone();
            // Scrub non-parameter slots left over from earlier frames.
            for slot in base + proto.param_count()..base + proto.stack_size {
                stack[slot] = NewtValue::Null;
            }
        }
        let mut ci = CallInfo::new(closure_value, self.ctl.stack_base, self.ctl.stack_top, target);
        ci.root = root;
        self.ctl.call_stack.push(ci);
        self.ctl.stack_base = base;
        self.ctl.stack_top = base + proto.stack_size;
        if self.hook_installed() {
            self.fire_hook(HookEvent::Call {
                source: proto.source_str(),
                function: proto.name_str(),
                line: proto.line_at(0),
            });
        }
        Ok(())
    }

    /// Calling a generator-flagged closure binds its parameters, then
    /// lifts the would-be frame into a fresh suspended generator instead
    /// of running it.
    fn capture_generator(
        &mut self,
        closure_value: NewtValue,
        base: usize,
        proto: &FunctionProto,
    ) -> GcRef<NewtGenerator> {
        let mut window = Vec::with_capacity(proto.stack_size);
        {
            // Only the bound parameters are live; the rest of the window
            // starts out null, and slots above them may hold caller junk.
            let mut stack = self.stack.borrow_mut();
            for slot in base..base + proto.param_count() {
                window.push(std::mem::replace(&mut stack[slot], NewtValue::Null));
            }
            for slot in base + proto.param_count()..base + proto.stack_size {
                stack[slot] = NewtValue::Null;
                window.push(NewtValue::Null);
            }
        }
        let mut r#gen = NewtGenerator::new(closure_value);
        r#gen.suspend(SavedFrame {
            ip: 0,
            window,
            traps: Vec::new(),
            detached_outers: Vec::new(),
        });
        self.shared.borrow_mut().create_generator(r#gen)
    }

    fn call_native(
        &mut self,
        nc: &GcRef<NativeClosure>,
        target: i32,
        base: usize,
        n_args: usize,
    ) -> NewtResult<NewtValue> {
        let check = nc.borrow().param_check;
        match check {
            ParamCheck::Exact(n) if n_args != n => {
                return Err(self.raise("wrong number of parameters"));
            }
            ParamCheck::AtLeast(n) if n_args < n => {
                return Err(self.raise("wrong number of parameters"));
            }
            _ => {}
        }
        let type_fault = {
            let body = nc.borrow();
            let stack = self.stack.borrow();
            let mut fault = None;
            if let Some(masks) = &body.typemask {
                for (i, mask) in masks.iter().enumerate() {
                    if i >= n_args {
                        break;
                    }
                    let value = &stack[base + i];
                    if !typemask_accepts(*mask, value) {
                        fault = Some((i, value.type_name()));
                        break;
                    }
                }
            }
            fault
        };
        if let Some((pos, found)) = type_fault {
            let msg = format!("parameter {} has an invalid type '{}'", pos, found);
            return Err(self.raise(&msg));
        }
        let max_depth = self.shared.borrow().options.max_native_depth;
        if self.ctl.native_depth >= max_depth {
            return Err(self.raise("native stack overflow"));
        }
        if let Some(env) = nc.borrow().env.clone() {
            self.stack.borrow_mut()[base] = env.deref_value();
        }

        let closure_value = NewtValue::NativeClosure(nc.clone());
        self.stack.borrow_mut()[base - 1] = closure_value.clone();
        let ci = CallInfo::new(
            closure_value,
            self.ctl.stack_base,
            self.ctl.stack_top,
            TARGET_NONE,
        );
        self.ctl.call_stack.push(ci);
        self.ctl.stack_base = base;
        self.ctl.stack_top = base + n_args;
        self.ctl.native_depth += 1;
        let previous = self.current_native.replace(nc.clone());
        let function = nc.borrow().function;

        let result = function(self);

        self.current_native = previous;
        self.ctl.native_depth -= 1;
        if let Some(ci) = self.ctl.call_stack.pop() {
            self.ctl.stack_base = ci.prev_base;
            self.ctl.stack_top = ci.prev_top;
        }

        match result {
            Ok(NativeReturn::NoValue) => Ok(NewtValue::Null),
            Ok(NativeReturn::Value(value)) => Ok(value),
            Ok(NativeReturn::Suspend) => {
                if self.thread.borrow().is_main {
                    Err(self.raise("cannot suspend the main thread"))
                } else if self.ctl.native_depth > 0 {
                    Err(self.raise("cannot suspend through native calls or metamethods"))
                } else {
                    self.ctl.suspended_target = Some(target);
                    self.ctl.status = ThreadStatus::Suspended;
                    Err(NewtError::Suspend)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Calling a class builds an instance. The result register is
    /// filled before the constructor runs, matching what an erroring
    /// constructor's trap handler observes.
    fn construct_instance(
        &mut self,
        class: &GcRef<NewtClass>,
        target: i32,
        base: usize,
        n_args: usize,
    ) -> NewtResult<NewtValue> {
        let (is_abstract, ctor) = {
            let body = class.borrow();
            (body.is_abstract, body.constructor())
        };
        if is_abstract {
            return Err(self.raise("cannot instantiate an abstract class"));
        }
        let instance = self.shared.borrow_mut().create_instance(class.clone());
        let value = NewtValue::Instance(instance);
        if target != TARGET_NONE && !self.ctl.call_stack.is_empty() {
            self.set_reg(target as u8, value.clone());
        }
        if let Some(ctor) = ctor {
            let mut args = Vec::with_capacity(n_args.saturating_sub(1));
            {
                let stack = self.stack.borrow();
                for i in 1..n_args {
                    args.push(stack[base + i].clone());
                }
            }
            self.call_value(&ctor, value.clone(), &args)?;
        }
        Ok(value)
    }

    // ============ returns, yields, resumes ============

    /// Pop the current frame: drop its traps, close outers aliasing its
    /// window, kill its generator, restore the caller's geometry and
    /// scrub slots above it. Returns the record for value delivery.
    fn leave_frame(&mut self) -> Option<CallInfo> {
        let ci = self.ctl.call_stack.pop()?;
        for _ in 0..ci.n_traps {
            self.ctl.traps.pop();
        }
        let base = self.ctl.stack_base;
        let top = self.ctl.stack_top;
        self.ctl.close_outers_from(self.stack, base);
        if let Some(weak) = &ci.generator {
            if let Some(generator) = weak.upgrade() {
                generator.borrow_mut().kill();
            }
        }
        self.ctl.stack_base = ci.prev_base;
        self.ctl.stack_top = ci.prev_top;
        if top > ci.prev_top {
            let mut stack = self.stack.borrow_mut();
            for slot in ci.prev_top..top {
                stack[slot] = NewtValue::Null;
            }
        }
        Some(ci)
    }

    fn op_return(&mut self, value: NewtValue) -> NewtResult<ReturnFlow> {
        if self.hook_installed() {
            let returning = match self.ctl.current_frame() {
                Some(ci) => match &ci.closure {
                    NewtValue::Closure(c) => {
                        Some((c.borrow().proto.clone(), ci.ip.saturating_sub(1)))
                    }
                    _ => None,
                },
                None => None,
            };
            if let Some((proto, ip)) = returning {
                self.fire_hook(HookEvent::Return {
                    source: proto.source_str(),
                    function: proto.name_str(),
                    line: proto.line_at(ip),
                });
            }
        }
        let Some(ci) = self.leave_frame() else {
            return Err(self.raise("return with no frame"));
        };
        if ci.root {
            return Ok(ReturnFlow::Root(value));
        }
        if ci.target != TARGET_NONE {
            self.stack.borrow_mut()[ci.prev_base + ci.target as usize] = value;
        }
        Ok(ReturnFlow::Caller)
    }

    /// Park the current frame inside its generator and deliver `value`
    /// like a return. Open outer cells aliasing the window detach with
    /// it; the frame's traps move along rebased to window offsets.
    fn op_yield(&mut self, value: NewtValue, resume_ip: usize) -> NewtResult<ReturnFlow> {
        let generator = match self.ctl.current_frame() {
            Some(ci) => match &ci.generator {
                Some(weak) => weak.upgrade(),
                None => None,
            },
            None => None,
        };
        let Some(generator) = generator else {
            return Err(self.raise("trying to yield outside a generator"));
        };

        let base = self.ctl.stack_base;
        let top = self.ctl.stack_top;
        let Some(ci) = self.ctl.call_stack.pop() else {
            return Err(self.raise("yield with no frame"));
        };
        let keep = self.ctl.traps.len() - ci.n_traps;
        let traps = self
            .ctl
            .traps
            .split_off(keep)
            .into_iter()
            .map(|t| Trap {
                ip: t.ip,
                stack_base: 0,
                stack_size: t.stack_size,
                target: t.target,
            })
            .collect();
        let detached_outers = self.ctl.detach_outers_in(self.stack, base, top);
        let mut window = Vec::with_capacity(top - base);
        {
            let mut stack = self.stack.borrow_mut();
            for slot in base..top {
                window.push(std::mem::replace(&mut stack[slot], NewtValue::Null));
            }
        }
        generator.borrow_mut().suspend(SavedFrame {
            ip: resume_ip,
            window,
            traps,
            detached_outers,
        });

        self.ctl.stack_base = ci.prev_base;
        self.ctl.stack_top = ci.prev_top;
        if ci.root {
            return Ok(ReturnFlow::Root(value));
        }
        if ci.target != TARGET_NONE {
            self.stack.borrow_mut()[ci.prev_base + ci.target as usize] = value;
        }
        Ok(ReturnFlow::Caller)
    }

    /// Splice a suspended generator's frame onto this thread above the
    /// current top. The next yield or return delivers into `target` of
    /// the current frame.
    pub(crate) fn resume_generator(
        &mut self,
        generator: &GcRef<NewtGenerator>,
        target: i32,
        root: bool,
    ) -> NewtResult<()> {
        {
            let state = generator.borrow().state;
            match state {
                GeneratorState::Dead => {
                    return Err(self.raise("resuming a dead generator"));
                }
                GeneratorState::Running => {
                    return Err(self.raise("resuming a running generator"));
                }
                GeneratorState::Suspended => {}
            }
        }
        let max_depth = self.shared.borrow().options.max_call_depth;
        if self.ctl.call_depth() >= max_depth {
            return Err(self.raise("call stack overflow"));
        }
        let Some(frame) = generator.borrow_mut().resume_frame() else {
            return Err(self.raise("resuming a dead generator"));
        };
        let new_base = self.ctl.stack_top;
        let window_len = frame.window.len();
        if let Err(err) = self.reserve(new_base, window_len) {
            generator.borrow_mut().suspend(frame);
            return Err(err);
        }
        {
            let mut stack = self.stack.borrow_mut();
            for (i, value) in frame.window.into_iter().enumerate() {
                stack[new_base + i] = value;
            }
        }
        let n_traps = frame.traps.len();
        for t in frame.traps {
            self.ctl.traps.push(Trap {
                ip: t.ip,
                stack_base: new_base,
                stack_size: t.stack_size,
                target: t.target,
            });
        }
        self.ctl
            .reattach_outers(self.stack, new_base, frame.detached_outers);

        let closure = generator.borrow().closure.clone();
        let mut ci = CallInfo::new(closure, self.ctl.stack_base, self.ctl.stack_top, target);
        ci.ip = frame.ip;
        ci.n_traps = n_traps;
        ci.root = root;
        ci.generator = Some(generator.downgrade());
        self.ctl.call_stack.push(ci);
        self.ctl.stack_base = new_base;
        self.ctl.stack_top = new_base + window_len;
        Ok(())
    }

    // ============ errors and unwinding ============

    fn promote_error(&mut self, err: NewtError) -> NewtError {
        match err {
            NewtError::StackOverflow => self.shared.borrow_mut().raise("stack overflow"),
            other => other,
        }
    }

    /// After an error: run the handler if no trap in this invocation
    /// will catch it, then unwind. True when a trap caught the error and
    /// dispatch should continue.
    fn recover(&mut self, raise_error: bool) -> bool {
        if raise_error && !self.invocation_has_trap() {
            self.call_error_handler();
        }
        self.unwind_to_trap()
    }

    fn invocation_has_trap(&self) -> bool {
        for ci in self.ctl.call_stack.iter().rev() {
            if ci.n_traps > 0 {
                return true;
            }
            if ci.root {
                break;
            }
        }
        false
    }

    /// Walk down the invocation's frames looking for the innermost trap.
    /// Frames without one are torn down; with no trap anywhere, the
    /// whole invocation unwinds and the error keeps propagating.
    fn unwind_to_trap(&mut self) -> bool {
        loop {
            let Some(ci) = self.ctl.current_frame() else {
                return false;
            };
            let (has_trap, is_root) = (ci.n_traps > 0, ci.root);
            if has_trap {
                let Some(trap) = self.ctl.traps.pop() else {
                    return false;
                };
                if let Some(ci) = self.ctl.current_frame_mut() {
                    ci.n_traps -= 1;
                    ci.ip = trap.ip;
                }
                self.ctl.stack_base = trap.stack_base;
                self.ctl.stack_top = trap.stack_base + trap.stack_size;
                let error = self.shared.borrow().error_value.clone();
                self.stack.borrow_mut()[trap.stack_base + trap.target as usize] = error;
                return true;
            }
            self.leave_frame();
            if is_root {
                return false;
            }
        }
    }

    /// Invoke the registered error handler with the error value, keeping
    /// the erroring frames in place so it can walk the backtrace. A
    /// missing handler falls back to the error print hook. The pending
    /// error value survives whatever the handler itself does.
    fn call_error_handler(&mut self) {
        let (handler, error) = {
            let shared = self.shared.borrow();
            (shared.error_handler.clone(), shared.error_value.clone())
        };
        if handler.is_null() {
            let printer = self.shared.borrow().error_print_fn.clone();
            if let Some(printer) = printer {
                printer(&error.to_string());
            }
            return;
        }
        let this = self.shared.borrow().root_table.clone();
        let _ = self.call_value(&handler, this, &[error.clone()]);
        self.shared.borrow_mut().error_value = error;
    }

    // ============ object construction ops ============

    fn op_new_class(
        &mut self,
        target: u8,
        base_spec: i32,
        attrs_reg: u8,
        is_abstract: bool,
    ) -> NewtResult<()> {
        let base = if base_spec < 0 {
            None
        } else {
            let value = self.reg_wide(base_spec);
            match value {
                NewtValue::Class(k) => Some(k),
                other => {
                    let msg = format!("trying to inherit from a {}", other.type_name());
                    return Err(self.raise(&msg));
                }
            }
        };
        let attrs = if attrs_reg == ARG_NONE {
            NewtValue::Null
        } else {
            self.reg(attrs_reg)
        };
        let class = self.shared.borrow_mut().create_class(base, is_abstract);
        let inherited = class.borrow().metamethod(MetaMethod::Inherited);
        if let Some(mm) = inherited {
            self.call_metamethod(&mm, NewtValue::Class(class.clone()), &[attrs.clone()])?;
        }
        class.borrow_mut().attributes = attrs;
        self.set_reg(target, NewtValue::Class(class));
        Ok(())
    }

    fn op_make_closure(
        &mut self,
        proto: &Rc<FunctionProto>,
        target: u8,
        proto_idx: i32,
    ) -> NewtResult<()> {
        let Some(child) = proto.child_protos.get(proto_idx as usize).cloned() else {
            return Err(self.raise("function index out of range"));
        };
        let mut closure = NewtClosure::new(child.clone());
        for desc in &child.outer_descs {
            let cell = match desc.kind {
                OuterKind::Local => {
                    let slot = self.ctl.stack_base + desc.src as usize;
                    self.ctl.capture_outer(self.stack, slot)
                }
                OuterKind::Outer => {
                    let enclosing = self.current_closure();
                    let cell = enclosing
                        .as_ref()
                        .and_then(|c| c.borrow().outers.get(desc.src as usize).cloned());
                    let Some(cell) = cell else {
                        return Err(self.raise("outer index out of range"));
                    };
                    cell
                }
            };
            closure.outers.push(cell);
        }
        for &reg in &child.default_param_regs {
            closure.default_params.push(self.reg(reg as u8));
        }
        let created = self.shared.borrow_mut().create_closure(closure);
        self.set_reg(target, NewtValue::Closure(created));
        Ok(())
    }
}
