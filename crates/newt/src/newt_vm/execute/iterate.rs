//! The foreach protocol. Tables, arrays, strings and classes carry
//! their own cursors; instances and user data go through `_nexti`;
//! generators are pumped one yield per step.

use crate::gc::GcRef;
use crate::newt_value::{NewtGenerator, NewtValue};
use crate::newt_vm::call_info::TARGET_NONE;
use crate::newt_vm::opcode::Instruction;
use crate::newt_vm::{MetaMethod, NewtError, NewtResult, VmContext};

use super::jump;

impl VmContext<'_> {
    /// Container in R[a0]; key, value and cursor land in R[a2..a2+2].
    /// When the container is exhausted the instruction jumps `a1` past
    /// the loop body, otherwise it falls through into it.
    pub(crate) fn op_foreach(&mut self, inst: Instruction, ip: &mut usize) -> NewtResult<()> {
        let container = self.reg(inst.a0);
        let kreg = inst.a2;
        let vreg = inst.a2 + 1;
        let creg = inst.a2 + 2;
        let int_cursor = match self.reg(creg) {
            NewtValue::Integer(i) => i,
            _ => 0,
        };
        let step = match &container {
            NewtValue::Table(t) => t.borrow().next(int_cursor),
            NewtValue::Array(a) => a.borrow().next(int_cursor),
            NewtValue::String(s) => {
                let bytes = s.as_str().as_bytes();
                if int_cursor >= 0 && (int_cursor as usize) < bytes.len() {
                    let i = int_cursor as usize;
                    Some((
                        NewtValue::Integer(int_cursor),
                        NewtValue::Integer(bytes[i] as i64),
                        int_cursor + 1,
                    ))
                } else {
                    None
                }
            }
            NewtValue::Class(c) => c.borrow().next_member(int_cursor),
            NewtValue::Instance(_) | NewtValue::UserData(_) => {
                return self.foreach_nexti(&container, inst, ip);
            }
            NewtValue::Generator(g) => {
                return self.foreach_generator(&g.clone(), inst, ip);
            }
            _ => {
                let msg = format!("cannot iterate a {}", container.type_name());
                return Err(self.raise(&msg));
            }
        };
        match step {
            Some((key, value, next)) => {
                self.set_reg(kreg, key);
                self.set_reg(vreg, value);
                self.set_reg(creg, NewtValue::Integer(next));
            }
            None => jump(ip, inst.a1),
        }
        Ok(())
    }

    /// `_nexti` gets the previous iterator value (null on the first
    /// step) and answers with the next key, or null when done. The
    /// value is then fetched through a raw-falling lookup on that key.
    fn foreach_nexti(
        &mut self,
        container: &NewtValue,
        inst: Instruction,
        ip: &mut usize,
    ) -> NewtResult<()> {
        let Some(mm) = self.metamethod_of(container, MetaMethod::NextI) else {
            let msg = format!("cannot iterate a {}", container.type_name());
            return Err(self.raise(&msg));
        };
        let kreg = inst.a2;
        let vreg = inst.a2 + 1;
        let creg = inst.a2 + 2;
        let prev = self.reg(creg);
        let key = self.call_metamethod(&mm, container.clone(), &[prev])?;
        self.set_reg(kreg, key.clone());
        self.set_reg(creg, key.clone());
        if key.is_null() {
            jump(ip, inst.a1);
            return Ok(());
        }
        let value = match self.get_slot(container, &key, 0) {
            Ok(v) => v,
            Err(NewtError::Suspend) => return Err(NewtError::Suspend),
            Err(_) => return Err(self.raise("_nexti returned an invalid index")),
        };
        self.set_reg(vreg, value);
        Ok(())
    }

    /// One loop step resumes the generator and runs it to its next
    /// yield on this thread's stack. Synthetic integer keys count the
    /// steps; a generator that finishes ends the loop and its return
    /// value is dropped.
    fn foreach_generator(
        &mut self,
        generator: &GcRef<NewtGenerator>,
        inst: Instruction,
        ip: &mut usize,
    ) -> NewtResult<()> {
        if generator.borrow().is_dead() {
            jump(ip, inst.a1);
            return Ok(());
        }
        let max_depth = self.shared.borrow().options.max_native_depth;
        if self.ctl.native_depth >= max_depth {
            return Err(self.raise("native stack overflow"));
        }
        self.resume_generator(generator, TARGET_NONE, true)?;
        self.ctl.native_depth += 1;
        let result = self.dispatch(false);
        self.ctl.native_depth -= 1;
        let value = result?;
        if generator.borrow().is_dead() {
            jump(ip, inst.a1);
            return Ok(());
        }
        let kreg = inst.a2;
        let vreg = inst.a2 + 1;
        let creg = inst.a2 + 2;
        let idx = match self.reg(creg) {
            NewtValue::Integer(i) => i + 1,
            _ => 0,
        };
        self.set_reg(kreg, NewtValue::Integer(idx));
        self.set_reg(vreg, value);
        self.set_reg(creg, NewtValue::Integer(idx));
        Ok(())
    }
}
