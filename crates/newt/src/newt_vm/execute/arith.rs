//! Arithmetic, negation and the bitwise group. Integer arithmetic wraps;
//! the two divide-family traps are reported as errors, except
//! `i64::MIN % -1` which is defined to be 0.

use crate::newt_value::NewtValue;
use crate::newt_vm::opcode::{BW_AND, BW_OR, BW_SHL, BW_SHR, BW_USHR, BW_XOR};
use crate::newt_vm::{MetaMethod, NewtResult, VmContext};

fn float_arith(op: u8, a: f64, b: f64) -> f64 {
    match op {
        b'+' => a + b,
        b'-' => a - b,
        b'*' => a * b,
        b'/' => a / b,
        _ => a % b,
    }
}

impl VmContext<'_> {
    /// `op` is the ascii of + - * / %. Mixed integer/float promotes to
    /// float; `+` with a string on either side concatenates; anything
    /// else defers to the left operand's metamethod.
    pub(crate) fn arith(&mut self, op: u8, lhs: NewtValue, rhs: NewtValue) -> NewtResult<NewtValue> {
        match (&lhs, &rhs) {
            (NewtValue::Integer(a), NewtValue::Integer(b)) => self.int_arith(op, *a, *b),
            (NewtValue::Float(a), NewtValue::Float(b)) => {
                Ok(NewtValue::Float(float_arith(op, *a, *b)))
            }
            (NewtValue::Integer(a), NewtValue::Float(b)) => {
                Ok(NewtValue::Float(float_arith(op, *a as f64, *b)))
            }
            (NewtValue::Float(a), NewtValue::Integer(b)) => {
                Ok(NewtValue::Float(float_arith(op, *a, *b as f64)))
            }
            _ => {
                if op == b'+'
                    && (matches!(lhs, NewtValue::String(_)) || matches!(rhs, NewtValue::String(_)))
                {
                    return self.string_cat(&lhs, &rhs);
                }
                let mm = match op {
                    b'+' => MetaMethod::Add,
                    b'-' => MetaMethod::Sub,
                    b'*' => MetaMethod::Mul,
                    b'/' => MetaMethod::Div,
                    _ => MetaMethod::Modulo,
                };
                if let Some(handler) = self.metamethod_of(&lhs, mm) {
                    return self.call_metamethod(&handler, lhs, &[rhs]);
                }
                let msg = format!(
                    "cannot perform arithmetic between a {} and a {}",
                    lhs.type_name(),
                    rhs.type_name()
                );
                Err(self.raise(&msg))
            }
        }
    }

    fn int_arith(&mut self, op: u8, a: i64, b: i64) -> NewtResult<NewtValue> {
        let result = match op {
            b'+' => a.wrapping_add(b),
            b'-' => a.wrapping_sub(b),
            b'*' => a.wrapping_mul(b),
            b'/' => {
                if b == 0 {
                    return Err(self.raise("division by zero"));
                }
                if a == i64::MIN && b == -1 {
                    return Err(self.raise("integer overflow"));
                }
                a / b
            }
            _ => {
                if b == 0 {
                    return Err(self.raise("modulo by zero"));
                }
                if a == i64::MIN && b == -1 {
                    0
                } else {
                    a % b
                }
            }
        };
        Ok(NewtValue::Integer(result))
    }

    /// `+` stringification: both sides through the engine to-string, so a
    /// `_tostring` handler participates.
    fn string_cat(&mut self, lhs: &NewtValue, rhs: &NewtValue) -> NewtResult<NewtValue> {
        let a = self.to_string_inner(lhs)?;
        let b = self.to_string_inner(rhs)?;
        let joined = format!("{}{}", a.as_str(), b.as_str());
        Ok(self.shared.borrow_mut().intern_value(&joined))
    }

    pub(crate) fn neg_value(&mut self, value: NewtValue) -> NewtResult<NewtValue> {
        match &value {
            NewtValue::Integer(i) => Ok(NewtValue::Integer(i.wrapping_neg())),
            NewtValue::Float(f) => Ok(NewtValue::Float(-f)),
            _ => {
                if let Some(mm) = self.metamethod_of(&value, MetaMethod::Unm) {
                    return self.call_metamethod(&mm, value, &[]);
                }
                let msg = format!("attempt to negate a {}", value.type_name());
                Err(self.raise(&msg))
            }
        }
    }

    /// Integer-only. Shift counts are taken modulo the word width so an
    /// out-of-range count cannot trap.
    pub(crate) fn bitwise(
        &mut self,
        kind: u8,
        lhs: &NewtValue,
        rhs: &NewtValue,
    ) -> NewtResult<NewtValue> {
        let (NewtValue::Integer(a), NewtValue::Integer(b)) = (lhs, rhs) else {
            let msg = format!(
                "bitwise operation between a {} and a {}",
                lhs.type_name(),
                rhs.type_name()
            );
            return Err(self.raise(&msg));
        };
        let result = match kind {
            BW_AND => a & b,
            BW_OR => a | b,
            BW_XOR => a ^ b,
            BW_SHL => a << (b & 63),
            BW_SHR => a >> (b & 63),
            BW_USHR => ((*a as u64) >> (b & 63)) as i64,
            _ => return Err(self.raise("malformed bitwise operation")),
        };
        Ok(NewtValue::Integer(result))
    }
}
