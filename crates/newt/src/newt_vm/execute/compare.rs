//! Equality and ordering. Equality never errors and never calls back
//! into script code; ordering may run a `_cmp` handler and may fail.

use crate::newt_value::NewtValue;
use crate::newt_vm::opcode::{CMP_3WAY, CMP_GREATER, CMP_GREATER_EQ, CMP_LESS, CMP_LESS_EQ};
use crate::newt_vm::{MetaMethod, NewtError, NewtResult, VmContext};

/// The `==` operator. Numbers compare across the integer/float split
/// with IEEE semantics; everything else uses value identity.
pub(crate) fn vm_eq(a: &NewtValue, b: &NewtValue) -> bool {
    match (a, b) {
        (NewtValue::Float(x), NewtValue::Float(y)) => x == y,
        (NewtValue::Integer(x), NewtValue::Float(y)) => *x as f64 == *y,
        (NewtValue::Float(x), NewtValue::Integer(y)) => *x == *y as f64,
        _ => a == b,
    }
}

impl VmContext<'_> {
    /// Three-way ordering: negative, zero or positive. Like kinds order
    /// by their own rules, with object identity as the last resort;
    /// across kinds only numbers and null are ordered.
    pub(crate) fn compare(&mut self, lhs: &NewtValue, rhs: &NewtValue) -> NewtResult<i64> {
        if lhs.kind() == rhs.kind() {
            if lhs == rhs {
                return Ok(0);
            }
            return match (lhs, rhs) {
                (NewtValue::String(a), NewtValue::String(b)) => {
                    Ok(if a.as_str() < b.as_str() { -1 } else { 1 })
                }
                (NewtValue::Integer(a), NewtValue::Integer(b)) => Ok(if a < b { -1 } else { 1 }),
                (NewtValue::Float(a), NewtValue::Float(b)) => Ok(if a < b { -1 } else { 1 }),
                (NewtValue::Bool(a), NewtValue::Bool(b)) => Ok(if !a && *b { -1 } else { 1 }),
                (NewtValue::UserPointer(a), NewtValue::UserPointer(b)) => {
                    Ok(if a < b { -1 } else { 1 })
                }
                _ => {
                    if let Some(mm) = self.metamethod_of(lhs, MetaMethod::Cmp) {
                        let result = self.call_metamethod(&mm, lhs.clone(), &[rhs.clone()])?;
                        return match result {
                            NewtValue::Integer(i) => Ok(i),
                            _ => Err(self.raise("_cmp must return an integer")),
                        };
                    }
                    match (lhs.identity_addr(), rhs.identity_addr()) {
                        (Some(a), Some(b)) => Ok(if a < b { -1 } else { 1 }),
                        _ => Err(self.compare_error(lhs, rhs)),
                    }
                }
            };
        }
        match (lhs, rhs) {
            (NewtValue::Integer(a), NewtValue::Float(b)) => {
                let a = *a as f64;
                Ok(if a == *b {
                    0
                } else if a < *b {
                    -1
                } else {
                    1
                })
            }
            (NewtValue::Float(a), NewtValue::Integer(b)) => {
                let b = *b as f64;
                Ok(if *a == b {
                    0
                } else if *a < b {
                    -1
                } else {
                    1
                })
            }
            (NewtValue::Null, _) => Ok(-1),
            (_, NewtValue::Null) => Ok(1),
            _ => Err(self.compare_error(lhs, rhs)),
        }
    }

    fn compare_error(&mut self, lhs: &NewtValue, rhs: &NewtValue) -> NewtError {
        let msg = format!(
            "comparison between a {} and a {}",
            lhs.type_name(),
            rhs.type_name()
        );
        self.raise(&msg)
    }

    pub(crate) fn compare_op(
        &mut self,
        lhs: &NewtValue,
        rhs: &NewtValue,
        kind: u8,
    ) -> NewtResult<NewtValue> {
        let r = self.compare(lhs, rhs)?;
        Ok(match kind {
            CMP_GREATER => NewtValue::Bool(r > 0),
            CMP_GREATER_EQ => NewtValue::Bool(r >= 0),
            CMP_LESS => NewtValue::Bool(r < 0),
            CMP_LESS_EQ => NewtValue::Bool(r <= 0),
            CMP_3WAY => NewtValue::Integer(r),
            _ => return Err(self.raise("malformed comparison")),
        })
    }
}
