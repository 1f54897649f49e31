//! Arithmetic, comparison, and bitwise dispatch.
//!
//! Integer arithmetic is overflow-checked and throws `OverflowError` /
//! `UnderflowError` values; float arithmetic follows IEEE-754. `ADD` is
//! polymorphic: numbers, string concatenation, element-wise list
//! concatenation, and right-biased map merge.

use crate::{
    bytecode::Op,
    error::{VmError, VmResult},
    io::PrintWriter,
    value::{Obj, ObjList, ObjMap, Value},
};

use super::Vm;

impl<W: PrintWriter> Vm<'_, W> {
    pub(super) fn binary_op(&mut self, op: Op) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        let result = match (a, b) {
            (Value::Integer(a), Value::Integer(b)) => self.integer_op(op, a, b)?,
            (Value::Float(a), Value::Float(b)) => float_op(op, a, b)?,
            (Value::Obj(a), Value::Obj(b)) if op == Op::Add => self.add_objects(a, b)?,
            _ => return Err(VmError::internal("binary operands have mismatched types")),
        };
        self.push(result);
        Ok(())
    }

    fn integer_op(&mut self, op: Op, a: i32, b: i32) -> VmResult<Value> {
        let value = match op {
            Op::Add => match a.checked_add(b) {
                Some(v) => v,
                None => return Err(self.throw_str("OverflowError: integer addition overflowed")),
            },
            Op::Subtract => match a.checked_sub(b) {
                Some(v) => v,
                None => {
                    return Err(self.throw_str("UnderflowError: integer subtraction underflowed"));
                }
            },
            Op::Multiply => match a.checked_mul(b) {
                Some(v) => v,
                None => {
                    return Err(self.throw_str("OverflowError: integer multiplication overflowed"));
                }
            },
            Op::Divide => {
                if b == 0 {
                    return Err(self.throw_str("division by zero"));
                }
                match a.checked_div(b) {
                    Some(v) => v,
                    None => {
                        return Err(self.throw_str("OverflowError: integer division overflowed"));
                    }
                }
            }
            Op::Mod => {
                if b == 0 {
                    return Err(self.throw_str("modulo by zero"));
                }
                a.wrapping_rem(b)
            }
            Op::BitAnd => a & b,
            Op::BitOr => a | b,
            Op::BitXor => a ^ b,
            Op::ShiftLeft => a.wrapping_shl(b.cast_unsigned()),
            Op::ShiftRight => a.wrapping_shr(b.cast_unsigned()),
            Op::Greater => return Ok(Value::Bool(a > b)),
            Op::Less => return Ok(Value::Bool(a < b)),
            _ => return Err(VmError::internal("unexpected integer operator")),
        };
        Ok(Value::Integer(value))
    }

    /// `ADD` on heap values: strings concatenate, lists concatenate into a
    /// fresh list, maps merge right-biased into a fresh map.
    fn add_objects(&mut self, a: crate::heap::HeapId, b: crate::heap::HeapId) -> VmResult<Value> {
        enum Plan {
            Str(String),
            List(ObjList),
            Map(ObjMap),
        }
        let plan = match (self.heap.get(a), self.heap.get(b)) {
            (Obj::Str(a), Obj::Str(b)) => Plan::Str(format!("{a}{b}")),
            (Obj::List(a), Obj::List(b)) => {
                let mut items = Vec::with_capacity(a.items.len() + b.items.len());
                items.extend_from_slice(&a.items);
                items.extend_from_slice(&b.items);
                Plan::List(ObjList {
                    item_type: a.item_type,
                    items,
                })
            }
            (Obj::Map(a), Obj::Map(b)) => {
                let mut entries = a.entries.clone();
                // Right side wins on duplicate keys.
                for (&key, &value) in &b.entries {
                    entries.insert(key, value);
                }
                Plan::Map(ObjMap {
                    key_type: a.key_type,
                    value_type: a.value_type,
                    entries,
                })
            }
            _ => return Err(VmError::internal("ADD on incompatible heap values")),
        };
        let id = match plan {
            Plan::Str(joined) => self.heap.intern_string(&joined),
            Plan::List(list) => self.heap.alloc(Obj::List(list)),
            Plan::Map(map) => self.heap.alloc(Obj::Map(map)),
        };
        Ok(Value::Obj(id))
    }

    pub(super) fn negate(&mut self) -> VmResult<()> {
        let value = self.pop();
        let negated = match value {
            Value::Integer(i) => match i.checked_neg() {
                Some(v) => Value::Integer(v),
                None => return Err(self.throw_str("OverflowError: integer negation overflowed")),
            },
            Value::Float(f) => Value::Float(-f),
            _ => return Err(VmError::internal("NEGATE on a non-number")),
        };
        self.push(negated);
        Ok(())
    }
}

fn float_op(op: Op, a: f64, b: f64) -> VmResult<Value> {
    let value = match op {
        Op::Add => a + b,
        Op::Subtract => a - b,
        Op::Multiply => a * b,
        Op::Divide => a / b,
        Op::Mod => a % b,
        Op::Greater => return Ok(Value::Bool(a > b)),
        Op::Less => return Ok(Value::Bool(a < b)),
        _ => return Err(VmError::internal("unexpected float operator")),
    };
    Ok(Value::Float(value))
}
