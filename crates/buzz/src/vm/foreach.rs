//! The `FOREACH` instruction.
//!
//! Layout: the key, value, and iterable occupy three consecutive frame
//! slots; the previous key (or, for enums, the previous case in the value
//! slot) is the iteration cursor. Each dispatch writes the next key/value
//! pair and pushes a continue flag; at exhaustion the key slot is set to
//! null and the flag is false.

use crate::{
    error::{VmError, VmResult},
    io::PrintWriter,
    value::{Obj, ObjEnumInstance, Value, ValueKey},
};

use super::Vm;

impl<W: PrintWriter> Vm<'_, W> {
    pub(super) fn op_foreach(&mut self, key_slot: usize, value_slot: usize) -> VmResult<()> {
        let base = self.frame().base;
        let key_idx = base + key_slot;
        let value_idx = base + value_slot;
        let iter_idx = value_idx + 1;
        let iterable = self.stack[iter_idx];
        let Some(id) = iterable.as_obj() else {
            return Err(VmError::internal("FOREACH on a non-iterable"));
        };

        enum Next {
            Pair(Value, Value),
            /// String iteration allocates the codepoint string after the
            /// heap borrow ends.
            Char(i32, char),
            /// Enum iteration allocates the next case instance.
            EnumCase(u16),
            Done,
        }
        let next = match self.heap.get(id) {
            Obj::List(list) => {
                let next = match self.stack[key_idx] {
                    Value::Null => 0usize,
                    Value::Integer(prev) => (prev + 1).cast_unsigned() as usize,
                    _ => return Err(VmError::internal("foreach list key is not an integer")),
                };
                match list.items.get(next) {
                    Some(&item) => Next::Pair(
                        Value::Integer(
                            i32::try_from(next)
                                .map_err(|_| VmError::internal("list index exceeds i32"))?,
                        ),
                        item,
                    ),
                    None => Next::Done,
                }
            }
            Obj::Map(map) => {
                let next = match self.stack[key_idx] {
                    Value::Null => 0usize,
                    prev => match map.entries.get_index_of(&ValueKey(prev)) {
                        Some(index) => index + 1,
                        None => return Err(VmError::internal("foreach map key vanished")),
                    },
                };
                match map.entries.get_index(next) {
                    Some((&key, &value)) => Next::Pair(key.0, value),
                    None => Next::Done,
                }
            }
            Obj::Str(s) => {
                let next = match self.stack[key_idx] {
                    Value::Null => 0i32,
                    Value::Integer(prev) => prev + 1,
                    _ => return Err(VmError::internal("foreach string key is not an integer")),
                };
                match s.chars().nth(next.cast_unsigned() as usize) {
                    Some(c) => Next::Char(next, c),
                    None => Next::Done,
                }
            }
            Obj::Range(range) => {
                let next = match self.stack[key_idx] {
                    Value::Null => 0i64,
                    Value::Integer(prev) => i64::from(prev) + 1,
                    _ => return Err(VmError::internal("foreach range key is not an integer")),
                };
                let span = (i64::from(range.high) - i64::from(range.low)).abs();
                if next < span {
                    let value = if range.high >= range.low {
                        i64::from(range.low) + next
                    } else {
                        i64::from(range.low) - next
                    };
                    Next::Pair(
                        Value::Integer(
                            i32::try_from(next)
                                .map_err(|_| VmError::internal("range index exceeds i32"))?,
                        ),
                        Value::Integer(
                            i32::try_from(value)
                                .map_err(|_| VmError::internal("range value exceeds i32"))?,
                        ),
                    )
                } else {
                    Next::Done
                }
            }
            // Iterating an enum type yields its case instances; the key
            // slot stays unused and the cursor is the previous case.
            Obj::Enum(en) => {
                let next = match self.stack[value_idx] {
                    Value::Null => 0u16,
                    Value::Obj(prev) => match self.heap.get(prev) {
                        Obj::EnumInstance(instance) => instance.case + 1,
                        _ => return Err(VmError::internal("foreach enum cursor is not a case")),
                    },
                    _ => return Err(VmError::internal("foreach enum cursor is not a case")),
                };
                if usize::from(next) < en.cases.len() {
                    Next::EnumCase(next)
                } else {
                    Next::Done
                }
            }
            _ => return Err(VmError::internal("FOREACH on a non-iterable")),
        };

        match next {
            Next::Pair(key, value) => {
                self.stack[key_idx] = key;
                self.stack[value_idx] = value;
                self.push(Value::Bool(true));
            }
            Next::Char(index, c) => {
                let mut buffer = [0u8; 4];
                let text = c.encode_utf8(&mut buffer);
                let string = self.heap.intern_string(text);
                self.stack[key_idx] = Value::Integer(index);
                self.stack[value_idx] = Value::Obj(string);
                self.push(Value::Bool(true));
            }
            Next::EnumCase(case) => {
                let instance = self
                    .heap
                    .alloc(Obj::EnumInstance(ObjEnumInstance { enum_: id, case }));
                self.stack[value_idx] = Value::Obj(instance);
                self.push(Value::Bool(true));
            }
            Next::Done => {
                self.stack[key_idx] = Value::Null;
                self.push(Value::Bool(false));
            }
        }
        Ok(())
    }
}
