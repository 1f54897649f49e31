//! The native ABI and the core native functions.
//!
//! A native function receives a [`NativeCtx`], reads its arguments with
//! [`NativeCtx::peek`], pushes at most one return value with
//! [`NativeCtx::push`], and returns how many values it pushed (0 or 1).
//! Failure is surfaced by returning a thrown [`Value`]; the VM routes it
//! through the call site's catch clauses. Natives must not retain `Value`s
//! across calls: nothing roots them once the call returns.

use crate::{
    heap::Heap,
    intern::Interns,
    io::PrintWriter,
    value::{Obj, Value, stringify},
};

/// Signature of an externally implemented function.
pub type NativeFn = fn(&mut NativeCtx<'_>) -> Result<u8, Value>;

/// Call context handed to a native function.
pub struct NativeCtx<'a> {
    stack: &'a mut Vec<Value>,
    pub(crate) heap: &'a mut Heap,
    pub(crate) interns: &'a Interns,
    pub(crate) writer: &'a mut dyn PrintWriter,
    arity: usize,
    pushed: usize,
}

impl<'a> NativeCtx<'a> {
    pub(crate) fn new(
        stack: &'a mut Vec<Value>,
        heap: &'a mut Heap,
        interns: &'a Interns,
        writer: &'a mut dyn PrintWriter,
        arity: usize,
    ) -> Self {
        Self {
            stack,
            heap,
            interns,
            writer,
            arity,
            pushed: 0,
        }
    }

    /// Reads argument `index` (0 is the first argument).
    #[must_use]
    pub fn peek(&self, index: usize) -> Value {
        self.stack[self.stack.len() - self.pushed - self.arity + index]
    }

    /// Pushes a return value. At most one push per call.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
        self.pushed += 1;
    }

    /// Interns and returns a string value, for results and thrown errors.
    pub fn intern_string(&mut self, content: &str) -> Value {
        Value::Obj(self.heap.intern_string(content))
    }

    /// Reads a string argument's content, cloning it out of the heap.
    fn string_arg(&self, index: usize) -> Option<String> {
        match self.peek(index) {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A core native with its registration name.
pub(crate) struct NativeDef {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

/// The natives every runner installs. Parameter types and default fragments
/// are declared by the runner's prelude.
pub(crate) const CORE_NATIVES: &[NativeDef] = &[
    NativeDef {
        name: "print",
        arity: 1,
        function: native_print,
    },
    NativeDef {
        name: "assert",
        arity: 2,
        function: native_assert,
    },
    NativeDef {
        name: "toString",
        arity: 1,
        function: native_to_string,
    },
    NativeDef {
        name: "parseInt",
        arity: 1,
        function: native_parse_int,
    },
];

/// `print(str value) > void`
fn native_print(ctx: &mut NativeCtx<'_>) -> Result<u8, Value> {
    let text = ctx
        .string_arg(0)
        .unwrap_or_else(|| stringify(ctx.peek(0), ctx.heap, ctx.interns));
    ctx.writer.write_text(&text);
    ctx.writer.write_end();
    Ok(0)
}

/// `assert(bool condition, str message = "") > void`
fn native_assert(ctx: &mut NativeCtx<'_>) -> Result<u8, Value> {
    let condition = matches!(ctx.peek(0), Value::Bool(true));
    if condition {
        return Ok(0);
    }
    let message = ctx.string_arg(1).unwrap_or_default();
    let thrown = if message.is_empty() {
        ctx.intern_string("assertion failed")
    } else {
        ctx.intern_string(&format!("assertion failed: {message}"))
    };
    Err(thrown)
}

/// `toString(int value) > str`
fn native_to_string(ctx: &mut NativeCtx<'_>) -> Result<u8, Value> {
    let rendered = stringify(ctx.peek(0), ctx.heap, ctx.interns);
    let value = ctx.intern_string(&rendered);
    ctx.push(value);
    Ok(1)
}

/// `parseInt(str value) > int?` — null when the text is not an integer.
fn native_parse_int(ctx: &mut NativeCtx<'_>) -> Result<u8, Value> {
    let parsed = ctx
        .string_arg(0)
        .and_then(|text| text.trim().parse::<i32>().ok());
    match parsed {
        Some(value) => ctx.push(Value::Integer(value)),
        None => ctx.push(Value::Null),
    }
    Ok(1)
}
