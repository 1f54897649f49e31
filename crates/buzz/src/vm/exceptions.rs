//! Throw unwinding and catch-clause matching.
//!
//! A thrown value walks the frame stack from the top. Each frame carries the
//! catch closures attached to the call that opened it; the first clause
//! whose parameter type matches the thrown value's runtime type is invoked
//! with the value, and its result replaces the original call's result. An
//! unmatched throw aborts execution with a rendered stack trace.

use smallvec::SmallVec;

use crate::{
    error::{RuntimeError, RuntimeErrorKind, TraceFrame, VmError},
    heap::HeapId,
    io::PrintWriter,
    typedef::{TypeDesc, TypeId},
    value::{Obj, Value, stringify},
};

use super::{FrameAction, Vm};

impl<W: PrintWriter> Vm<'_, W> {
    /// Handles a `VmError` raised during dispatch: either transfers control
    /// to a catch clause and returns `Ok`, or produces the final error.
    pub(super) fn unwind(&mut self, err: VmError) -> Result<(), RuntimeError> {
        let thrown = match err {
            VmError::Throw(value) => value,
            VmError::Fatal(mut fatal) => {
                fatal.trace = self.capture_trace();
                return Err(fatal);
            }
        };
        let trace = self.capture_trace();
        while let Some(frame) = self.frames.last() {
            let catches: SmallVec<[HeapId; 2]> = frame.catches.clone();
            let base = frame.base;
            if let Some(handler) = self.matching_catch(&catches, thrown) {
                tracing::debug!(frames = self.frames.len(), "throw caught");
                self.frames.pop();
                self.close_upvalues(base);
                self.stack.truncate(base);
                self.push(Value::Obj(handler));
                self.push(thrown);
                return self
                    .call_closure(handler, 1, SmallVec::new(), FrameAction::None)
                    .map_err(|err| match err {
                        VmError::Fatal(mut fatal) => {
                            fatal.trace = trace.clone();
                            fatal
                        }
                        VmError::Throw(_) => {
                            RuntimeError::new(RuntimeErrorKind::Internal, "catch invocation threw")
                        }
                    });
            }
            self.frames.pop();
        }
        let rendered = stringify(thrown, self.heap, self.interns);
        let mut error = RuntimeError::new(
            RuntimeErrorKind::UnhandledThrow,
            format!("unhandled error: {rendered}"),
        );
        error.trace = trace;
        Err(error)
    }

    /// First catch clause whose parameter type matches the thrown value.
    pub(super) fn matching_catch(&self, catches: &[HeapId], thrown: Value) -> Option<HeapId> {
        for &handler in catches {
            let Obj::Closure(closure) = self.heap.get(handler) else {
                continue;
            };
            let Obj::Function(function) = self.heap.get(closure.function) else {
                continue;
            };
            let TypeDesc::Function(signature) = self.registry.desc(function.type_id) else {
                continue;
            };
            let Some(&(_, param_type)) = signature.params.first() else {
                continue;
            };
            if self.value_matches_type(thrown, param_type) {
                return Some(handler);
            }
        }
        None
    }

    /// Runtime type test used by `IS` and catch matching.
    pub(super) fn value_matches_type(&self, value: Value, ty: TypeId) -> bool {
        let resolved = self.registry.resolve(ty);
        let optional = self.registry.is_optional(resolved);
        let desc = self.registry.desc(resolved);
        match value {
            Value::Null => optional,
            Value::Bool(_) => matches!(desc, TypeDesc::Bool),
            Value::Integer(_) => matches!(desc, TypeDesc::Integer),
            Value::Float(_) => matches!(desc, TypeDesc::Float),
            Value::Obj(id) => match (self.heap.get(id), desc) {
                (Obj::Str(_), TypeDesc::Str) | (Obj::Range(_), TypeDesc::Range) => true,
                (Obj::List(list), TypeDesc::List { item }) => {
                    self.registry.equivalent(list.item_type, *item)
                }
                (Obj::Map(map), TypeDesc::Map { key, value }) => {
                    self.registry.equivalent(map.key_type, *key)
                        && self.registry.equivalent(map.value_type, *value)
                }
                (Obj::Instance(instance), TypeDesc::Instance { object }) => {
                    self.instance_has_type(instance.object, *object)
                }
                (Obj::EnumInstance(case), TypeDesc::EnumInstance { enum_ }) => {
                    let Obj::Enum(en) = self.heap.get(case.enum_) else {
                        return false;
                    };
                    self.registry.resolve(en.type_id) == self.registry.resolve(*enum_)
                }
                (Obj::Closure(closure), TypeDesc::Function(_)) => {
                    let Obj::Function(function) = self.heap.get(closure.function) else {
                        return false;
                    };
                    self.registry.equivalent(function.type_id, resolved)
                }
                _ => false,
            },
        }
    }

    /// Walks the runtime parent chain comparing object type ids.
    fn instance_has_type(&self, object: HeapId, wanted: TypeId) -> bool {
        let wanted = self.registry.resolve(wanted);
        let mut current = Some(object);
        while let Some(id) = current {
            let Obj::Object(obj) = self.heap.get(id) else {
                return false;
            };
            if self.registry.resolve(obj.type_id) == wanted {
                return true;
            }
            current = obj.parent;
        }
        false
    }

    /// Renders the live frame stack, innermost first, for diagnostics.
    pub(super) fn capture_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let Obj::Function(function) = self.heap.get(frame.function) else {
                    return TraceFrame {
                        function: "<unknown>".to_string(),
                        line: 0,
                    };
                };
                TraceFrame {
                    function: self.interns.get(function.name).to_string(),
                    line: function.chunk.line_at(frame.ip.saturating_sub(1)),
                }
            })
            .collect()
    }

    /// Wraps a startup error (before the dispatch loop owns unwinding).
    pub(super) fn into_runtime_error(&self, err: VmError) -> RuntimeError {
        match err {
            VmError::Fatal(mut fatal) => {
                fatal.trace = self.capture_trace();
                fatal
            }
            VmError::Throw(value) => {
                let rendered = stringify(value, self.heap, self.interns);
                let mut error = RuntimeError::new(
                    RuntimeErrorKind::UnhandledThrow,
                    format!("unhandled error: {rendered}"),
                );
                error.trace = self.capture_trace();
                error
            }
        }
    }
}
