//! Word emission and jump patching.

use crate::value::Value;

use super::{
    chunk::{ARG_MASK, Chunk, encode},
    op::Op,
};

/// Label for a forward jump that needs patching once its target is known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(usize);

/// Emits instruction words for one chunk.
///
/// Forward jumps emit a zero offset and are back-patched through
/// [`ChunkBuilder::patch_jump`]; backward jumps know their target at emit
/// time and use [`ChunkBuilder::emit_loop`].
#[derive(Debug, Default)]
pub(crate) struct ChunkBuilder {
    code: Vec<u32>,
    constants: Vec<Value>,
    lines: Vec<u32>,
    current_line: u32,
}

impl ChunkBuilder {
    /// Creates a builder with the mandatory empty string in constant slot 0.
    pub fn new(empty_string: Value) -> Self {
        Self {
            code: Vec::new(),
            constants: vec![empty_string],
            lines: Vec::new(),
            current_line: 0,
        }
    }

    /// Sets the source line recorded for subsequently emitted words.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Emits one instruction word.
    pub fn emit(&mut self, op: Op, arg: u32) {
        self.code.push(encode(op, arg));
        self.lines.push(self.current_line);
    }

    /// Emits a raw operand word consumed by the preceding instruction.
    pub fn emit_word(&mut self, word: u32) {
        self.code.push(word);
        self.lines.push(self.current_line);
    }

    /// Emits a forward jump with a placeholder offset.
    #[must_use]
    pub fn emit_jump(&mut self, op: Op) -> JumpLabel {
        let label = JumpLabel(self.code.len());
        self.emit(op, 0);
        label
    }

    /// Patches a forward jump to land at the current offset.
    ///
    /// The offset is relative to the instruction after the jump word.
    ///
    /// # Panics
    /// Panics when the jump distance exceeds the 24-bit operand; that means
    /// a single function body outgrew the instruction format.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let offset = self.code.len() - label.0 - 1;
        let offset = u32::try_from(offset).expect("jump offset fits in u32");
        assert!(offset <= ARG_MASK, "jump offset exceeds 24-bit range; function too large");
        self.code[label.0] |= offset;
    }

    /// Emits a backward jump to a known earlier offset.
    pub fn emit_loop(&mut self, target: usize) {
        let offset = self.code.len() + 1 - target;
        let offset = u32::try_from(offset).expect("loop offset fits in u32");
        assert!(offset <= ARG_MASK, "loop offset exceeds 24-bit range; function too large");
        self.emit(Op::Loop, offset);
    }

    /// Current instruction offset; loop heads record this before emitting.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Adds a constant, reusing an existing equal slot.
    ///
    /// # Panics
    /// Panics when the pool exceeds the 24-bit operand range.
    #[must_use]
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(existing) = self.constants.iter().position(|&c| c == value) {
            return u32::try_from(existing).expect("constant index fits in u32");
        }
        let index = u32::try_from(self.constants.len()).expect("constant index fits in u32");
        assert!(index <= ARG_MASK, "constant pool exceeds 24-bit range");
        self.constants.push(value);
        index
    }

    /// Emits `CONSTANT` for `value`, pooling it.
    pub fn emit_constant(&mut self, value: Value) {
        let index = self.add_constant(value);
        self.emit(Op::Constant, index);
    }

    #[must_use]
    pub fn build(self) -> Chunk {
        Chunk::new(self.code, self.constants, self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::arg_of;

    fn builder() -> ChunkBuilder {
        ChunkBuilder::new(Value::Null)
    }

    #[test]
    fn emits_op_and_arg_in_one_word() {
        let mut b = builder();
        b.emit(Op::GetLocal, 7);
        let chunk = b.build();
        assert_eq!(Op::decode(chunk.code()[0]), Op::GetLocal);
        assert_eq!(arg_of(chunk.code()[0]), 7);
    }

    #[test]
    fn forward_jump_patches_to_current_offset() {
        let mut b = builder();
        let jump = b.emit_jump(Op::JumpIfFalse);
        b.emit(Op::Null, 0);
        b.emit(Op::Pop, 0);
        b.patch_jump(jump);
        b.emit(Op::Void, 0);

        let chunk = b.build();
        // Skipping two words lands on the Void at offset 3.
        assert_eq!(arg_of(chunk.code()[0]), 2);
    }

    #[test]
    fn backward_jump_returns_to_loop_head() {
        let mut b = builder();
        b.emit(Op::Null, 0);
        let head = b.offset();
        b.emit(Op::Pop, 0);
        b.emit_loop(head);

        let chunk = b.build();
        // ip after fetching the Loop word is 3; subtracting 2 lands on
        // offset 1, the loop head.
        assert_eq!(Op::decode(chunk.code()[2]), Op::Loop);
        assert_eq!(arg_of(chunk.code()[2]), 2);
    }

    #[test]
    fn constants_deduplicate() {
        let mut b = builder();
        let a = b.add_constant(Value::Integer(42));
        let c = b.add_constant(Value::Integer(42));
        let d = b.add_constant(Value::Integer(7));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn line_table_parallels_code() {
        let mut b = builder();
        b.set_line(3);
        b.emit(Op::Null, 0);
        b.set_line(4);
        b.emit(Op::Pop, 0);
        let chunk = b.build();
        assert_eq!(chunk.line_at(0), 3);
        assert_eq!(chunk.line_at(1), 4);
    }
}
