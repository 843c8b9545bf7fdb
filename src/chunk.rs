use std::fmt::{Display, Write};

use crate::error::InternalError;
use crate::value::Value;

/// A single instruction, in a parsed/type-safe format.
///
/// Chunks store code as bytes: one opcode byte followed by the instruction's operands. This type is what the compiler
/// emits and what the VM decodes each byte sequence back into before executing it, which keeps both sides from
/// hand-counting operand bytes. The one exception is `Closure`, which is followed by a variable number of upvalue
/// descriptor pairs the VM reads directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Load a constant by its index into the constant table.
    Constant(u8),
    /// Put Nil on the stack
    Nil,
    /// Put true on the stack
    True,
    /// Put false on the stack
    False,
    /// Discard the top value
    Pop,
    /// Push the local in this slot of the current frame
    GetLocal(u8),
    /// Store the top value into a local slot, leaving it on the stack
    SetLocal(u8),
    /// Push the global whose name is this constant
    GetGlobal(u8),
    /// Pop the top value into a new global whose name is this constant
    DefineGlobal(u8),
    /// Store the top value into an existing global, leaving it on the stack
    SetGlobal(u8),
    /// Push the value of one of the current closure's upvalues
    GetUpvalue(u8),
    /// Store the top value into an upvalue, leaving it on the stack
    SetUpvalue(u8),
    /// Replace the instance on top with its property named by this constant
    GetProperty(u8),
    /// If stack is TOP: value, instance, ..., set the field and leave just the value
    SetProperty(u8),
    /// If stack is TOP: superclass, receiver, ..., push the superclass method bound to the receiver
    GetSuper(u8),
    /// Pop two and push a bool for if they are equal or not
    Equal,
    /// If stack is TOP: b, a, ..., push the bool a>b
    Greater,
    /// If stack is TOP: b, a, ..., push the bool a<b
    Less,
    /// If stack is TOP: b, a ..., pop two and push (a+b), for numbers or strings
    Add,
    /// If stack is TOP: b, a ..., pop two and push (a-b)
    Subtract,
    /// If stack is TOP: b, a ..., pop two and push (a*b)
    Multiply,
    /// If stack is TOP: b, a ..., pop two and push (a/b)
    Divide,
    /// Logical negation of the top stack item
    Not,
    /// Negate the top value on the stack
    Negate,
    /// Pop and print the top value
    Print,
    /// Skip forward this many bytes
    Jump(u16),
    /// Skip forward if the top value is falsey. Doesn't pop.
    JumpIfFalse(u16),
    /// Jump backward this many bytes
    Loop(u16),
    /// Call the value below this many arguments
    Call(u8),
    /// Call the method named by the constant on the receiver below the arguments
    Invoke(u8, u8),
    /// Like Invoke, but looks the method up starting at the superclass on top of the stack
    SuperInvoke(u8, u8),
    /// Wrap the function constant in a closure. Followed by its upvalue descriptors.
    Closure(u8),
    /// Hoist the local on top of the stack into its upvalue, then pop it
    CloseUpvalue,
    /// Return from the current function with the top value
    Return,
    /// Push a new class named by this constant
    Class(u8),
    /// If stack is TOP: subclass, superclass, ..., link them and pop the subclass
    Inherit,
    /// If stack is TOP: closure, class, ..., add the method and pop the closure
    Method(u8),
}

impl Instruction {
    const OP_CODE_CONSTANT: u8 = 0;
    const OP_CODE_NIL: u8 = 1;
    const OP_CODE_TRUE: u8 = 2;
    const OP_CODE_FALSE: u8 = 3;
    const OP_CODE_POP: u8 = 4;
    const OP_CODE_GET_LOCAL: u8 = 5;
    const OP_CODE_SET_LOCAL: u8 = 6;
    const OP_CODE_GET_GLOBAL: u8 = 7;
    const OP_CODE_DEFINE_GLOBAL: u8 = 8;
    const OP_CODE_SET_GLOBAL: u8 = 9;
    const OP_CODE_GET_UPVALUE: u8 = 10;
    const OP_CODE_SET_UPVALUE: u8 = 11;
    const OP_CODE_GET_PROPERTY: u8 = 12;
    const OP_CODE_SET_PROPERTY: u8 = 13;
    const OP_CODE_GET_SUPER: u8 = 14;
    const OP_CODE_EQUAL: u8 = 15;
    const OP_CODE_GREATER: u8 = 16;
    const OP_CODE_LESS: u8 = 17;
    const OP_CODE_ADD: u8 = 18;
    const OP_CODE_SUBTRACT: u8 = 19;
    const OP_CODE_MULTIPLY: u8 = 20;
    const OP_CODE_DIVIDE: u8 = 21;
    const OP_CODE_NOT: u8 = 22;
    const OP_CODE_NEGATE: u8 = 23;
    const OP_CODE_PRINT: u8 = 24;
    const OP_CODE_JUMP: u8 = 25;
    const OP_CODE_JUMP_IF_FALSE: u8 = 26;
    const OP_CODE_LOOP: u8 = 27;
    const OP_CODE_CALL: u8 = 28;
    const OP_CODE_INVOKE: u8 = 29;
    const OP_CODE_SUPER_INVOKE: u8 = 30;
    const OP_CODE_CLOSURE: u8 = 31;
    const OP_CODE_CLOSE_UPVALUE: u8 = 32;
    const OP_CODE_RETURN: u8 = 33;
    const OP_CODE_CLASS: u8 = 34;
    const OP_CODE_INHERIT: u8 = 35;
    const OP_CODE_METHOD: u8 = 36;

    /// Try to parse an instruction from the beginning of some bytes, returning the number of bytes that the instruction consists of
    /// on success in addition.
    pub fn from_bytes(bytes: &[u8]) -> Option<(Instruction, usize)> {
        let op = *bytes.first()?;
        let byte = |i: usize| bytes.get(i).copied();
        let short = |i: usize| Some(u16::from_be_bytes([byte(i)?, byte(i + 1)?]));
        let instruction = match op {
            Instruction::OP_CODE_CONSTANT => Instruction::Constant(byte(1)?),
            Instruction::OP_CODE_NIL => Instruction::Nil,
            Instruction::OP_CODE_TRUE => Instruction::True,
            Instruction::OP_CODE_FALSE => Instruction::False,
            Instruction::OP_CODE_POP => Instruction::Pop,
            Instruction::OP_CODE_GET_LOCAL => Instruction::GetLocal(byte(1)?),
            Instruction::OP_CODE_SET_LOCAL => Instruction::SetLocal(byte(1)?),
            Instruction::OP_CODE_GET_GLOBAL => Instruction::GetGlobal(byte(1)?),
            Instruction::OP_CODE_DEFINE_GLOBAL => Instruction::DefineGlobal(byte(1)?),
            Instruction::OP_CODE_SET_GLOBAL => Instruction::SetGlobal(byte(1)?),
            Instruction::OP_CODE_GET_UPVALUE => Instruction::GetUpvalue(byte(1)?),
            Instruction::OP_CODE_SET_UPVALUE => Instruction::SetUpvalue(byte(1)?),
            Instruction::OP_CODE_GET_PROPERTY => Instruction::GetProperty(byte(1)?),
            Instruction::OP_CODE_SET_PROPERTY => Instruction::SetProperty(byte(1)?),
            Instruction::OP_CODE_GET_SUPER => Instruction::GetSuper(byte(1)?),
            Instruction::OP_CODE_EQUAL => Instruction::Equal,
            Instruction::OP_CODE_GREATER => Instruction::Greater,
            Instruction::OP_CODE_LESS => Instruction::Less,
            Instruction::OP_CODE_ADD => Instruction::Add,
            Instruction::OP_CODE_SUBTRACT => Instruction::Subtract,
            Instruction::OP_CODE_MULTIPLY => Instruction::Multiply,
            Instruction::OP_CODE_DIVIDE => Instruction::Divide,
            Instruction::OP_CODE_NOT => Instruction::Not,
            Instruction::OP_CODE_NEGATE => Instruction::Negate,
            Instruction::OP_CODE_PRINT => Instruction::Print,
            Instruction::OP_CODE_JUMP => Instruction::Jump(short(1)?),
            Instruction::OP_CODE_JUMP_IF_FALSE => Instruction::JumpIfFalse(short(1)?),
            Instruction::OP_CODE_LOOP => Instruction::Loop(short(1)?),
            Instruction::OP_CODE_CALL => Instruction::Call(byte(1)?),
            Instruction::OP_CODE_INVOKE => Instruction::Invoke(byte(1)?, byte(2)?),
            Instruction::OP_CODE_SUPER_INVOKE => Instruction::SuperInvoke(byte(1)?, byte(2)?),
            Instruction::OP_CODE_CLOSURE => Instruction::Closure(byte(1)?),
            Instruction::OP_CODE_CLOSE_UPVALUE => Instruction::CloseUpvalue,
            Instruction::OP_CODE_RETURN => Instruction::Return,
            Instruction::OP_CODE_CLASS => Instruction::Class(byte(1)?),
            Instruction::OP_CODE_INHERIT => Instruction::Inherit,
            Instruction::OP_CODE_METHOD => Instruction::Method(byte(1)?),
            _ => return None,
        };
        Some((instruction, instruction.num_bytes()))
    }

    /// Append the byte representation of this instruction, returning how many bytes were written.
    pub fn write_to(&self, out: &mut Vec<u8>) -> usize {
        let before = out.len();
        match *self {
            Self::Constant(u) => out.extend([Instruction::OP_CODE_CONSTANT, u]),
            Self::Nil => out.push(Instruction::OP_CODE_NIL),
            Self::True => out.push(Instruction::OP_CODE_TRUE),
            Self::False => out.push(Instruction::OP_CODE_FALSE),
            Self::Pop => out.push(Instruction::OP_CODE_POP),
            Self::GetLocal(u) => out.extend([Instruction::OP_CODE_GET_LOCAL, u]),
            Self::SetLocal(u) => out.extend([Instruction::OP_CODE_SET_LOCAL, u]),
            Self::GetGlobal(u) => out.extend([Instruction::OP_CODE_GET_GLOBAL, u]),
            Self::DefineGlobal(u) => out.extend([Instruction::OP_CODE_DEFINE_GLOBAL, u]),
            Self::SetGlobal(u) => out.extend([Instruction::OP_CODE_SET_GLOBAL, u]),
            Self::GetUpvalue(u) => out.extend([Instruction::OP_CODE_GET_UPVALUE, u]),
            Self::SetUpvalue(u) => out.extend([Instruction::OP_CODE_SET_UPVALUE, u]),
            Self::GetProperty(u) => out.extend([Instruction::OP_CODE_GET_PROPERTY, u]),
            Self::SetProperty(u) => out.extend([Instruction::OP_CODE_SET_PROPERTY, u]),
            Self::GetSuper(u) => out.extend([Instruction::OP_CODE_GET_SUPER, u]),
            Self::Equal => out.push(Instruction::OP_CODE_EQUAL),
            Self::Greater => out.push(Instruction::OP_CODE_GREATER),
            Self::Less => out.push(Instruction::OP_CODE_LESS),
            Self::Add => out.push(Instruction::OP_CODE_ADD),
            Self::Subtract => out.push(Instruction::OP_CODE_SUBTRACT),
            Self::Multiply => out.push(Instruction::OP_CODE_MULTIPLY),
            Self::Divide => out.push(Instruction::OP_CODE_DIVIDE),
            Self::Not => out.push(Instruction::OP_CODE_NOT),
            Self::Negate => out.push(Instruction::OP_CODE_NEGATE),
            Self::Print => out.push(Instruction::OP_CODE_PRINT),
            Self::Jump(s) => write_with_short(out, Instruction::OP_CODE_JUMP, s),
            Self::JumpIfFalse(s) => write_with_short(out, Instruction::OP_CODE_JUMP_IF_FALSE, s),
            Self::Loop(s) => write_with_short(out, Instruction::OP_CODE_LOOP, s),
            Self::Call(u) => out.extend([Instruction::OP_CODE_CALL, u]),
            Self::Invoke(name, args) => out.extend([Instruction::OP_CODE_INVOKE, name, args]),
            Self::SuperInvoke(name, args) => {
                out.extend([Instruction::OP_CODE_SUPER_INVOKE, name, args])
            }
            Self::Closure(u) => out.extend([Instruction::OP_CODE_CLOSURE, u]),
            Self::CloseUpvalue => out.push(Instruction::OP_CODE_CLOSE_UPVALUE),
            Self::Return => out.push(Instruction::OP_CODE_RETURN),
            Self::Class(u) => out.extend([Instruction::OP_CODE_CLASS, u]),
            Self::Inherit => out.push(Instruction::OP_CODE_INHERIT),
            Self::Method(u) => out.extend([Instruction::OP_CODE_METHOD, u]),
        }
        out.len() - before
    }

    /// Number of bytes in the byte represention of this instruction
    pub fn num_bytes(&self) -> usize {
        match self {
            Instruction::Jump(_)
            | Instruction::JumpIfFalse(_)
            | Instruction::Loop(_)
            | Instruction::Invoke(_, _)
            | Instruction::SuperInvoke(_, _) => 3,
            Instruction::Constant(_)
            | Instruction::GetLocal(_)
            | Instruction::SetLocal(_)
            | Instruction::GetGlobal(_)
            | Instruction::DefineGlobal(_)
            | Instruction::SetGlobal(_)
            | Instruction::GetUpvalue(_)
            | Instruction::SetUpvalue(_)
            | Instruction::GetProperty(_)
            | Instruction::SetProperty(_)
            | Instruction::GetSuper(_)
            | Instruction::Call(_)
            | Instruction::Closure(_)
            | Instruction::Class(_)
            | Instruction::Method(_) => 2,
            _ => 1,
        }
    }
}

fn write_with_short(out: &mut Vec<u8>, op: u8, operand: u16) {
    out.push(op);
    out.extend(operand.to_be_bytes());
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Constant(u) => write!(f, "OP_CONSTANT {:4}", u),
            Instruction::Nil => write!(f, "OP_NIL"),
            Instruction::True => write!(f, "OP_TRUE"),
            Instruction::False => write!(f, "OP_FALSE"),
            Instruction::Pop => write!(f, "OP_POP"),
            Instruction::GetLocal(u) => write!(f, "OP_GET_LOCAL {:4}", u),
            Instruction::SetLocal(u) => write!(f, "OP_SET_LOCAL {:4}", u),
            Instruction::GetGlobal(u) => write!(f, "OP_GET_GLOBAL {:4}", u),
            Instruction::DefineGlobal(u) => write!(f, "OP_DEFINE_GLOBAL {:4}", u),
            Instruction::SetGlobal(u) => write!(f, "OP_SET_GLOBAL {:4}", u),
            Instruction::GetUpvalue(u) => write!(f, "OP_GET_UPVALUE {:4}", u),
            Instruction::SetUpvalue(u) => write!(f, "OP_SET_UPVALUE {:4}", u),
            Instruction::GetProperty(u) => write!(f, "OP_GET_PROPERTY {:4}", u),
            Instruction::SetProperty(u) => write!(f, "OP_SET_PROPERTY {:4}", u),
            Instruction::GetSuper(u) => write!(f, "OP_GET_SUPER {:4}", u),
            Instruction::Equal => write!(f, "OP_EQUAL"),
            Instruction::Greater => write!(f, "OP_GREATER"),
            Instruction::Less => write!(f, "OP_LESS"),
            Instruction::Add => write!(f, "OP_ADD"),
            Instruction::Subtract => write!(f, "OP_SUBTRACT"),
            Instruction::Multiply => write!(f, "OP_MULTIPLY"),
            Instruction::Divide => write!(f, "OP_DIVIDE"),
            Instruction::Not => write!(f, "OP_NOT"),
            Instruction::Negate => write!(f, "OP_NEGATE"),
            Instruction::Print => write!(f, "OP_PRINT"),
            Instruction::Jump(s) => write!(f, "OP_JUMP {:4}", s),
            Instruction::JumpIfFalse(s) => write!(f, "OP_JUMP_IF_FALSE {:4}", s),
            Instruction::Loop(s) => write!(f, "OP_LOOP {:4}", s),
            Instruction::Call(u) => write!(f, "OP_CALL {:4}", u),
            Instruction::Invoke(name, args) => write!(f, "OP_INVOKE ({} args) {:4}", args, name),
            Instruction::SuperInvoke(name, args) => {
                write!(f, "OP_SUPER_INVOKE ({} args) {:4}", args, name)
            }
            Instruction::Closure(u) => write!(f, "OP_CLOSURE {:4}", u),
            Instruction::CloseUpvalue => write!(f, "OP_CLOSE_UPVALUE"),
            Instruction::Return => write!(f, "OP_RETURN"),
            Instruction::Class(u) => write!(f, "OP_CLASS {:4}", u),
            Instruction::Inherit => write!(f, "OP_INHERIT"),
            Instruction::Method(u) => write!(f, "OP_METHOD {:4}", u),
        }
    }
}

/// A chunk is the unit of execution for the VM: one function's bytecode, its constants, and the source line of every
/// byte of code.
#[derive(Debug, Default)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<usize>,
}

impl Chunk {
    /// A new chunk is empty.
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Add an instruction to the chunk's code, returning the offset it starts at.
    pub fn write_instruction(&mut self, instruction: Instruction, line: usize) -> usize {
        let offset = self.code.len();
        let written = instruction.write_to(&mut self.code);
        self.lines.extend(std::iter::repeat(line).take(written));
        offset
    }

    /// Add a raw operand byte, e.g. the upvalue descriptors after a Closure.
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Overwrite the big-endian u16 operand at `offset`. Used to back-patch jumps.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Add a constant to the chunk's constants table, returning its index.
    /// A constant that's already in the table is reused rather than added twice.
    pub fn add_constant(&mut self, constant: Value) -> Result<u8, InternalError> {
        if let Some(existing) = self
            .constants
            .iter()
            .position(|c| c.is_same_constant(&constant))
        {
            // positions only ever come from indices that fit
            return u8::try_from(existing).map_err(|_| InternalError::TooManyConstants);
        }
        let idx =
            u8::try_from(self.constants.len()).map_err(|_| InternalError::TooManyConstants)?;
        self.constants.push(constant);
        Ok(idx)
    }

    /// Length of the code in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether no code has been written yet.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Decode the instruction starting at `offset`.
    pub fn instruction_at(&self, offset: usize) -> Option<(Instruction, usize)> {
        Instruction::from_bytes(self.code.get(offset..)?)
    }

    /// The raw byte at `offset`.
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// The constant at `idx`.
    pub fn constant(&self, idx: u8) -> Option<&Value> {
        self.constants.get(usize::from(idx))
    }

    /// All constants, in index order.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Source line of the byte at `offset`.
    pub fn line(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub(crate) fn size_hint(&self) -> usize {
        self.code.capacity()
            + self.lines.capacity() * std::mem::size_of::<usize>()
            + self.constants.capacity() * std::mem::size_of::<Value>()
    }

    /// Render the instruction at `offset` and return the offset of the next one.
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let mut ret = format!("{:04} ", offset);
        if offset > 0 && self.line(offset) == self.line(offset - 1) {
            ret.push_str("   | ");
        } else {
            write!(&mut ret, "{:4} ", self.line(offset)).expect("writing to string");
        }
        let (instruction, width) = match self.instruction_at(offset) {
            Some(decoded) => decoded,
            None => {
                write!(&mut ret, "unknown opcode {:?}", self.byte(offset)).expect("writing to string");
                return (ret, offset + 1);
            }
        };
        write!(&mut ret, "{}", instruction).expect("writing to string");
        let mut next = offset + width;
        match instruction {
            Instruction::Constant(u)
            | Instruction::GetGlobal(u)
            | Instruction::DefineGlobal(u)
            | Instruction::SetGlobal(u)
            | Instruction::GetProperty(u)
            | Instruction::SetProperty(u)
            | Instruction::GetSuper(u)
            | Instruction::Class(u)
            | Instruction::Method(u)
            | Instruction::Invoke(u, _)
            | Instruction::SuperInvoke(u, _) => {
                self.write_constant(&mut ret, u);
            }
            Instruction::Jump(s) | Instruction::JumpIfFalse(s) => {
                write!(&mut ret, " -> {}", next + usize::from(s)).expect("writing to string");
            }
            Instruction::Loop(s) => {
                write!(&mut ret, " -> {}", next.saturating_sub(usize::from(s)))
                    .expect("writing to string");
            }
            Instruction::Closure(u) => {
                self.write_constant(&mut ret, u);
                let upvalue_count = self
                    .constant(u)
                    .and_then(Value::as_object)
                    .and_then(|f| f.with(|o| o.as_function().map(|f| f.upvalue_count)))
                    .unwrap_or(0);
                for _ in 0..upvalue_count {
                    let is_local = self.byte(next).unwrap_or(0);
                    let index = self.byte(next + 1).unwrap_or(0);
                    write!(
                        &mut ret,
                        "\n{:04}    |                     {} {}",
                        next,
                        if is_local == 1 { "local" } else { "upvalue" },
                        index
                    )
                    .expect("writing to string");
                    next += 2;
                }
            }
            _ => {}
        }
        (ret, next)
    }

    fn write_constant(&self, out: &mut String, idx: u8) {
        match self.constant(idx) {
            Some(value) => write!(out, " '{}'", value),
            None => write!(out, " <bad constant>"),
        }
        .expect("writing to string");
    }

    /// Return a human-readable string for a chunk.
    pub fn disassemble(&self, title: &str) -> String {
        let mut ret = format!("== {} ==\n", title);
        let mut offset = 0;
        while offset < self.code.len() {
            let (line, next) = self.disassemble_instruction(offset);
            ret.push_str(&line);
            ret.push('\n');
            offset = next;
        }
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn instructions_decode_to_what_was_written() {
        let instructions = [
            Instruction::Constant(7),
            Instruction::Return,
            Instruction::Jump(0x1234),
            Instruction::Invoke(3, 2),
            Instruction::Loop(9),
            Instruction::Method(255),
        ];
        let mut bytes = vec![];
        for i in &instructions {
            assert_eq!(i.write_to(&mut bytes), i.num_bytes());
        }
        let mut offset = 0;
        let mut decoded = vec![];
        while let Some((i, width)) = Instruction::from_bytes(&bytes[offset..]) {
            decoded.push(i);
            offset += width;
        }
        assert_eq!(decoded, instructions);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn jumps_are_big_endian() {
        let mut bytes = vec![];
        Instruction::JumpIfFalse(0x0102).write_to(&mut bytes);
        assert_eq!(bytes, vec![26, 1, 2]);
    }

    #[test]
    fn truncated_and_unknown_bytes_dont_decode() {
        assert_eq!(Instruction::from_bytes(&[]), None);
        assert_eq!(Instruction::from_bytes(&[0]), None);
        assert_eq!(Instruction::from_bytes(&[25, 1]), None);
        assert_eq!(Instruction::from_bytes(&[200]), None);
    }

    #[test]
    fn constants_are_deduplicated_and_limited() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Number(1.0)).unwrap(), 0);
        assert_eq!(chunk.add_constant(Value::Number(2.0)).unwrap(), 1);
        assert_eq!(chunk.add_constant(Value::Number(1.0)).unwrap(), 0);
        // 1.0 and 2.0 are in; 3.0..=256.0 fill the pool to exactly 256 entries
        for i in 3..=256 {
            chunk.add_constant(Value::Number(i as f64)).unwrap();
        }
        assert_eq!(chunk.constants.len(), 256);
        assert!(matches!(
            chunk.add_constant(Value::Number(257.0)),
            Err(InternalError::TooManyConstants)
        ));
        assert_eq!(chunk.constants.len(), 256);
        // existing ones are still found
        assert_eq!(chunk.add_constant(Value::Number(256.0)).unwrap(), 255);
        assert_eq!(chunk.add_constant(Value::Number(2.0)).unwrap(), 1);
    }

    #[test]
    fn patching_and_disassembly() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.5)).unwrap();
        chunk.write_instruction(Instruction::Constant(idx), 1);
        let jump = chunk.write_instruction(Instruction::JumpIfFalse(0xffff), 1);
        chunk.write_instruction(Instruction::Pop, 2);
        chunk.patch_u16(jump + 1, 1);
        chunk.write_instruction(Instruction::Return, 2);

        assert_eq!(
            chunk.instruction_at(jump),
            Some((Instruction::JumpIfFalse(1), 3))
        );
        let expected = "== test ==\n\
                        0000    1 OP_CONSTANT    0 '1.5'\n\
                        0002    | OP_JUMP_IF_FALSE    1 -> 6\n\
                        0005    2 OP_POP\n\
                        0006    | OP_RETURN\n";
        assert_eq!(chunk.disassemble("test"), expected);
    }
}
