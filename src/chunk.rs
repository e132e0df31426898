use super::object::Heap;
use super::value::Value;
use std::convert::TryFrom;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Constant,
    ConstantLong,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpValue,
    SetUpValue,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Closure,
    CloseUpValue,
    Return,
}

impl From<Instruction> for u8 {
    fn from(instr: Instruction) -> u8 {
        match instr {
            Instruction::Constant => 0,
            Instruction::ConstantLong => 1,
            Instruction::Nil => 2,
            Instruction::True => 3,
            Instruction::False => 4,
            Instruction::Pop => 5,
            Instruction::GetLocal => 6,
            Instruction::SetLocal => 7,
            Instruction::GetGlobal => 8,
            Instruction::DefineGlobal => 9,
            Instruction::SetGlobal => 10,
            Instruction::GetUpValue => 11,
            Instruction::SetUpValue => 12,
            Instruction::Equal => 13,
            Instruction::Greater => 14,
            Instruction::Less => 15,
            Instruction::Add => 16,
            Instruction::Subtract => 17,
            Instruction::Multiply => 18,
            Instruction::Divide => 19,
            Instruction::Not => 20,
            Instruction::Negate => 21,
            Instruction::Print => 22,
            Instruction::Jump => 23,
            Instruction::JumpIfFalse => 24,
            Instruction::Loop => 25,
            Instruction::Call => 26,
            Instruction::Closure => 27,
            Instruction::CloseUpValue => 28,
            Instruction::Return => 29,
        }
    }
}

impl TryFrom<u8> for Instruction {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Constant),
            1 => Ok(Self::ConstantLong),
            2 => Ok(Self::Nil),
            3 => Ok(Self::True),
            4 => Ok(Self::False),
            5 => Ok(Self::Pop),
            6 => Ok(Self::GetLocal),
            7 => Ok(Self::SetLocal),
            8 => Ok(Self::GetGlobal),
            9 => Ok(Self::DefineGlobal),
            10 => Ok(Self::SetGlobal),
            11 => Ok(Self::GetUpValue),
            12 => Ok(Self::SetUpValue),
            13 => Ok(Self::Equal),
            14 => Ok(Self::Greater),
            15 => Ok(Self::Less),
            16 => Ok(Self::Add),
            17 => Ok(Self::Subtract),
            18 => Ok(Self::Multiply),
            19 => Ok(Self::Divide),
            20 => Ok(Self::Not),
            21 => Ok(Self::Negate),
            22 => Ok(Self::Print),
            23 => Ok(Self::Jump),
            24 => Ok(Self::JumpIfFalse),
            25 => Ok(Self::Loop),
            26 => Ok(Self::Call),
            27 => Ok(Self::Closure),
            28 => Ok(Self::CloseUpValue),
            29 => Ok(Self::Return),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Constant => "CONSTANT",
                Self::ConstantLong => "CONSTANT_LONG",
                Self::Nil => "NIL",
                Self::True => "TRUE",
                Self::False => "FALSE",
                Self::Pop => "POP",
                Self::GetLocal => "GET_LOCAL",
                Self::SetLocal => "SET_LOCAL",
                Self::GetGlobal => "GET_GLOBAL",
                Self::DefineGlobal => "DEFINE_GLOBAL",
                Self::SetGlobal => "SET_GLOBAL",
                Self::GetUpValue => "GET_UPVALUE",
                Self::SetUpValue => "SET_UPVALUE",
                Self::Equal => "EQUAL",
                Self::Greater => "GREATER",
                Self::Less => "LESS",
                Self::Add => "ADD",
                Self::Subtract => "SUBTRACT",
                Self::Multiply => "MULTIPLY",
                Self::Divide => "DIVIDE",
                Self::Not => "NOT",
                Self::Negate => "NEGATE",
                Self::Print => "PRINT",
                Self::Jump => "JUMP",
                Self::JumpIfFalse => "JUMP_IF_FALSE",
                Self::Loop => "LOOP",
                Self::Call => "CALL",
                Self::Closure => "CLOSURE",
                Self::CloseUpValue => "CLOSE_UPVALUE",
                Self::Return => "RETURN",
            }
        )
    }
}

/// Bytecode buffer plus its metadata: a per-byte source line array (always
/// the same length as `code`) and the constant pool.
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn byte_at(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        (self.code[offset] as u16) << 8 | self.code[offset + 1] as u16
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines[offset]
    }

    pub fn constant_at(&self, index: usize) -> Value {
        self.constants[index]
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_instr(&mut self, instr: Instruction, line: u32) {
        self.write(instr.into(), line);
    }

    fn write_u16(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line);
        self.write(value as u8, line);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Emits a constant load, switching to the long form once the pool
    /// outgrows one-byte indices. Errs when even 16 bits cannot address it.
    pub fn emit_const(&mut self, value: Value, line: u32) -> Result<usize, ()> {
        let index = self.add_constant(value);

        if index <= 0xff {
            self.write_instr(Instruction::Constant, line);
            self.write(index as u8, line);
        } else if index <= 0xffff {
            self.write_instr(Instruction::ConstantLong, line);
            self.write_u16(index as u16, line);
        } else {
            return Err(());
        }

        Ok(index)
    }

    /// Emits a forward jump with a placeholder offset; returns the
    /// instruction's index for `patch_jump`.
    pub fn emit_jump(&mut self, instr: Instruction, line: u32) -> usize {
        let index = self.code.len();
        self.write_instr(instr, line);
        self.write_u16(0xffff, line);
        index
    }

    /// Points the jump at `index` to the current end of code. Errs when the
    /// distance overflows the 16-bit operand.
    pub fn patch_jump(&mut self, index: usize) -> Result<(), ()> {
        // The jump lands relative to the byte after its operand.
        let jump = self.code.len() - index - 3;
        if jump > u16::MAX as usize {
            return Err(());
        }
        self.code[index + 1] = (jump >> 8) as u8;
        self.code[index + 2] = jump as u8;
        Ok(())
    }

    /// Emits a backward jump to `loop_start`.
    pub fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<(), ()> {
        self.write_instr(Instruction::Loop, line);
        let offset = self.code.len() + 2 - loop_start;
        if offset > u16::MAX as usize {
            return Err(());
        }
        self.write_u16(offset as u16, line);
        Ok(())
    }

    pub fn disassemble(&self, heap: &Heap, name: &str) -> String {
        let mut buffer = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.len() {
            let (text, size) = self.disassemble_instr_at(heap, offset);
            buffer += &text;
            offset += size;
        }
        buffer
    }

    /// Decodes the instruction at `offset`; returns its rendering and its
    /// full width in bytes.
    pub fn disassemble_instr_at(&self, heap: &Heap, offset: usize) -> (String, usize) {
        let mut buffer = format!("{:04} ", offset);
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            buffer += "   | ";
        } else {
            buffer += &format!("{:4} ", self.lines[offset]);
        }

        let instr = match Instruction::try_from(self.code[offset]) {
            Ok(instr) => instr,
            Err(_) => {
                buffer += &format!("Unknown opcode {}\n", self.code[offset]);
                return (buffer, 1);
            }
        };

        match instr {
            Instruction::Constant | Instruction::GetGlobal | Instruction::DefineGlobal | Instruction::SetGlobal => {
                let index = self.code[offset + 1] as usize;
                buffer += &format!(
                    "{:<16} {:>4} '{}'\n",
                    instr.to_string(),
                    index,
                    self.constants[index].display(heap)
                );
                (buffer, 2)
            }
            Instruction::ConstantLong => {
                let index = self.u16_at(offset + 1) as usize;
                buffer += &format!(
                    "{:<16} {:>4} '{}'\n",
                    instr.to_string(),
                    index,
                    self.constants[index].display(heap)
                );
                (buffer, 3)
            }
            Instruction::GetLocal
            | Instruction::SetLocal
            | Instruction::GetUpValue
            | Instruction::SetUpValue
            | Instruction::Call => {
                let slot = self.code[offset + 1];
                buffer += &format!("{:<16} {:>4}\n", instr.to_string(), slot);
                (buffer, 2)
            }
            Instruction::Jump | Instruction::JumpIfFalse => {
                let jump = self.u16_at(offset + 1) as usize;
                buffer += &format!(
                    "{:<16} {:>4} -> {}\n",
                    instr.to_string(),
                    offset,
                    offset + 3 + jump
                );
                (buffer, 3)
            }
            Instruction::Loop => {
                let jump = self.u16_at(offset + 1) as usize;
                buffer += &format!(
                    "{:<16} {:>4} -> {}\n",
                    instr.to_string(),
                    offset,
                    offset + 3 - jump
                );
                (buffer, 3)
            }
            Instruction::Closure => {
                let index = self.code[offset + 1] as usize;
                let function = self.constants[index];
                buffer += &format!(
                    "{:<16} {:>4} {}\n",
                    instr.to_string(),
                    index,
                    function.display(heap)
                );

                let count = heap.function(function.as_obj()).up_values_count;
                for i in 0..count {
                    let pair = offset + 2 + i * 2;
                    buffer += &format!(
                        "{:04}      |                     {} {}\n",
                        pair,
                        if self.code[pair] != 0 { "local" } else { "upvalue" },
                        self.code[pair + 1]
                    );
                }
                (buffer, 2 + count * 2)
            }
            _ => {
                buffer += &format!("{}\n", instr);
                (buffer, 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Function, Obj};
    use pretty_assertions::assert_eq;

    #[test]
    fn code_and_lines_stay_in_lockstep() {
        let mut chunk = Chunk::new();
        chunk.write_instr(Instruction::Nil, 1);
        chunk.emit_const(Value::Number(3.0), 2).unwrap();
        chunk.write_instr(Instruction::Return, 3);
        assert_eq!(chunk.code.len(), chunk.lines.len());
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(1), 2);
        assert_eq!(chunk.line_at(2), 2);
        assert_eq!(chunk.line_at(3), 3);
    }

    #[test]
    fn constants_switch_to_the_long_form() {
        let mut chunk = Chunk::new();
        for i in 0..=0x100 {
            chunk.emit_const(Value::Number(i as f64), 1).unwrap();
        }

        // The first 256 loads are short, the 257th is long.
        assert_eq!(chunk.byte_at(0), Instruction::Constant.into());
        let long_offset = 0x100 * 2;
        assert_eq!(chunk.byte_at(long_offset), Instruction::ConstantLong.into());
        assert_eq!(chunk.u16_at(long_offset + 1), 0x100);
        assert_eq!(chunk.constant_at(0x100), Value::Number(256.0));

        // Both widths round-trip through the disassembler.
        let heap = Heap::new();
        let (short, size) = chunk.disassemble_instr_at(&heap, 0);
        assert_eq!(size, 2);
        assert!(short.contains("CONSTANT"));
        let (long, size) = chunk.disassemble_instr_at(&heap, long_offset);
        assert_eq!(size, 3);
        assert!(long.contains("CONSTANT_LONG"));
        assert!(long.contains("'256'"));
    }

    #[test]
    fn jumps_patch_to_the_current_end() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(Instruction::JumpIfFalse, 1);
        chunk.write_instr(Instruction::Pop, 1);
        chunk.write_instr(Instruction::Pop, 1);
        chunk.patch_jump(jump).unwrap();

        // Two bytes of body: distance past the operand is 2.
        assert_eq!(chunk.u16_at(jump + 1), 2);
    }

    #[test]
    fn loops_jump_back_past_their_own_operand() {
        let mut chunk = Chunk::new();
        chunk.write_instr(Instruction::Nil, 1);
        let loop_start = chunk.len();
        chunk.write_instr(Instruction::Pop, 1);
        chunk.emit_loop(loop_start, 1).unwrap();

        let operand = chunk.u16_at(chunk.len() - 2) as usize;
        // Executing Loop with ip past the operand lands on loop_start.
        assert_eq!(chunk.len() - operand, loop_start);
    }

    #[test]
    fn disassembly_consumes_every_byte_exactly_once() {
        let mut heap = Heap::new();
        let mut function = Function::new(None);
        function.up_values_count = 2;
        let function = heap.alloc(Obj::Function(function));

        let mut chunk = Chunk::new();
        chunk.emit_const(Value::Number(1.0), 1).unwrap();
        chunk.write_instr(Instruction::Negate, 1);
        let jump = chunk.emit_jump(Instruction::Jump, 2);
        chunk.write_instr(Instruction::GetLocal, 2);
        chunk.write(1, 2);
        chunk.patch_jump(jump).unwrap();

        let index = chunk.add_constant(Value::Obj(function));
        chunk.write_instr(Instruction::Closure, 3);
        chunk.write(index as u8, 3);
        chunk.write(1, 3);
        chunk.write(0, 3);
        chunk.write(0, 3);
        chunk.write(1, 3);
        chunk.write_instr(Instruction::Return, 4);

        let mut offset = 0;
        let mut decoded = 0;
        while offset < chunk.len() {
            let (_, size) = chunk.disassemble_instr_at(&heap, offset);
            offset += size;
            decoded += 1;
        }
        assert_eq!(offset, chunk.len());
        assert_eq!(decoded, 6);
    }
}
