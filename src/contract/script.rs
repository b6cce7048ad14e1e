//! Byte-encoded script programs
//!
//! A [`Script`] is a flat byte string. [`Script::instructions`] and the
//! VM share [`read_instruction`], so what the disassembler shows is what
//! the VM executes.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::opcodes::{OpCode, MAX_DIRECT_PUSH};
use super::vm::VmError;

/// One decoded step of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Data pushed by a direct push or one of the PUSHDATA forms
    Push(Vec<u8>),
    Op(OpCode),
    /// A byte with no meaning in the opcode table
    Unknown(u8),
}

/// Decode the instruction starting at `pc`.
///
/// Returns the instruction and the offset of the next one.
pub fn read_instruction(code: &[u8], pc: usize) -> Result<(Instruction, usize), VmError> {
    let byte = *code.get(pc).ok_or(VmError::TruncatedPush)?;
    let mut cursor = pc + 1;

    let len = match byte {
        0x01..=MAX_DIRECT_PUSH => byte as usize,
        0x4c => read_length(code, &mut cursor, 1)?,
        0x4d => read_length(code, &mut cursor, 2)?,
        0x4e => read_length(code, &mut cursor, 4)?,
        other => {
            let instruction = match OpCode::from_byte(other) {
                Some(op) => Instruction::Op(op),
                None => Instruction::Unknown(other),
            };
            return Ok((instruction, cursor));
        }
    };

    let end = cursor.checked_add(len).ok_or(VmError::TruncatedPush)?;
    let data = code.get(cursor..end).ok_or(VmError::TruncatedPush)?;
    Ok((Instruction::Push(data.to_vec()), end))
}

fn read_length(code: &[u8], cursor: &mut usize, width: usize) -> Result<usize, VmError> {
    let bytes = code
        .get(*cursor..*cursor + width)
        .ok_or(VmError::TruncatedPush)?;
    *cursor += width;
    Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

/// A script program
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(hex_str)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an opcode
    pub fn push_op(mut self, op: OpCode) -> Self {
        self.0.push(op.to_byte());
        self
    }

    /// Append a data push using the shortest encoding
    pub fn push_data(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len == 0 {
            self.0.push(OpCode::False.to_byte());
            return self;
        }

        if len <= MAX_DIRECT_PUSH as usize {
            self.0.push(len as u8);
        } else if len <= u8::MAX as usize {
            self.0.push(OpCode::PushData1.to_byte());
            self.0.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.0.push(OpCode::PushData2.to_byte());
            self.0.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.0.push(OpCode::PushData4.to_byte());
            self.0.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Append a 4-byte big-endian number
    pub fn push_u32(self, value: u32) -> Self {
        self.push_data(&value.to_be_bytes())
    }

    /// Concatenate two programs
    pub fn concat(&self, other: &Script) -> Script {
        let mut bytes = self.0.clone();
        bytes.extend_from_slice(&other.0);
        Script(bytes)
    }

    /// Decode the whole program
    pub fn instructions(&self) -> Result<Vec<Instruction>, VmError> {
        let mut out = Vec::new();
        let mut pc = 0;
        while pc < self.0.len() {
            let (instruction, next) = read_instruction(&self.0, pc)?;
            out.push(instruction);
            pc = next;
        }
        Ok(out)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Script::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_encodings() {
        assert_eq!(Script::new().push_data(&[]).as_bytes(), &[0x00]);
        assert_eq!(Script::new().push_data(&[7]).as_bytes(), &[0x01, 7]);

        let medium = vec![1u8; 100];
        let script = Script::new().push_data(&medium);
        assert_eq!(&script.as_bytes()[..2], &[0x4c, 100]);

        let large = vec![2u8; 300];
        let script = Script::new().push_data(&large);
        assert_eq!(&script.as_bytes()[..3], &[0x4d, 0x01, 0x2c]);
        assert_eq!(script.instructions().unwrap(), vec![Instruction::Push(large)]);
    }

    #[test]
    fn test_instructions() {
        let script = Script::new()
            .push_op(OpCode::Dup)
            .push_data(&[0xaa; 20])
            .push_op(OpCode::EqualVerify);
        assert_eq!(
            script.instructions().unwrap(),
            vec![
                Instruction::Op(OpCode::Dup),
                Instruction::Push(vec![0xaa; 20]),
                Instruction::Op(OpCode::EqualVerify),
            ]
        );
    }

    #[test]
    fn test_truncated_push() {
        let script = Script::from_bytes(vec![0x05, 1, 2]);
        assert!(matches!(script.instructions(), Err(VmError::TruncatedPush)));

        let script = Script::from_bytes(vec![0x4d, 0x01]);
        assert!(matches!(script.instructions(), Err(VmError::TruncatedPush)));
    }

    #[test]
    fn test_unknown_byte_decodes() {
        let script = Script::from_bytes(vec![0xff]);
        assert_eq!(script.instructions().unwrap(), vec![Instruction::Unknown(0xff)]);
    }

    #[test]
    fn test_serde_as_hex() {
        let script = Script::new().push_op(OpCode::True);
        let json = serde_json::to_string(&script).unwrap();
        assert_eq!(json, "\"51\"");
        let back: Script = serde_json::from_str(&json).unwrap();
        assert_eq!(back, script);
    }
}
