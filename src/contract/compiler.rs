//! Script assembler
//!
//! Turns whitespace-separated assembly into script bytes and back.
//! Tokens are opcode mnemonics (`OP_DUP`, `DUP`), hex data in angle
//! brackets (`<89abcdef>`) or `0x`-prefixed hex data. `;` and `#` start a
//! comment that runs to the end of the line.

use thiserror::Error;

use crate::contract::opcodes::OpCode;
use crate::contract::script::{Instruction, Script};
use crate::contract::vm::VmError;

/// Compiler errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilerError {
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),
    #[error("Invalid data push: {0}")]
    InvalidData(String),
    #[error("PUSHDATA opcodes are implicit; write the data instead")]
    ExplicitPushData,
}

/// Assembles source text into a [`Script`]
#[derive(Debug, Default)]
pub struct Compiler {
    script: Script,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile source code to a script
    pub fn compile(&mut self, source: &str) -> Result<Script, CompilerError> {
        self.script = Script::new();

        for line in source.lines() {
            let code = line.split([';', '#']).next().unwrap_or_default();
            for token in code.split_whitespace() {
                self.compile_token(token)?;
            }
        }

        Ok(std::mem::take(&mut self.script))
    }

    fn compile_token(&mut self, token: &str) -> Result<(), CompilerError> {
        let script = std::mem::take(&mut self.script);

        if let Some(inner) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            self.script = script.push_data(&parse_hex(inner)?);
            return Ok(());
        }
        if let Some(hex_str) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            self.script = script.push_data(&parse_hex(hex_str)?);
            return Ok(());
        }

        match OpCode::from_name(token) {
            Some(op) if op.is_push() => {
                self.script = script;
                Err(CompilerError::ExplicitPushData)
            }
            Some(op) => {
                self.script = script.push_op(op);
                Ok(())
            }
            None => {
                self.script = script;
                Err(CompilerError::UnknownInstruction(token.to_string()))
            }
        }
    }
}

fn parse_hex(s: &str) -> Result<Vec<u8>, CompilerError> {
    hex::decode(s).map_err(|_| CompilerError::InvalidData(s.to_string()))
}

/// Compile assembly in one call
pub fn assemble(source: &str) -> Result<Script, CompilerError> {
    Compiler::new().compile(source)
}

/// Render a script as assembly, one token per instruction
pub fn disassemble(script: &Script) -> Result<String, VmError> {
    let tokens: Vec<String> = script
        .instructions()?
        .into_iter()
        .map(|instruction| match instruction {
            Instruction::Push(data) => format!("<{}>", hex::encode(data)),
            Instruction::Op(op) => op.name().to_string(),
            Instruction::Unknown(byte) => format!("UNKNOWN_0x{:02x}", byte),
        })
        .collect();
    Ok(tokens.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_p2pkh_shape() {
        let script = assemble(
            "
            OP_DUP OP_HASH160 <0102030405060708090a0b0c0d0e0f1011121314>
            OP_EQUALVERIFY   ; compare hashes
            OP_CHECKSIG
        ",
        )
        .unwrap();

        let bytes = script.as_bytes();
        assert_eq!(bytes[0], OpCode::Dup as u8);
        assert_eq!(bytes[1], OpCode::Hash160 as u8);
        assert_eq!(bytes[2], 20);
        assert_eq!(bytes[23], OpCode::EqualVerify as u8);
        assert_eq!(bytes[24], OpCode::CheckSig as u8);
    }

    #[test]
    fn test_hex_literal_and_bare_names() {
        let script = assemble("0x0a0b dup equal").unwrap();
        assert_eq!(script.as_bytes(), &[0x02, 0x0a, 0x0b, 0x76, 0x87]);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            assemble("OP_FROB"),
            Err(CompilerError::UnknownInstruction("OP_FROB".to_string()))
        );
        assert_eq!(
            assemble("<zz>"),
            Err(CompilerError::InvalidData("zz".to_string()))
        );
        assert_eq!(assemble("OP_PUSHDATA1"), Err(CompilerError::ExplicitPushData));
    }

    #[test]
    fn test_disassemble_roundtrip() {
        let source = "OP_IF OP_HASH160 <abcd> OP_EQUALVERIFY OP_ELSE <00000064> OP_CHECKLOCKTIMEVERIFY OP_DROP OP_ENDIF";
        let script = assemble(source).unwrap();
        let text = disassemble(&script).unwrap();
        assert_eq!(text, source);
        assert_eq!(assemble(&text).unwrap(), script);
    }
}
