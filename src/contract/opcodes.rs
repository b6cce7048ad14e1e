//! Script opcodes
//!
//! Byte values follow the familiar Bitcoin Script table. Bytes
//! `0x01..=0x4b` are not opcodes: they push that many following bytes.

use serde::{Deserialize, Serialize};

/// Largest length that can be pushed with a single length byte
pub const MAX_DIRECT_PUSH: u8 = 0x4b;

/// Opcodes understood by the script VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    // Constants
    /// Push an empty value (false)
    False = 0x00,
    /// Next byte is the length of the data to push
    PushData1 = 0x4c,
    /// Next two bytes (big-endian) are the length
    PushData2 = 0x4d,
    /// Next four bytes (big-endian) are the length
    PushData4 = 0x4e,
    /// Push `0x01`
    True = 0x51,

    // Flow control
    If = 0x63,
    Else = 0x67,
    EndIf = 0x68,
    /// Fail unless the popped value is true
    Verify = 0x69,

    // Stack
    Drop = 0x75,
    Dup = 0x76,

    // Comparison and arithmetic
    Equal = 0x87,
    EqualVerify = 0x88,
    Add = 0x93,

    // Crypto
    Hash160 = 0xa9,
    CheckSig = 0xac,
    CheckMultiSig = 0xae,

    // Locktime
    CheckLockTimeVerify = 0xb1,
}

impl OpCode {
    /// Convert byte to opcode
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(OpCode::False),
            0x4c => Some(OpCode::PushData1),
            0x4d => Some(OpCode::PushData2),
            0x4e => Some(OpCode::PushData4),
            0x51 => Some(OpCode::True),
            0x63 => Some(OpCode::If),
            0x67 => Some(OpCode::Else),
            0x68 => Some(OpCode::EndIf),
            0x69 => Some(OpCode::Verify),
            0x75 => Some(OpCode::Drop),
            0x76 => Some(OpCode::Dup),
            0x87 => Some(OpCode::Equal),
            0x88 => Some(OpCode::EqualVerify),
            0x93 => Some(OpCode::Add),
            0xa9 => Some(OpCode::Hash160),
            0xac => Some(OpCode::CheckSig),
            0xae => Some(OpCode::CheckMultiSig),
            0xb1 => Some(OpCode::CheckLockTimeVerify),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Assembly mnemonic
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::False => "OP_0",
            OpCode::PushData1 => "OP_PUSHDATA1",
            OpCode::PushData2 => "OP_PUSHDATA2",
            OpCode::PushData4 => "OP_PUSHDATA4",
            OpCode::True => "OP_TRUE",
            OpCode::If => "OP_IF",
            OpCode::Else => "OP_ELSE",
            OpCode::EndIf => "OP_ENDIF",
            OpCode::Verify => "OP_VERIFY",
            OpCode::Drop => "OP_DROP",
            OpCode::Dup => "OP_DUP",
            OpCode::Equal => "OP_EQUAL",
            OpCode::EqualVerify => "OP_EQUALVERIFY",
            OpCode::Add => "OP_ADD",
            OpCode::Hash160 => "OP_HASH160",
            OpCode::CheckSig => "OP_CHECKSIG",
            OpCode::CheckMultiSig => "OP_CHECKMULTISIG",
            OpCode::CheckLockTimeVerify => "OP_CHECKLOCKTIMEVERIFY",
        }
    }

    /// Parse a mnemonic, with or without the `OP_` prefix
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        let bare = upper.strip_prefix("OP_").unwrap_or(&upper);
        match bare {
            "0" | "FALSE" => Some(OpCode::False),
            "PUSHDATA1" => Some(OpCode::PushData1),
            "PUSHDATA2" => Some(OpCode::PushData2),
            "PUSHDATA4" => Some(OpCode::PushData4),
            "1" | "TRUE" => Some(OpCode::True),
            "IF" => Some(OpCode::If),
            "ELSE" => Some(OpCode::Else),
            "ENDIF" => Some(OpCode::EndIf),
            "VERIFY" => Some(OpCode::Verify),
            "DROP" => Some(OpCode::Drop),
            "DUP" => Some(OpCode::Dup),
            "EQUAL" => Some(OpCode::Equal),
            "EQUALVERIFY" => Some(OpCode::EqualVerify),
            "ADD" => Some(OpCode::Add),
            "HASH160" => Some(OpCode::Hash160),
            "CHECKSIG" => Some(OpCode::CheckSig),
            "CHECKMULTISIG" => Some(OpCode::CheckMultiSig),
            "CHECKLOCKTIMEVERIFY" | "CLTV" => Some(OpCode::CheckLockTimeVerify),
            _ => None,
        }
    }

    /// Whether the opcode carries inline data
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            OpCode::PushData1 | OpCode::PushData2 | OpCode::PushData4
        )
    }

    /// Whether the opcode opens, switches or closes a branch
    pub fn is_conditional(&self) -> bool {
        matches!(self, OpCode::If | OpCode::Else | OpCode::EndIf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=255 {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op.to_byte(), byte);
                assert_eq!(OpCode::from_name(op.name()), Some(op));
            }
        }
    }

    #[test]
    fn test_direct_push_range_is_not_an_opcode() {
        for byte in 0x01..=MAX_DIRECT_PUSH {
            assert!(OpCode::from_byte(byte).is_none());
        }
    }

    #[test]
    fn test_name_aliases() {
        assert_eq!(OpCode::from_name("dup"), Some(OpCode::Dup));
        assert_eq!(OpCode::from_name("OP_FALSE"), Some(OpCode::False));
        assert_eq!(OpCode::from_name("CLTV"), Some(OpCode::CheckLockTimeVerify));
        assert_eq!(OpCode::from_name("OP_NOPE"), None);
    }
}
