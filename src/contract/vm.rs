//! Script virtual machine
//!
//! A stack machine over byte-array values. Execution is a pure function of
//! the program bytes, the starting stack and a [`ScriptContext`]:
//!
//! - a value is false when it is empty or every byte is zero
//! - `IF`/`ELSE`/`ENDIF` keep a branch stack; only the taken arm runs
//! - `VERIFY`/`EQUALVERIFY` failures end the script with `false`
//! - malformed programs (underflow, unknown opcode, truncated push,
//!   unbalanced branches) are errors, not `false`

use thiserror::Error;

use super::opcodes::OpCode;
use super::script::{read_instruction, Instruction, Script};
use crate::crypto::{hash160, verify_raw};

// =============================================================================
// VM Constants
// =============================================================================

/// Maximum number of keys a CHECKMULTISIG may name
pub const MAX_MULTISIG_KEYS: u64 = 20;

/// Width of the integers produced by OP_ADD
pub const NUMBER_WIDTH: usize = 32;

// =============================================================================
// VM Errors
// =============================================================================

/// Errors raised by malformed scripts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("Push runs past the end of the script")]
    TruncatedPush,
    #[error("Unbalanced conditional")]
    UnbalancedConditional,
    #[error("Number exceeds {0} bytes")]
    NumberTooLarge(usize),
}

/// Transaction data visible to a running script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptContext {
    /// Digest that CHECKSIG and CHECKMULTISIG verify signatures against
    pub digest: Vec<u8>,
    /// Time compared by CHECKLOCKTIMEVERIFY
    pub lock_time: u64,
}

impl ScriptContext {
    pub fn new(digest: Vec<u8>, lock_time: u64) -> Self {
        Self { digest, lock_time }
    }
}

/// Truthiness of a stack value
pub fn is_true(value: &[u8]) -> bool {
    value.iter().any(|b| *b != 0)
}

/// Big-endian unsigned value of at most 8 significant bytes
pub fn decode_number(value: &[u8]) -> Result<u64, VmError> {
    let significant: &[u8] = match value.iter().position(|b| *b != 0) {
        Some(start) => &value[start..],
        None => &[],
    };
    if significant.len() > 8 {
        return Err(VmError::NumberTooLarge(8));
    }
    Ok(significant.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// 32-byte big-endian sum of two big-endian values
fn add_numbers(a: &[u8], b: &[u8]) -> Result<Vec<u8>, VmError> {
    if a.len() > NUMBER_WIDTH || b.len() > NUMBER_WIDTH {
        return Err(VmError::NumberTooLarge(NUMBER_WIDTH));
    }

    let mut out = vec![0u8; NUMBER_WIDTH];
    let mut carry = 0u16;
    for i in 0..NUMBER_WIDTH {
        let x = a.iter().rev().nth(i).copied().unwrap_or(0) as u16;
        let y = b.iter().rev().nth(i).copied().unwrap_or(0) as u16;
        let sum = x + y + carry;
        out[NUMBER_WIDTH - 1 - i] = (sum & 0xff) as u8;
        carry = sum >> 8;
    }

    if carry != 0 {
        return Err(VmError::NumberTooLarge(NUMBER_WIDTH));
    }
    Ok(out)
}

const TRUE: [u8; 1] = [0x01];
const FALSE: [u8; 1] = [0x00];

fn bool_value(b: bool) -> Vec<u8> {
    if b {
        TRUE.to_vec()
    } else {
        FALSE.to_vec()
    }
}

/// The script virtual machine
pub struct VM {
    code: Vec<u8>,
    pc: usize,
    stack: Vec<Vec<u8>>,
    /// One entry per open IF: whether that arm is executing
    branches: Vec<bool>,
    context: ScriptContext,
}

impl VM {
    pub fn new(script: &Script, context: ScriptContext) -> Self {
        Self::with_stack(script, Vec::new(), context)
    }

    pub fn with_stack(script: &Script, stack: Vec<Vec<u8>>, context: ScriptContext) -> Self {
        Self {
            code: script.as_bytes().to_vec(),
            pc: 0,
            stack,
            branches: Vec::new(),
            context,
        }
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    fn pop(&mut self) -> Result<Vec<u8>, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn executing(&self) -> bool {
        self.branches.iter().all(|taken| *taken)
    }

    /// Run the program to completion.
    ///
    /// Returns the truthiness of the final top of stack; an empty stack is
    /// `false`.
    pub fn run(&mut self) -> Result<bool, VmError> {
        while self.pc < self.code.len() {
            let (instruction, next) = read_instruction(&self.code, self.pc)?;
            self.pc = next;

            let op = match instruction {
                Instruction::Unknown(byte) => return Err(VmError::UnknownOpcode(byte)),
                Instruction::Push(data) => {
                    if self.executing() {
                        self.stack.push(data);
                    }
                    continue;
                }
                Instruction::Op(op) => op,
            };

            match op {
                OpCode::If => {
                    let taken = if self.executing() {
                        is_true(&self.pop()?)
                    } else {
                        false
                    };
                    self.branches.push(taken);
                    continue;
                }
                OpCode::Else => {
                    let arm = self
                        .branches
                        .last_mut()
                        .ok_or(VmError::UnbalancedConditional)?;
                    *arm = !*arm;
                    continue;
                }
                OpCode::EndIf => {
                    self.branches
                        .pop()
                        .ok_or(VmError::UnbalancedConditional)?;
                    continue;
                }
                _ => {}
            }

            if !self.executing() {
                continue;
            }

            if !self.step(op)? {
                return Ok(false);
            }
        }

        if !self.branches.is_empty() {
            return Err(VmError::UnbalancedConditional);
        }

        Ok(self.stack.last().map(|top| is_true(top)).unwrap_or(false))
    }

    /// Execute one non-branching opcode. `Ok(false)` ends the script.
    fn step(&mut self, op: OpCode) -> Result<bool, VmError> {
        match op {
            OpCode::False => self.stack.push(Vec::new()),
            OpCode::True => self.stack.push(TRUE.to_vec()),
            OpCode::PushData1 | OpCode::PushData2 | OpCode::PushData4 => {
                return Err(VmError::TruncatedPush)
            }
            OpCode::If | OpCode::Else | OpCode::EndIf => {
                return Err(VmError::UnbalancedConditional)
            }
            OpCode::Verify => {
                if !is_true(&self.pop()?) {
                    return Ok(false);
                }
            }
            OpCode::Drop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = self.stack.last().ok_or(VmError::StackUnderflow)?.clone();
                self.stack.push(top);
            }
            OpCode::Equal => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(bool_value(a == b));
            }
            OpCode::EqualVerify => {
                let a = self.pop()?;
                let b = self.pop()?;
                if a != b {
                    return Ok(false);
                }
            }
            OpCode::Add => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(add_numbers(&a, &b)?);
            }
            OpCode::Hash160 => {
                let data = self.pop()?;
                self.stack.push(hash160(&data));
            }
            OpCode::CheckSig => {
                let public_key = self.pop()?;
                let signature = self.pop()?;
                let ok = verify_raw(&public_key, &self.context.digest, &signature);
                self.stack.push(bool_value(ok));
            }
            OpCode::CheckMultiSig => {
                let ok = self.check_multisig()?;
                self.stack.push(bool_value(ok));
            }
            OpCode::CheckLockTimeVerify => {
                let top = self.stack.last().ok_or(VmError::StackUnderflow)?;
                if decode_number(top)? > self.context.lock_time {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Stack, top first: `N, key_N .. key_1, M, sig_M .. sig_1`.
    ///
    /// Needs `1 <= M <= N <= 20`. Signatures are matched against keys in
    /// order and each key can satisfy at most one signature.
    fn check_multisig(&mut self) -> Result<bool, VmError> {
        let n = decode_number(&self.pop()?)?;
        if n == 0 || n > MAX_MULTISIG_KEYS {
            return Ok(false);
        }
        if self.stack.len() < n as usize {
            return Err(VmError::StackUnderflow);
        }
        let mut keys: Vec<Vec<u8>> = (0..n).map(|_| self.pop()).collect::<Result<_, _>>()?;
        keys.reverse();

        let m = decode_number(&self.pop()?)?;
        if m == 0 || m > n {
            return Ok(false);
        }
        if self.stack.len() < m as usize {
            return Err(VmError::StackUnderflow);
        }
        let mut signatures: Vec<Vec<u8>> =
            (0..m).map(|_| self.pop()).collect::<Result<_, _>>()?;
        signatures.reverse();

        let mut next_key = 0;
        for signature in &signatures {
            loop {
                let Some(key) = keys.get(next_key) else {
                    return Ok(false);
                };
                next_key += 1;
                if verify_raw(key, &self.context.digest, signature) {
                    break;
                }
            }
        }
        Ok(true)
    }
}

/// Run `script` on `stack` with `context`
pub fn execute(
    script: &Script,
    stack: Vec<Vec<u8>>,
    context: &ScriptContext,
) -> Result<bool, VmError> {
    VM::with_stack(script, stack, context.clone()).run()
}
