//! Script contracts
//!
//! A small Bitcoin-style script system that decides whether a spend
//! condition is met.
//!
//! # Overview
//!
//! This module implements:
//! - The opcode table and a byte-level [`Script`] builder
//! - A stack-based VM with branch tracking
//! - [`SmartContract`] with pay-to-hash, multisig and HTLC builders
//! - An assembler and disassembler for script text
//!
//! # Example
//!
//! ```rust
//! use mini_ledger::contract::{assemble, ScriptContext, SmartContract};
//!
//! let locking = assemble("<02> <03> OP_ADD").unwrap();
//! let contract = SmartContract::new(locking);
//! assert!(contract.validate(&ScriptContext::default()));
//! ```

pub mod compiler;
pub mod contract;
pub mod opcodes;
pub mod script;
pub mod vm;

pub use compiler::{assemble, disassemble, Compiler, CompilerError};
pub use contract::{ContractError, SmartContract};
pub use opcodes::OpCode;
pub use script::{Instruction, Script};
pub use vm::{execute, is_true, ScriptContext, VmError, VM};
