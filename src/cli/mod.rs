//! Command-line interface
//!
//! Handlers behind the `ledger` binary's subcommands.

pub mod commands;

pub use commands::{
    cmd_demo, cmd_node, cmd_script_asm, cmd_script_disasm, cmd_script_run, cmd_validate,
    cmd_wallet_new, format_amount, load_chain_config, CliResult, NodeOptions, DEMO_FEE,
};
