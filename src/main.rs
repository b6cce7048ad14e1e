//! Mini-Ledger CLI Application
//!
//! A command-line interface for running ledger nodes and tools.

use clap::{Parser, Subcommand};
use mini_ledger::cli::{self, NodeOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(version = "0.1.0")]
#[command(about = "A UTXO ledger with proof-of-work and peer gossip", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a P2P node
    Node {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8333")]
        listen: String,

        /// Address announced to peers (defaults to the bound address)
        #[arg(long)]
        advertise: Option<String>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Chain parameters file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the initial difficulty
        #[arg(short, long)]
        difficulty: Option<u32>,

        /// Mine continuously, paying rewards to this address
        #[arg(long)]
        mine_to: Option<String>,

        /// Pause between mined blocks, in milliseconds
        #[arg(long, default_value = "1000")]
        mine_interval_ms: u64,
    },

    /// Run a local payment scenario
    Demo {
        /// Mining difficulty (leading zero hex digits)
        #[arg(short, long, default_value = "2")]
        difficulty: u32,

        /// Write the resulting chain to this file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Validate an exported chain
    Validate {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Chain parameters file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the initial difficulty
        #[arg(short, long)]
        difficulty: Option<u32>,
    },

    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Script tools
    Script {
        #[command(subcommand)]
        action: ScriptCommands,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New {
        /// Optional label for the wallet
        #[arg(short, long)]
        label: Option<String>,

        /// Save the wallet to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ScriptCommands {
    /// Assemble mnemonics into hex
    Asm { source: String },

    /// Disassemble hex into mnemonics
    Disasm { hex: String },

    /// Assemble and execute on an empty stack
    Run {
        source: String,

        #[arg(long, default_value = "0")]
        lock_time: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            listen,
            advertise,
            peers,
            config,
            difficulty,
            mine_to,
            mine_interval_ms,
        } => {
            let seeds: Vec<String> = peers
                .map(|p| {
                    p.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let options = NodeOptions {
                listen,
                advertise,
                peers: seeds,
                chain: cli::load_chain_config(config.as_deref(), difficulty)?,
                mine_to,
                mine_interval: Duration::from_millis(mine_interval_ms),
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_node(options))?;
        }

        Commands::Demo { difficulty, export } => {
            cli::cmd_demo(difficulty, export.as_deref())?;
        }

        Commands::Validate {
            input,
            config,
            difficulty,
        } => {
            let config = cli::load_chain_config(config.as_deref(), difficulty)?;
            cli::cmd_validate(&input, config)?;
        }

        Commands::Wallet { action } => match action {
            WalletCommands::New { label, output } => {
                cli::cmd_wallet_new(label.as_deref(), output.as_deref())?;
            }
        },

        Commands::Script { action } => match action {
            ScriptCommands::Asm { source } => cli::cmd_script_asm(&source)?,
            ScriptCommands::Disasm { hex } => cli::cmd_script_disasm(&hex)?,
            ScriptCommands::Run { source, lock_time } => {
                cli::cmd_script_run(&source, lock_time)?
            }
        },
    }

    Ok(())
}
