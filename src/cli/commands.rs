//! CLI commands for the ledger
//!
//! Implements all command handlers for the CLI interface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::contract::{assemble, disassemble, execute, Script, ScriptContext, SmartContract};
use crate::core::{Amount, Block, Blockchain, ChainConfig, COIN};
use crate::crypto::{hash160, Signer};
use crate::mining::Miner;
use crate::network::{Node, NodeConfig};
use crate::wallet::Wallet;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Fee used by the demo payment: 0.001 coins
pub const DEMO_FEE: Amount = 100_000;

/// Render base units as a decimal coin amount
pub fn format_amount(amount: Amount) -> String {
    let whole = amount / COIN;
    let frac = amount % COIN;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{:08}", frac);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

/// Load `--config`, then apply a `--difficulty` override
pub fn load_chain_config(path: Option<&Path>, difficulty: Option<u32>) -> CliResult<ChainConfig> {
    let mut config = match path {
        Some(p) => ChainConfig::from_file(p)?,
        None => ChainConfig::default(),
    };
    if let Some(d) = difficulty {
        config.initial_difficulty = d;
    }
    Ok(config)
}

/// Run the two-wallet payment scenario on a local chain
pub fn cmd_demo(difficulty: u32, export: Option<&Path>) -> CliResult<()> {
    let mut blockchain = Blockchain::with_difficulty(difficulty);
    let alice = Wallet::with_label("alice");
    let bob = Wallet::with_label("bob");
    let miner = Wallet::with_label("miner");

    println!("⛓️  Local chain, difficulty {}", blockchain.difficulty());
    println!("   ├─ alice: {}", alice.address());
    println!("   ├─ bob:   {}", bob.address());
    println!("   └─ miner: {}", miner.address());

    let (block, stats) = Miner::new(&alice.address()).mine_block(&mut blockchain)?;
    println!("\n⛏️  Block {} mined to alice", block.index);
    println!("   ├─ Hash: {}", block.hash);
    println!("   ├─ Attempts: {}", stats.hash_attempts);
    println!("   └─ alice: {} coins", format_amount(alice.balance(&blockchain)));

    let id = alice.send(&mut blockchain, &bob.address(), 2 * COIN, DEMO_FEE)?;
    println!("\n📤 alice → bob: 2 coins, fee {}", format_amount(DEMO_FEE));
    println!("   └─ Transaction {}", short(&id));

    let (block, stats) = Miner::new(&miner.address()).mine_block(&mut blockchain)?;
    println!("\n⛏️  Block {} mined to miner", block.index);
    println!("   ├─ Hash: {}", block.hash);
    println!("   ├─ Transactions: {}", block.tx_count());
    println!("   └─ Time: {}ms", stats.time_ms);

    if let Some(proof) = blockchain
        .get_transaction(&id)
        .and_then(|tx| block.verify_transaction_inclusion(tx))
    {
        println!("\n🌳 Payment proven against merkle root with {} steps", proof.len());
    }

    println!("\n💰 Balances");
    println!("   ├─ alice: {}", format_amount(alice.balance(&blockchain)));
    println!("   ├─ bob:   {}", format_amount(bob.balance(&blockchain)));
    println!("   └─ miner: {}", format_amount(miner.balance(&blockchain)));

    let locking = SmartContract::p2pkh(&hash160(&hex::decode(bob.public_key())?));
    println!("\n📜 Pay-to-hash lock for bob");
    println!("   └─ {}", disassemble(&locking.locking_script)?);

    print_validity(&blockchain);

    if let Some(path) = export {
        write_blocks(blockchain.blocks(), path)?;
        println!("\n📦 Chain exported to {:?}", path);
    }
    Ok(())
}

fn print_validity(blockchain: &Blockchain) {
    if blockchain.is_chain_valid() {
        println!("\n✅ Chain is valid ({} blocks)", blockchain.blocks().len());
    } else {
        println!("\n❌ Chain validation FAILED");
    }
}

fn write_blocks(blocks: &[Block], path: &Path) -> CliResult<()> {
    std::fs::write(path, serde_json::to_string_pretty(blocks)?)?;
    Ok(())
}

/// Replay an exported chain and report on it
pub fn cmd_validate(input: &Path, config: ChainConfig) -> CliResult<()> {
    println!("🔍 Validating {:?}...", input);
    let blocks: Vec<Block> = serde_json::from_str(&std::fs::read_to_string(input)?)?;

    match Blockchain::from_blocks(blocks, config) {
        Ok(blockchain) => {
            let stats = blockchain.stats();
            println!("✅ Chain is valid!");
            println!("   ├─ Height: {}", stats.height);
            println!("   ├─ Total transactions: {}", stats.total_transactions);
            println!(
                "   ├─ Circulating supply: {} coins",
                format_amount(stats.circulating_supply)
            );
            println!("   ├─ Next difficulty: {}", stats.difficulty);
            println!("   └─ Latest hash: {}", stats.latest_hash);
        }
        Err(e) => println!("❌ Chain is invalid: {}", e),
    }
    Ok(())
}

/// Create a wallet, optionally saving it
pub fn cmd_wallet_new(label: Option<&str>, output: Option<&Path>) -> CliResult<()> {
    let wallet = match label {
        Some(l) => Wallet::with_label(l),
        None => Wallet::new(),
    };

    println!("🔑 New wallet");
    println!("   ├─ Address: {}", wallet.address());
    println!("   └─ Public key: {}", wallet.public_key());

    if let Some(path) = output {
        wallet.save(path)?;
        println!("\n💾 Saved to {:?}", path);
    }
    Ok(())
}

/// Assemble script source and print its hex
pub fn cmd_script_asm(source: &str) -> CliResult<()> {
    let script = assemble(source)?;
    println!("{}", script.to_hex());
    Ok(())
}

/// Disassemble hex and print the mnemonics
pub fn cmd_script_disasm(hex_code: &str) -> CliResult<()> {
    let script = Script::from_hex(hex_code)?;
    println!("{}", disassemble(&script)?);
    Ok(())
}

/// Run assembled source on an empty stack with a given lock time
pub fn cmd_script_run(source: &str, lock_time: u64) -> CliResult<()> {
    let script = assemble(source)?;
    let context = ScriptContext::new(Vec::new(), lock_time);
    match execute(&script, Vec::new(), &context) {
        Ok(true) => println!("✅ Script succeeded"),
        Ok(false) => println!("❌ Script evaluated to false"),
        Err(e) => println!("❌ Script failed: {}", e),
    }
    Ok(())
}

/// Options for `node`
pub struct NodeOptions {
    pub listen: String,
    pub advertise: Option<String>,
    pub peers: Vec<String>,
    pub chain: ChainConfig,
    pub mine_to: Option<String>,
    pub mine_interval: Duration,
}

/// Run a node until Ctrl+C, optionally mining in a loop
pub async fn cmd_node(options: NodeOptions) -> CliResult<()> {
    let blockchain = Arc::new(RwLock::new(Blockchain::with_config(options.chain)));
    let config = NodeConfig {
        listen_addr: options.listen,
        advertise_addr: options.advertise,
        seeds: options.peers,
        ..NodeConfig::default()
    };

    let node = Node::start(config, blockchain).await?;
    println!("🌐 Node listening on {}", node.address());

    if let Some(address) = options.mine_to {
        println!("⛏️  Mining to {}", address);
        let miner = node.clone();
        let interval = options.mine_interval;
        tokio::spawn(async move {
            while miner.is_running() {
                match miner.mine_block(&address).await {
                    Ok(block) => println!("   #{} | {}", block.index, short(&block.hash)),
                    Err(e) => log::warn!("Mining failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down node...");
    node.shutdown().await;

    let status = node.status().await;
    println!("   ├─ Height: {}", status.height);
    println!("   └─ Tip: {}", status.tip_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(0), "0");
        assert_eq!(format_amount(2 * COIN), "2");
        assert_eq!(format_amount(625_000_000), "6.25");
        assert_eq!(format_amount(100_000), "0.001");
    }

    #[test]
    fn test_demo_exports_valid_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        cmd_demo(1, Some(&path)).unwrap();

        let blocks: Vec<Block> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(blocks.len(), 3);
        let chain = Blockchain::from_blocks(blocks, ChainConfig::with_difficulty(1)).unwrap();
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn test_load_chain_config_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "block_subsidy": 5000000000 }"#).unwrap();

        let config = load_chain_config(Some(&path), Some(2)).unwrap();
        assert_eq!(config.block_subsidy, 50 * COIN);
        assert_eq!(config.initial_difficulty, 2);
    }
}
