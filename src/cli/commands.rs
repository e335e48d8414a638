//! CLI commands for the wallet
//!
//! Implements all command handlers for the `spv-wallet` binary.

use crate::kit::{BlockInfo, KitConfig, KitError, KitListener, KitState, SpvKit};
use crate::network::{Network, PeerGroupError};
use crate::storage::{FullTransactionInfo, MemoryStorage, StorageConfig, TransactionFilterType};
use crate::transactions::{BalanceInfo, CreatorError, PluginData};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const SATOSHIS_PER_COIN: f64 = 100_000_000.0;

/// How often `send` retries while waiting for synced peers
const SEND_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Logs kit callbacks while a networked command runs
struct LogListener;

impl KitListener for LogListener {
    fn on_transactions_update(&self, inserted: &[FullTransactionInfo], updated: &[FullTransactionInfo]) {
        for info in inserted {
            log::info!("New transaction {} ({} sat)", info.header.hash_hex(), net_amount(info));
        }
        for info in updated {
            log::info!("Transaction {} is now {:?}", info.header.hash_hex(), info.header.status);
        }
    }

    fn on_balance_update(&self, balance: BalanceInfo) {
        log::info!(
            "Balance: {} sat spendable, {} sat pending",
            balance.spendable,
            balance.unspendable
        );
    }

    fn on_last_block_info_update(&self, info: &BlockInfo) {
        log::debug!("Last block {} at height {}", info.header_hash, info.height);
    }

    fn on_kit_state_update(&self, state: &KitState) {
        log::info!("Sync state: {}", state);
    }
}

/// Application state
pub struct WalletState {
    pub kit: SpvKit,
    pub data_dir: PathBuf,
}

impl WalletState {
    /// Open the wallet store under `data_dir` and build a kit for `seed`
    pub fn new(data_dir: PathBuf, network: Network, seed: &[u8]) -> CliResult<Self> {
        let storage = MemoryStorage::open(StorageConfig::with_data_dir(data_dir.join(network.to_string())))?;
        let kit = SpvKit::new(KitConfig::for_network(network), seed, Arc::new(storage))?;
        kit.set_listener(Arc::new(LogListener));

        Ok(Self { kit, data_dir })
    }
}

/// Received minus spent, from the wallet's point of view
fn net_amount(info: &FullTransactionInfo) -> i64 {
    let received: u64 = info.outputs.iter().filter(|o| o.is_mine()).map(|o| o.value).sum();
    let spent: u64 = info
        .inputs
        .iter()
        .filter_map(|i| i.previous_output.as_ref())
        .filter(|o| o.is_mine())
        .map(|o| o.value)
        .sum();
    received as i64 - spent as i64
}

fn coins(satoshis: u64) -> f64 {
    satoshis as f64 / SATOSHIS_PER_COIN
}

fn plugin_data(unlock_height: Option<u32>) -> Vec<PluginData> {
    unlock_height
        .map(|unlock_height| vec![PluginData::LockHeight { unlock_height }])
        .unwrap_or_default()
}

/// Sync with the network for `duration`, or until the chain tip is reached
pub async fn cmd_sync(state: &WalletState, duration: Option<u64>) -> CliResult<()> {
    println!("🔄 Syncing {} wallet...", state.kit.network_params().network);
    println!("   📁 Data directory: {:?}", state.data_dir);

    state.kit.start()?;
    let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sync_state = state.kit.sync_state();
                if let Some(status) = state.kit.peer_status() {
                    println!(
                        "   ├─ {} ({} peers, {} synced)",
                        sync_state, status.connected, status.synced
                    );
                }
                if deadline.is_none() && sync_state == KitState::Synced {
                    break;
                }
                if deadline.map(|d| tokio::time::Instant::now() >= d).unwrap_or(false) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Interrupted");
                break;
            }
        }
    }

    state.kit.stop().await;
    println!("✅ Sync stopped: {}", state.kit.sync_state());
    if let Some(block) = state.kit.last_block_info() {
        println!("   🧱 Last block: {} at height {}", block.header_hash, block.height);
    }
    print_balance(state.kit.balance());

    Ok(())
}

fn print_balance(balance: BalanceInfo) {
    println!("💰 Balance");
    println!("   ├─ Spendable: {} sat ({:.8})", balance.spendable, coins(balance.spendable));
    println!("   └─ Pending: {} sat ({:.8})", balance.unspendable, coins(balance.unspendable));
}

/// Show the stored balance and spendable outputs
pub fn cmd_balance(state: &WalletState) -> CliResult<()> {
    print_balance(state.kit.balance());

    let outputs = state.kit.unspent_outputs();
    if !outputs.is_empty() {
        println!("\n   Unspent outputs:");
        for unspent in outputs.iter().take(10) {
            let hash = hex::encode(unspent.output.transaction_hash.iter().rev().copied().collect::<Vec<u8>>());
            println!("   └─ {}:{} = {} sat", &hash[..16], unspent.output.index, unspent.output.value);
        }
        if outputs.len() > 10 {
            println!("   ... and {} more", outputs.len() - 10);
        }
    }

    Ok(())
}

/// Show the current receive address
pub fn cmd_address(state: &WalletState, change: bool) -> CliResult<()> {
    let address = if change {
        state.kit.change_address()?
    } else {
        state.kit.receive_address()?
    };

    println!("📍 {} address: {}", if change { "Change" } else { "Receive" }, address);
    Ok(())
}

/// Estimate the fee of a send, and the limits around it
pub fn cmd_fee(
    state: &WalletState,
    address: Option<&str>,
    amount: u64,
    fee_rate: u64,
    unlock_height: Option<u32>,
) -> CliResult<()> {
    let plugin_data = plugin_data(unlock_height);
    if let Some(address) = address {
        state.kit.validate_address(address, &plugin_data)?;
    }

    let mut request = state.kit.send_request(address.unwrap_or(""), amount, fee_rate);
    request.plugin_data = plugin_data.clone();
    let info = state.kit.send_info(&request)?;

    println!("🧾 Fee estimate at {} sat/vbyte", fee_rate);
    println!("   ├─ Fee: {} sat", info.fee);
    println!("   ├─ Inputs: {}", info.spent_outputs.len());
    match (info.change_value, info.change_address) {
        (Some(value), Some(change)) => println!("   ├─ Change: {} sat to {}", value, change),
        (Some(value), None) => println!("   ├─ Change: {} sat", value),
        _ => println!("   ├─ Change: none"),
    }
    println!(
        "   ├─ Maximum spendable: {} sat",
        state.kit.maximum_spendable_value(address, fee_rate, &plugin_data)?
    );
    println!(
        "   └─ Minimum spendable: {} sat",
        state.kit.minimum_spendable_value(address, &plugin_data, None)?
    );

    Ok(())
}

/// Build, sign and broadcast a payment
pub async fn cmd_send(
    state: &WalletState,
    address: &str,
    amount: u64,
    fee_rate: u64,
    unlock_height: Option<u32>,
    timeout: u64,
) -> CliResult<()> {
    let plugin_data = plugin_data(unlock_height);
    state.kit.validate_address(address, &plugin_data)?;

    let mut request = state.kit.send_request(address, amount, fee_rate);
    request.plugin_data = plugin_data;

    println!("📤 Sending {} sat to {}", amount, address);
    state.kit.start()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let result = loop {
        match state.kit.send(&request) {
            Err(KitError::Creator(CreatorError::PeerGroup(PeerGroupError::PeersNotSynced)))
                if tokio::time::Instant::now() < deadline =>
            {
                log::debug!("Waiting for synced peers");
                tokio::time::sleep(SEND_POLL_INTERVAL).await;
            }
            other => break other,
        }
    };

    match result {
        Ok(transaction) => {
            println!("✅ Transaction created!");
            println!("   ├─ Hash: {}", transaction.header.hash_hex());
            println!("   └─ Size: {} vbytes", transaction.virtual_size());

            // give the peer group a moment to relay it
            tokio::time::sleep(SEND_POLL_INTERVAL * 5).await;
            state.kit.stop().await;
            Ok(())
        }
        Err(e) => {
            state.kit.stop().await;
            Err(e.into())
        }
    }
}

/// List stored transactions, newest first
pub fn cmd_transactions(
    state: &WalletState,
    filter: Option<TransactionFilterType>,
    limit: usize,
) -> CliResult<()> {
    let transactions = state.kit.transactions(None, filter, Some(limit));

    if transactions.is_empty() {
        println!("📭 No transactions found. Sync first with: spv-wallet sync");
        return Ok(());
    }

    println!("📋 Transactions:");
    for info in &transactions {
        let height = info
            .block
            .as_ref()
            .map(|b| b.height.to_string())
            .unwrap_or_else(|| "pending".to_string());
        println!(
            "   {} {:>+12} sat  {:?}  ({})",
            info.header.hash_hex(),
            net_amount(info),
            info.header.status,
            height
        );
    }

    Ok(())
}
