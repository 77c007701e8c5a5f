//! podkit CLI: talk to a pod network node from the terminal.
//!
//! # Commands
//! ```text
//! podkit wait-tx   --hash <0x..> [--timeout-ms <ms>] [--no-attestation] [--push]
//! podkit gas-price
//! podkit watch     <orderbook|bids|auction-bids|receipts> [--id <..>]... [--depth <n>] [--count <n>]
//! podkit config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use podkit_core::policy::PollingOverrides;
use podkit_core::telemetry::init_tracing;
use podkit_core::{PodRpc, Receipt, SdkConfig, TxHash};
use podkit_http::HttpRpcClient;
use podkit_tx::{GasPriceConfig, GasPriceManager, GasPriceStrategy, PendingTransaction, TxError, TxOutcome};
use podkit_ws::{Decode, StreamEvent, SubscriptionStream, WsClient, WsConfig};
use serde_json::json;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "podkit",
    about = "Client toolkit for the pod network",
    long_about = "
podkit: wait for transaction receipts, read gas prices and watch live
orderbook, bid and receipt streams on a pod network node.

ENVIRONMENT VARIABLES:
  PODKIT_RPC_URL    JSON-RPC endpoint (overrides the config file)
  PODKIT_WS_URL     WebSocket endpoint (overrides the config file)
  PODKIT_LOG        Log level or filter directives
",
    version
)]
struct Cli {
    /// YAML config file; defaults to the public dev network
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until a submitted transaction is confirmed, reverted or timed out
    WaitTx {
        /// Transaction hash (0x-prefixed, 32 bytes)
        #[arg(long)]
        hash: String,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Accept receipts that carry no validator signatures
        #[arg(long)]
        no_attestation: bool,
        /// Also listen for the receipt on the WebSocket receipts channel
        #[arg(long)]
        push: bool,
    },
    /// Print the current gas price
    GasPrice,
    /// Stream events from a subscription channel until interrupted
    Watch {
        #[arg(value_enum)]
        channel: WatchChannel,
        /// CLOB ids (orderbook, bids), auction id (auction-bids) or account (receipts)
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Orderbook levels per side
        #[arg(long)]
        depth: Option<u32>,
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Print the resolved configuration as YAML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WatchChannel {
    Orderbook,
    Bids,
    AuctionBids,
    Receipts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log).context("failed to install log subscriber")?;
    debug!(rpc_url = %config.network.rpc_url, ws_url = %config.network.ws_url, "config loaded");

    match cli.command {
        Commands::WaitTx {
            hash,
            timeout_ms,
            no_attestation,
            push,
        } => cmd_wait_tx(&config, &hash, timeout_ms, !no_attestation, push).await,
        Commands::GasPrice => cmd_gas_price(&config).await,
        Commands::Watch {
            channel,
            ids,
            depth,
            count,
        } => cmd_watch(&config, channel, ids, depth, count).await,
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(cli: &Cli) -> Result<SdkConfig> {
    let config = match &cli.config {
        Some(path) => SdkConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SdkConfig::dev(),
    };
    let mut config = config.with_env_overrides();
    if cli.verbose {
        config.log.level = "debug".into();
    }
    if cli.json_logs {
        config.log.json = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_wait_tx(
    config: &SdkConfig,
    hash: &str,
    timeout_ms: Option<u64>,
    require_attestation: bool,
    push: bool,
) -> Result<()> {
    let hash: TxHash = hash
        .parse()
        .with_context(|| format!("invalid transaction hash {hash:?}"))?;
    let polling = match timeout_ms {
        Some(ms) => config
            .polling
            .merged(PollingOverrides {
                timeout_ms: Some(ms),
                ..Default::default()
            })
            .context("invalid --timeout-ms")?,
        None => config.polling,
    };

    let rpc = PodRpc::new(HttpRpcClient::from_sdk(config)?);
    let tx = PendingTransaction::new(hash, Arc::new(rpc))
        .with_config(polling)
        .require_attestation(require_attestation);

    eprintln!("waiting for {hash} (timeout {}ms)", polling.timeout().as_millis());

    let result = if push {
        let ws = WsClient::connect(WsConfig::from_sdk(config));
        let receipts = ws
            .subscribe_receipts(None)
            .await
            .context("failed to subscribe to receipts")?;
        let result = tx
            .wait_for_receipt_racing_until(receipts.receipts(), tokio::signal::ctrl_c())
            .await;
        ws.shutdown().await;
        result
    } else {
        tx.wait_for_receipt_until(tokio::signal::ctrl_c()).await
    };

    match result {
        Ok(TxOutcome::Confirmed(receipt)) => {
            print_json(&receipt_summary(&receipt))?;
            Ok(())
        }
        Ok(TxOutcome::Reverted(receipt)) => {
            print_json(&receipt_summary(&receipt))?;
            bail!("transaction {hash} reverted")
        }
        Err(TxError::Cancelled) => {
            eprintln!("interrupted; {hash} is still pending");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_gas_price(config: &SdkConfig) -> Result<()> {
    let rpc = Arc::new(PodRpc::new(HttpRpcClient::from_sdk(config)?));
    let manager = GasPriceManager::new(
        GasPriceStrategy::from_mode(config.gas.strategy, rpc),
        GasPriceConfig::from(&config.gas),
    );
    let wei = manager.get_price().await?;
    println!("{wei} wei ({} gwei)", format_gwei(wei));
    Ok(())
}

async fn cmd_watch(
    config: &SdkConfig,
    channel: WatchChannel,
    ids: Vec<String>,
    depth: Option<u32>,
    count: Option<usize>,
) -> Result<()> {
    let ws = WsClient::connect(WsConfig::from_sdk(config));
    let result = match channel {
        WatchChannel::Orderbook => {
            if ids.is_empty() {
                bail!("orderbook needs at least one --id");
            }
            let stream = ws.subscribe_orderbook(ids, depth).await?;
            print_events(stream, count, |book| {
                json!({
                    "clob_id": book.clob_id,
                    "best_bid": book.best_bid(),
                    "best_ask": book.best_ask(),
                    "spread": book.spread(),
                    "bids": book.bids.len(),
                    "asks": book.asks.len(),
                    "timestamp": book.timestamp,
                })
            })
            .await
        }
        WatchChannel::Bids => {
            if ids.is_empty() {
                bail!("bids needs at least one --id");
            }
            let stream = ws.subscribe_bids(ids).await?;
            print_events(stream, count, |event| json!(event)).await
        }
        WatchChannel::AuctionBids => {
            let auction_id = single_id(&ids)?
                .map(|id| parse_u256(&id))
                .transpose()?;
            let stream = ws.subscribe_auction_bids(auction_id).await?;
            print_events(stream, count, |event| json!(event)).await
        }
        WatchChannel::Receipts => {
            let account = single_id(&ids)?
                .map(|id| id.parse::<Address>().with_context(|| format!("invalid account {id:?}")))
                .transpose()?;
            let stream = ws.subscribe_receipts(account).await?;
            print_events(stream, count, |event| receipt_summary(&event.0)).await
        }
    };
    ws.shutdown().await;
    result
}

fn cmd_config(config: &SdkConfig) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Print each data event as one JSON line until ctrl-c, `count` events, or
/// the stream closing. Reconnect markers go to stderr.
async fn print_events<T, F>(mut stream: SubscriptionStream<T>, count: Option<usize>, render: F) -> Result<()>
where
    T: Decode,
    F: Fn(&T) -> serde_json::Value,
{
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = stream.next() => match event {
                None => break,
                Some(Err(e)) => return Err(e).context("subscription closed"),
                Some(Ok(StreamEvent::Data(item))) => {
                    print_json(&render(&item))?;
                    seen += 1;
                    if count.is_some_and(|max| seen >= max) {
                        break;
                    }
                }
                Some(Ok(StreamEvent::Disconnected)) => eprintln!("-- disconnected, reconnecting"),
                Some(Ok(StreamEvent::Reconnected)) => eprintln!("-- reconnected"),
            }
        }
    }
    stream.cancel();
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn receipt_summary(receipt: &Receipt) -> serde_json::Value {
    json!({
        "transaction_hash": receipt.transaction_hash,
        "status": if receipt.succeeded() { "confirmed" } else { "reverted" },
        "block_number": receipt.block_number,
        "from": receipt.from,
        "to": receipt.to,
        "contract_address": receipt.contract_address,
        "gas_used": receipt.gas_used.to_string(),
        "total_cost_wei": receipt.total_cost().to_string(),
        "signatures": receipt.signature_count(),
        "committee_epoch": receipt.pod_metadata.committee_epoch(),
    })
}

fn single_id(ids: &[String]) -> Result<Option<String>> {
    match ids {
        [] => Ok(None),
        [id] => Ok(Some(id.clone())),
        _ => bail!("this channel takes at most one --id"),
    }
}

fn parse_u256(s: &str) -> Result<U256> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s, 10),
    };
    parsed.with_context(|| format!("invalid auction id {s:?}"))
}

fn format_gwei(wei: u128) -> String {
    let whole = wei / 1_000_000_000;
    let frac = wei % 1_000_000_000;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:09}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
