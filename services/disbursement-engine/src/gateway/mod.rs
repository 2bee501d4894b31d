//! Settlement Gateway: the external ledger that actually moves value

pub mod rpc;
pub mod simulated;

pub use rpc::JsonRpcGateway;
pub use simulated::SimulatedGateway;

use crate::config::{GatewayConfig, GatewayMode};
use async_trait::async_trait;
use ledger_core::Settlement;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Settlement rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Proof of a successful release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
}

impl From<Receipt> for Settlement {
    fn from(receipt: Receipt) -> Self {
        Settlement {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
        }
    }
}

/// `FundReleased(address indexed recipient, uint256 amount)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundReleasedEvent {
    pub recipient: String,
    pub amount: Decimal,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<FundReleasedEvent>,
    /// Pass back as `from_checkpoint` to continue after this batch
    pub next_checkpoint: u64,
}

/// A settlement as the external ledger reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub transaction_hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: Decimal,
    pub gas_used: Option<i64>,
    pub block_number: Option<i64>,
    /// `None` until mined
    pub succeeded: Option<bool>,
}

#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Contract balance in ether
    async fn get_balance(&self) -> GatewayResult<Decimal>;

    /// Balance of any account in ether
    async fn get_account_balance(&self, address: &str) -> GatewayResult<Decimal>;

    /// Whether the external ledger answers at all
    async fn is_connected(&self) -> bool;

    /// Release `amount` ether to `recipient`
    async fn release(&self, recipient: &str, amount: Decimal) -> GatewayResult<Receipt>;

    /// `FundReleased` events from block `from_checkpoint` through `to_block`
    /// (the latest block when `None`)
    async fn list_events(
        &self,
        from_checkpoint: u64,
        to_block: Option<u64>,
    ) -> GatewayResult<EventBatch>;

    async fn get_details(&self, transaction_hash: &str) -> GatewayResult<SettlementRecord>;
}

/// Build the gateway selected by configuration
pub fn build_gateway(config: &GatewayConfig) -> Result<Arc<dyn SettlementGateway>, String> {
    match config.mode {
        GatewayMode::Simulated => Ok(Arc::new(SimulatedGateway::new(
            config.latency_ms,
            config.success_rate,
            config.initial_balance()?,
        ))),
        GatewayMode::JsonRpc => {
            let gateway = JsonRpcGateway::new(
                &config.rpc_url,
                &config.contract_address,
                config.from_account.clone(),
                Duration::from_secs(config.request_timeout_seconds),
            )
            .map_err(|e| e.to_string())?;
            Ok(Arc::new(gateway))
        }
    }
}
