//! Ethereum JSON-RPC client for the disbursement contract
//!
//! Transactions are sent with `eth_sendTransaction` from an account the node
//! holds unlocked (a development chain such as Ganache); nothing is signed
//! locally.

use super::{
    EventBatch, FundReleasedEvent, GatewayError, GatewayResult, Receipt, SettlementGateway,
    SettlementRecord,
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RELEASE_FUNDS_SIGNATURE: &str = "releaseFunds(address,uint256)";
pub const FUND_RELEASED_SIGNATURE: &str = "FundReleased(address,uint256)";
pub const RELEASE_GAS_LIMIT: u64 = 200_000;

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

pub struct JsonRpcGateway {
    client: reqwest::Client,
    url: String,
    contract_address: String,
    from_account: Option<String>,
    next_id: AtomicU64,
}

impl JsonRpcGateway {
    pub fn new(
        url: &str,
        contract_address: &str,
        from_account: Option<String>,
        request_timeout: Duration,
    ) -> GatewayResult<Self> {
        parse_address(contract_address)?;
        if let Some(account) = &from_account {
            parse_address(account)?;
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Protocol(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            contract_address: contract_address.to_lowercase(),
            from_account: from_account.map(|a| a.to_lowercase()),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RPC {} -> {}", method, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("{} failed: {}", method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Unavailable(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let reply: RpcResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("{} reply is not JSON-RPC: {}", method, e)))?;

        if let Some(err) = reply.error {
            return Err(GatewayError::Rejected(format!(
                "{}: {} (code {})",
                method, err.message, err.code
            )));
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }

    async fn sender(&self) -> GatewayResult<String> {
        if let Some(account) = &self.from_account {
            return Ok(account.clone());
        }

        let accounts = self.call("eth_accounts", json!([])).await?;
        accounts
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .ok_or_else(|| GatewayError::Protocol("Node exposes no unlocked accounts".to_string()))
    }

    async fn receipt(&self, transaction_hash: &str) -> GatewayResult<Option<Value>> {
        let receipt = self
            .call("eth_getTransactionReceipt", json!([transaction_hash]))
            .await?;
        Ok(if receipt.is_null() { None } else { Some(receipt) })
    }
}

#[async_trait]
impl SettlementGateway for JsonRpcGateway {
    async fn get_balance(&self) -> GatewayResult<Decimal> {
        self.get_account_balance(&self.contract_address).await
    }

    async fn get_account_balance(&self, address: &str) -> GatewayResult<Decimal> {
        parse_address(address)?;
        let balance = self
            .call("eth_getBalance", json!([address.to_lowercase(), "latest"]))
            .await?;
        wei_to_ether(parse_quantity(&balance)?)
    }

    async fn is_connected(&self) -> bool {
        match self.call("web3_clientVersion", json!([])).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Node connectivity check failed: {}", e);
                false
            }
        }
    }

    async fn release(&self, recipient: &str, amount: Decimal) -> GatewayResult<Receipt> {
        let data = encode_release_call(recipient, ether_to_wei(amount)?)?;
        let from = self.sender().await?;

        info!("Sending releaseFunds({}, {}) from {}", recipient, amount, from);
        let hash = self
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": from,
                    "to": self.contract_address,
                    "gas": format!("0x{:x}", RELEASE_GAS_LIMIT),
                    "data": data,
                }]),
            )
            .await?;
        let transaction_hash = hash
            .as_str()
            .ok_or_else(|| GatewayError::Protocol("eth_sendTransaction returned no hash".to_string()))?
            .to_string();

        let Some(receipt) = self.receipt(&transaction_hash).await? else {
            // Not mined yet; the hash is still the receipt
            return Ok(Receipt {
                transaction_hash,
                block_number: None,
                gas_used: None,
            });
        };

        if receipt_status(&receipt)? == Some(false) {
            warn!("releaseFunds reverted in {}", transaction_hash);
            return Err(GatewayError::Rejected(format!(
                "releaseFunds reverted in {}",
                transaction_hash
            )));
        }

        Ok(Receipt {
            block_number: optional_i64(&receipt["blockNumber"])?,
            gas_used: optional_i64(&receipt["gasUsed"])?,
            transaction_hash,
        })
    }

    async fn list_events(
        &self,
        from_checkpoint: u64,
        to_block: Option<u64>,
    ) -> GatewayResult<EventBatch> {
        let to_block = to_block
            .map(|b| format!("0x{:x}", b))
            .unwrap_or_else(|| "latest".to_string());
        let logs = self
            .call(
                "eth_getLogs",
                json!([{
                    "fromBlock": format!("0x{:x}", from_checkpoint),
                    "toBlock": to_block,
                    "address": self.contract_address,
                    "topics": [event_topic()],
                }]),
            )
            .await?;

        let logs = logs
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("eth_getLogs did not return a list".to_string()))?;

        let events = logs
            .iter()
            .map(decode_fund_released)
            .collect::<GatewayResult<Vec<_>>>()?;
        let next_checkpoint = events
            .iter()
            .map(|e| e.block_number + 1)
            .max()
            .unwrap_or(from_checkpoint);

        Ok(EventBatch {
            events,
            next_checkpoint,
        })
    }

    async fn get_details(&self, transaction_hash: &str) -> GatewayResult<SettlementRecord> {
        let tx = self
            .call("eth_getTransactionByHash", json!([transaction_hash]))
            .await?;
        if tx.is_null() {
            return Err(GatewayError::NotFound(format!("Transaction {}", transaction_hash)));
        }

        let receipt = self.receipt(transaction_hash).await?;
        let (gas_used, succeeded) = match &receipt {
            Some(r) => (optional_i64(&r["gasUsed"])?, receipt_status(r)?),
            None => (None, None),
        };

        Ok(SettlementRecord {
            transaction_hash: transaction_hash.to_lowercase(),
            from: tx["from"].as_str().unwrap_or_default().to_lowercase(),
            to: tx["to"].as_str().map(str::to_lowercase),
            value: wei_to_ether(parse_quantity(&tx["value"])?)?,
            gas_used,
            block_number: optional_i64(&tx["blockNumber"])?,
            succeeded,
        })
    }
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// topic0 of `FundReleased`
pub fn event_topic() -> String {
    format!("0x{}", hex::encode(keccak256(FUND_RELEASED_SIGNATURE.as_bytes())))
}

/// ABI-encode `releaseFunds(recipient, amount_wei)`
pub fn encode_release_call(recipient: &str, amount_wei: u128) -> GatewayResult<String> {
    let address = parse_address(recipient)?;

    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&keccak256(RELEASE_FUNDS_SIGNATURE.as_bytes())[..4]);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&address);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&amount_wei.to_be_bytes());

    Ok(format!("0x{}", hex::encode(data)))
}

fn parse_address(address: &str) -> GatewayResult<[u8; 20]> {
    let digits = address
        .strip_prefix("0x")
        .ok_or_else(|| GatewayError::Rejected(format!("Address {} lacks 0x prefix", address)))?;
    let bytes = hex::decode(digits)
        .map_err(|_| GatewayError::Rejected(format!("Address {} is not hex", address)))?;
    bytes
        .try_into()
        .map_err(|_| GatewayError::Rejected(format!("Address {} is not 20 bytes", address)))
}

pub fn ether_to_wei(amount: Decimal) -> GatewayResult<u128> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::Rejected(format!("Amount {} is not positive", amount)));
    }
    let wei = amount
        .checked_mul(Decimal::from(WEI_PER_ETHER))
        .ok_or_else(|| GatewayError::Rejected(format!("Amount {} is too large", amount)))?;
    if !wei.fract().is_zero() {
        return Err(GatewayError::Rejected(format!(
            "Amount {} is finer than one wei",
            amount
        )));
    }
    wei.to_u128()
        .ok_or_else(|| GatewayError::Rejected(format!("Amount {} is too large", amount)))
}

pub fn wei_to_ether(wei: u128) -> GatewayResult<Decimal> {
    let wei = i128::try_from(wei)
        .map_err(|_| GatewayError::Protocol(format!("Wei value {} out of range", wei)))?;
    Decimal::try_from_i128_with_scale(wei, 18)
        .map(|d| d.normalize())
        .map_err(|_| GatewayError::Protocol(format!("Wei value {} out of range", wei)))
}

/// Hex `QUANTITY` as used throughout the JSON-RPC API
fn parse_quantity(value: &Value) -> GatewayResult<u128> {
    let s = value
        .as_str()
        .ok_or_else(|| GatewayError::Protocol(format!("Expected hex quantity, got {}", value)))?;
    parse_hex_u128(s.strip_prefix("0x").unwrap_or(s))
}

fn parse_hex_u128(digits: &str) -> GatewayResult<u128> {
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        return Err(GatewayError::Protocol(format!(
            "Quantity 0x{} overflows 128 bits",
            digits
        )));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| GatewayError::Protocol(format!("Invalid hex quantity 0x{}", digits)))
}

fn optional_i64(value: &Value) -> GatewayResult<Option<i64>> {
    if value.is_null() {
        return Ok(None);
    }
    let n = parse_quantity(value)?;
    i64::try_from(n)
        .map(Some)
        .map_err(|_| GatewayError::Protocol(format!("Quantity {} out of range", n)))
}

fn receipt_status(receipt: &Value) -> GatewayResult<Option<bool>> {
    if receipt["status"].is_null() {
        return Ok(None);
    }
    Ok(Some(parse_quantity(&receipt["status"])? == 1))
}

fn decode_fund_released(log: &Value) -> GatewayResult<FundReleasedEvent> {
    let recipient_topic = log["topics"]
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("FundReleased log lacks recipient topic".to_string()))?;
    if recipient_topic.len() < 40 {
        return Err(GatewayError::Protocol(format!(
            "Recipient topic {} is too short",
            recipient_topic
        )));
    }
    let recipient = format!(
        "0x{}",
        recipient_topic[recipient_topic.len() - 40..].to_lowercase()
    );

    let data = log["data"]
        .as_str()
        .ok_or_else(|| GatewayError::Protocol("FundReleased log lacks data".to_string()))?;
    let amount_wei = parse_hex_u128(data.strip_prefix("0x").unwrap_or(data))?;

    let block_number = parse_quantity(&log["blockNumber"])?;
    let block_number = u64::try_from(block_number)
        .map_err(|_| GatewayError::Protocol(format!("Block {} out of range", block_number)))?;

    Ok(FundReleasedEvent {
        recipient,
        amount: wei_to_ether(amount_wei)?,
        transaction_hash: log["transactionHash"]
            .as_str()
            .unwrap_or_default()
            .to_lowercase(),
        block_number,
    })
}
