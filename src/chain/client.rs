//! JSON-RPC chain client.
//!
//! Reads ERC-1155 balances and delegation registries with `eth_call`,
//! re-scans history with `eth_getLogs`, and follows new events through an
//! `eth_subscribe("logs")` WebSocket subscription.

use crate::chain::abi;
use crate::chain::error::ChainError;
use crate::chain::reader::{ChainEventSource, ChainReader, EventStream};
use crate::chain::types::{Address, ChainEvent, TokenId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const BALANCE_OF: &str = "balanceOf(address,uint256)";
const GET_INCOMING_DELEGATIONS: &str = "getIncomingDelegations(address)";
const GET_DELEGATORS: &str = "getDelegators(address)";

const TRANSFER_SINGLE: &str = "TransferSingle(address,address,address,uint256,uint256)";
const TRANSFER_BATCH: &str = "TransferBatch(address,address,address,uint256[],uint256[])";
const DELEGATE_ALL: &str = "DelegateAll(address,address,bytes32,bool)";
const DELEGATE_CONTRACT: &str = "DelegateContract(address,address,address,bytes32,bool)";
const DELEGATE_ERC721: &str = "DelegateERC721(address,address,address,uint256,bytes32,bool)";
const DELEGATE_ERC1155: &str = "DelegateERC1155(address,address,address,uint256,bytes32,uint256)";
const DELEGATION_CHANGED: &str = "DelegationChanged(address,address,bool)";

/// Delegation types in the general-purpose registry that can carry rights
/// over the access collection.
const DELEGATION_ALL: u8 = 1;
const DELEGATION_CONTRACT: u8 = 2;
const DELEGATION_ERC721: u8 = 3;
const DELEGATION_ERC1155: u8 = 5;

/// Words in one `Delegation` tuple returned by `getIncomingDelegations`.
const DELEGATION_TUPLE_WORDS: usize = 7;

/// Contracts the gateway reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainContracts {
    /// ERC-1155 access-token collection.
    pub token: Address,

    /// General-purpose delegation registry.
    pub delegate_registry: Option<Address>,

    /// Community-specific delegation registry.
    pub community_registry: Option<Address>,
}

impl ChainContracts {
    fn watched(&self) -> Vec<Address> {
        let mut out = vec![self.token];
        out.extend(self.delegate_registry);
        out.extend(self.community_registry);
        out
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A log entry as returned by `eth_getLogs` and log subscriptions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionNotification {
    params: Option<SubscriptionParams>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    result: RpcLog,
}

/// Chain client over Ethereum JSON-RPC.
pub struct RpcChainClient {
    rpc_url: String,
    ws_url: String,
    http: reqwest::Client,
    contracts: ChainContracts,
    next_id: AtomicU64,

    /// Last head seen, for diagnostics.
    last_known_block: AtomicU64,
}

impl RpcChainClient {
    /// Create a new client. No connection is made until the first query.
    pub fn new(
        rpc_url: String,
        ws_url: String,
        contracts: ChainContracts,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::ConnectionFailed {
                url: rpc_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            rpc_url,
            ws_url,
            http,
            contracts,
            next_id: AtomicU64::new(1),
            last_known_block: AtomicU64::new(0),
        })
    }

    pub fn contracts(&self) -> &ChainContracts {
        &self.contracts
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout
                } else if e.is_connect() {
                    ChainError::ConnectionFailed {
                        url: self.rpc_url.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    ChainError::RpcError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::RpcError(format!("HTTP error: {}", status)));
        }

        let body: JsonRpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(ChainError::RpcResponse {
                code: error.code,
                message: error.message,
            });
        }
        body.result
            .ok_or_else(|| ChainError::DecodeError(format!("{} returned no result", method)))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ChainError> {
        let params = serde_json::json!([
            { "to": to.to_string(), "data": abi::encode_hex(&data) },
            "latest"
        ]);
        let result: String = self.rpc("eth_call", params).await?;
        abi::decode_hex(&result)
    }

    async fn incoming_delegations(
        &self,
        registry: Address,
        wallet: Address,
    ) -> Result<Vec<Address>, ChainError> {
        let data = abi::encode_call(GET_INCOMING_DELEGATIONS, &[wallet.to_word()]);
        let result = self.eth_call(registry, data).await?;
        decode_incoming_delegations(&result, self.contracts.token)
    }

    async fn community_delegators(
        &self,
        registry: Address,
        wallet: Address,
    ) -> Result<Vec<Address>, ChainError> {
        let data = abi::encode_call(GET_DELEGATORS, &[wallet.to_word()]);
        let result = self.eth_call(registry, data).await?;
        decode_address_array(&result)
    }

    fn log_filter(&self) -> serde_json::Value {
        let addresses: Vec<String> = self
            .contracts
            .watched()
            .iter()
            .map(|a| a.to_string())
            .collect();
        serde_json::json!({ "address": addresses })
    }
}

#[async_trait]
impl ChainReader for RpcChainClient {
    async fn check_ownership(
        &self,
        wallet: Address,
        token_ids: &[TokenId],
    ) -> Result<bool, ChainError> {
        for id in token_ids {
            let data = abi::encode_call(BALANCE_OF, &[wallet.to_word(), id.to_word()]);
            let result = self.eth_call(self.contracts.token, data).await?;
            let balance = abi::word(&result, 0)?;
            if abi::is_nonzero(&balance) {
                debug!("{} holds token {}", wallet, id);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn resolve_delegations(&self, wallet: Address) -> Result<Vec<Address>, ChainError> {
        let mut delegators = Vec::new();
        if let Some(registry) = self.contracts.delegate_registry {
            delegators.extend(self.incoming_delegations(registry, wallet).await?);
        }
        if let Some(registry) = self.contracts.community_registry {
            delegators.extend(self.community_delegators(registry, wallet).await?);
        }
        Ok(dedup_delegators(delegators, wallet))
    }
}

#[async_trait]
impl ChainEventSource for RpcChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let result: String = self.rpc("eth_blockNumber", serde_json::json!([])).await?;
        let block = abi::decode_quantity(&result)?;
        self.last_known_block.store(block, Ordering::Relaxed);
        Ok(block)
    }

    async fn events_between(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let mut filter = self.log_filter();
        filter["fromBlock"] = serde_json::json!(abi::encode_quantity(from_block));
        filter["toBlock"] = serde_json::json!(abi::encode_quantity(to_block));

        let logs: Vec<RpcLog> = self.rpc("eth_getLogs", serde_json::json!([filter])).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Skipping undecodable log from {}: {}", log.address, e),
            }
        }
        Ok(events)
    }

    async fn subscribe(&self) -> Result<EventStream, ChainError> {
        info!("Subscribing to chain logs at {}", self.ws_url);

        let (mut ws, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ChainError::ConnectionFailed {
                url: self.ws_url.clone(),
                reason: e.to_string(),
            })?;

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: "eth_subscribe",
            params: serde_json::json!(["logs", self.log_filter()]),
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| ChainError::RpcError(e.to_string()))?;
        ws.send(Message::Text(payload)).await?;

        // The first text frame answers the subscribe call.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: JsonRpcResponse<String> = serde_json::from_str(&text)
                        .map_err(|e| ChainError::DecodeError(e.to_string()))?;
                    if let Some(error) = reply.error {
                        return Err(ChainError::RpcResponse {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    let id = reply.result.unwrap_or_default();
                    info!("Log subscription {} established", id);
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ChainError::SubscriptionClosed(
                        "closed before subscription was confirmed".to_string(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let stream = futures_util::stream::unfold(Some(ws), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match decode_notification(&text) {
                        Ok(Some(event)) => return Some((Ok(event), Some(ws))),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Skipping undecodable notification: {}", e);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Some((
                            Err(ChainError::SubscriptionClosed("closed by node".to_string())),
                            None,
                        ))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(e.into()), None)),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("contracts", &self.contracts)
            .field(
                "last_known_block",
                &self.last_known_block.load(Ordering::Relaxed),
            )
            .finish()
    }
}

fn dedup_delegators(delegators: Vec<Address>, wallet: Address) -> Vec<Address> {
    let mut out: Vec<Address> = Vec::with_capacity(delegators.len());
    for delegator in delegators {
        if delegator != wallet && !delegator.is_zero() && !out.contains(&delegator) {
            out.push(delegator);
        }
    }
    out
}

/// Decode `getIncomingDelegations` output, keeping delegators whose grant
/// covers `token`.
fn decode_incoming_delegations(data: &[u8], token: Address) -> Result<Vec<Address>, ChainError> {
    let mut out = Vec::new();
    for tuple in abi::dynamic_array(data, 0, DELEGATION_TUPLE_WORDS)? {
        let kind_word = abi::word(tuple, 0)?;
        if kind_word[..31].iter().any(|b| *b != 0) {
            return Err(ChainError::DecodeError("delegation type out of range".to_string()));
        }
        let from = Address::from_word(&abi::word(tuple, 2)?);
        let contract = Address::from_word(&abi::word(tuple, 4)?);
        let relevant = match kind_word[31] {
            DELEGATION_ALL => true,
            DELEGATION_CONTRACT | DELEGATION_ERC721 | DELEGATION_ERC1155 => contract == token,
            _ => false,
        };
        if relevant {
            out.push(from);
        }
    }
    Ok(out)
}

fn decode_address_array(data: &[u8]) -> Result<Vec<Address>, ChainError> {
    abi::dynamic_array(data, 0, 1)?
        .into_iter()
        .map(|item| {
            let mut word = [0u8; 32];
            word.copy_from_slice(item);
            Ok(Address::from_word(&word))
        })
        .collect()
}

fn topic_address(log: &RpcLog, index: usize) -> Result<Address, ChainError> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| ChainError::DecodeError(format!("missing topic {}", index)))?;
    let bytes = abi::decode_hex(topic)?;
    let word: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::DecodeError("topic is not 32 bytes".to_string()))?;
    Ok(Address::from_word(&word))
}

/// Decode a raw log into a gateway event. Unrelated logs decode to `None`.
pub fn decode_log(log: &RpcLog) -> Result<Option<ChainEvent>, ChainError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let topic0 = abi::decode_hex(topic0)?;
    let block_number = match &log.block_number {
        Some(n) => abi::decode_quantity(n)?,
        None => 0,
    };
    let data = abi::decode_hex(&log.data)?;

    if topic0 == abi::event_topic(TRANSFER_SINGLE) {
        let from = topic_address(log, 2)?;
        let to = topic_address(log, 3)?;
        let id = TokenId::from_word(&abi::word(&data, 0)?);
        return Ok(Some(ChainEvent::transfer(block_number, from, to, vec![id])));
    }

    if topic0 == abi::event_topic(TRANSFER_BATCH) {
        let from = topic_address(log, 2)?;
        let to = topic_address(log, 3)?;
        let ids = abi::dynamic_array(&data, 0, 1)?
            .into_iter()
            .map(|item| {
                let mut word = [0u8; 32];
                word.copy_from_slice(item);
                TokenId::from_word(&word)
            })
            .collect();
        return Ok(Some(ChainEvent::transfer(block_number, from, to, ids)));
    }

    let delegation_topics = [
        DELEGATE_ALL,
        DELEGATE_CONTRACT,
        DELEGATE_ERC721,
        DELEGATE_ERC1155,
        DELEGATION_CHANGED,
    ];
    if delegation_topics
        .iter()
        .any(|sig| topic0 == abi::event_topic(sig))
    {
        let delegator = topic_address(log, 1)?;
        let delegate = topic_address(log, 2)?;
        return Ok(Some(ChainEvent::delegation(block_number, delegator, delegate)));
    }

    Ok(None)
}

fn decode_notification(text: &str) -> Result<Option<ChainEvent>, ChainError> {
    let notification: SubscriptionNotification =
        serde_json::from_str(text).map_err(|e| ChainError::DecodeError(e.to_string()))?;
    match notification.params {
        Some(params) => decode_log(&params.result),
        None => Ok(None),
    }
}
