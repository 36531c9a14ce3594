//! Read-only views of on-chain access state.
//!
//! These traits are the only way the rest of the gateway touches the chain,
//! which keeps the policy and watcher logic testable against
//! [`MemoryChain`](crate::chain::MemoryChain).

use crate::chain::error::ChainError;
use crate::chain::types::{Address, ChainEvent, TokenId};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Live stream of decoded chain events. Ends (or yields an error) when the
/// underlying subscription drops.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChainEvent, ChainError>> + Send>>;

/// Ownership and delegation queries.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Does `wallet` hold a non-zero balance of any of `token_ids`?
    async fn check_ownership(
        &self,
        wallet: Address,
        token_ids: &[TokenId],
    ) -> Result<bool, ChainError>;

    /// Accounts that delegated token rights to `wallet`, merged across all
    /// configured delegation registries. Never contains `wallet` itself.
    async fn resolve_delegations(&self, wallet: Address) -> Result<Vec<Address>, ChainError>;
}

/// Event access for the revocation watcher.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    /// Current head block number.
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Relevant events in `[from_block, to_block]`, in chain order.
    async fn events_between(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError>;

    /// Open a live subscription to relevant events.
    async fn subscribe(&self) -> Result<EventStream, ChainError>;
}
