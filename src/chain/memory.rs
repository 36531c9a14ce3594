//! In-memory chain for tests and offline development.
//!
//! Holds balances and delegations, records every mutation as a
//! [`ChainEvent`] in a block-numbered log, and fans events out to live
//! subscribers. Availability can be switched off to simulate an RPC outage.

use crate::chain::error::ChainError;
use crate::chain::reader::{ChainEventSource, ChainReader, EventStream};
use crate::chain::types::{Address, ChainEvent, TokenId};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

type Subscriber = mpsc::UnboundedSender<Result<ChainEvent, ChainError>>;

#[derive(Default)]
struct MemoryState {
    balances: HashMap<(Address, TokenId), u64>,
    /// delegate -> delegators
    delegations: HashMap<Address, BTreeSet<Address>>,
    unavailable: bool,
    block: u64,
    log: Vec<ChainEvent>,
    subscribers: Vec<Subscriber>,
}

/// A chain snapshot that lives in process memory.
#[derive(Default)]
pub struct MemoryChain {
    state: Mutex<MemoryState>,
    reads: AtomicU64,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(state: &mut MemoryState, build: impl FnOnce(u64) -> ChainEvent) -> ChainEvent {
        state.block += 1;
        let event = build(state.block);
        state.log.push(event.clone());
        state
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
        event
    }

    /// Credit one unit of `id` to `to`, emitting a mint transfer.
    pub fn mint(&self, to: Address, id: TokenId) -> ChainEvent {
        let mut state = self.lock();
        *state.balances.entry((to, id)).or_default() += 1;
        Self::record(&mut state, |block| {
            ChainEvent::transfer(block, Address::ZERO, to, vec![id])
        })
    }

    /// Move one unit of `id` from `from` to `to`. Moving a token the sender
    /// does not hold is a no-op apart from the emitted event.
    pub fn transfer(&self, from: Address, to: Address, id: TokenId) -> ChainEvent {
        let mut state = self.lock();
        let moved = match state.balances.get_mut(&(from, id)) {
            Some(balance) if *balance > 0 => {
                *balance -= 1;
                true
            }
            _ => false,
        };
        if moved && !to.is_zero() {
            *state.balances.entry((to, id)).or_default() += 1;
        }
        Self::record(&mut state, |block| ChainEvent::transfer(block, from, to, vec![id]))
    }

    pub fn delegate(&self, delegator: Address, delegate: Address) -> ChainEvent {
        let mut state = self.lock();
        state
            .delegations
            .entry(delegate)
            .or_default()
            .insert(delegator);
        Self::record(&mut state, |block| {
            ChainEvent::delegation(block, delegator, delegate)
        })
    }

    pub fn revoke_delegation(&self, delegator: Address, delegate: Address) -> ChainEvent {
        let mut state = self.lock();
        if let Some(set) = state.delegations.get_mut(&delegate) {
            set.remove(&delegator);
        }
        Self::record(&mut state, |block| {
            ChainEvent::delegation(block, delegator, delegate)
        })
    }

    /// Simulate an RPC outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Terminate every live subscription with an error, as a dropped
    /// WebSocket would.
    pub fn drop_subscriptions(&self) {
        let mut state = self.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(Err(ChainError::SubscriptionClosed(
                "connection reset".to_string(),
            )));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    pub fn block_number(&self) -> u64 {
        self.lock().block
    }

    /// Number of ownership and delegation reads served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn ensure_available(&self, state: &MemoryState) -> Result<(), ChainError> {
        if state.unavailable {
            Err(ChainError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn check_ownership(
        &self,
        wallet: Address,
        token_ids: &[TokenId],
    ) -> Result<bool, ChainError> {
        let state = self.lock();
        self.ensure_available(&state)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(token_ids.iter().any(|id| {
            state
                .balances
                .get(&(wallet, *id))
                .map(|b| *b > 0)
                .unwrap_or(false)
        }))
    }

    async fn resolve_delegations(&self, wallet: Address) -> Result<Vec<Address>, ChainError> {
        let state = self.lock();
        self.ensure_available(&state)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(state
            .delegations
            .get(&wallet)
            .map(|set| set.iter().copied().filter(|d| *d != wallet).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChainEventSource for MemoryChain {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let state = self.lock();
        self.ensure_available(&state)?;
        Ok(state.block)
    }

    async fn events_between(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let state = self.lock();
        self.ensure_available(&state)?;
        Ok(state
            .log
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn subscribe(&self) -> Result<EventStream, ChainError> {
        let mut state = self.lock();
        self.ensure_available(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}
