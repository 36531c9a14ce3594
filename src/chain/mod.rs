//! Chain Reader.
//!
//! Read-only access to the on-chain state that decides who may use the
//! tunnel: ERC-1155 access-token balances, delegation registries, and the
//! transfer/delegation events the revocation watcher follows.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   eth_call / eth_getLogs   ┌──────────────┐
//! │ RpcChainClient│───────────────────────────▶│  JSON-RPC    │
//! │  (reqwest +   │   eth_subscribe("logs")    │    node      │
//! │  tungstenite) │───────────────────────────▶│              │
//! └──────┬────────┘                            └──────────────┘
//!        │ implements
//!        ▼
//! ┌───────────────┐      ┌──────────────────┐
//! │  ChainReader  │      │ ChainEventSource │
//! │   (trait)     │      │     (trait)      │
//! └──────┬────────┘      └────────┬─────────┘
//!        ▼                        ▼
//!   AccessPolicy           RevocationWatcher
//! ```
//!
//! [`MemoryChain`] implements both traits in process memory.

pub mod abi;
pub mod client;
pub mod error;
pub mod memory;
pub mod reader;
pub mod types;

pub use client::{ChainContracts, RpcChainClient};
pub use error::ChainError;
pub use memory::MemoryChain;
pub use reader::{ChainEventSource, ChainReader, EventStream};
pub use types::{Address, ChainEvent, ChainEventKind, ParseError, TokenId};
