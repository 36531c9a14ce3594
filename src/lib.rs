//! NFT-gated VPN access gateway.
//!
//! Wallets prove control of an address by signing a challenge, the
//! [`policy::AccessPolicy`] maps on-chain token holdings to a service tier,
//! and the [`session::SessionStore`] binds WireGuard peers from a private
//! address pool to that session. The [`watcher::RevocationWatcher`] follows
//! chain events and tears down access as soon as tokens move away.

pub mod api;
pub mod auth;
pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod policy;
pub mod session;
pub mod tunnel;
pub mod watcher;

pub use api::{router, GatewayState, TunnelProfile};
pub use auth::{AuthError, Authenticator};
pub use client::{ClientError, GatewayClient};
pub use config::ServerSettings;
pub use error::GatewayError;
pub use events::{EventPublisher, GatewayEvent};
pub use policy::{AccessPolicy, Tier, TierDecision, TierRules};
pub use session::{Session, SessionStore, SessionToken};
pub use tunnel::{PeerKey, PeerManager};
pub use watcher::RevocationWatcher;
