//! Server settings, read from environment variables with defaults.

use crate::chain::{Address, ChainContracts, TokenId};
use crate::policy::TierRules;
use crate::session::SessionLifetimes;
use crate::tunnel::{PeerKey, TunnelNetwork};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// delegate.xyz v2, deployed at the same address on every supported chain.
pub const DEFAULT_DELEGATE_REGISTRY: &str = "0x00000000000000447e69651d841bD8D104Bed493";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Wg,
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wg" | "wireguard" => Ok(BackendKind::Wg),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown tunnel backend {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub domain: String,
    pub chain_rpc_url: String,
    pub chain_ws_url: String,
    pub chain_timeout: Duration,
    pub token_contract: Address,
    pub free_tier_token: TokenId,
    pub paid_tier_tokens: Vec<TokenId>,
    pub delegate_registry: Option<Address>,
    pub community_registry: Option<Address>,
    pub policy_cache_ttl: Duration,
    pub challenge_ttl: Duration,
    pub max_pending_challenges: usize,
    pub session_ttl_free: Duration,
    pub session_ttl_paid: Duration,
    pub sweep_interval: Duration,
    pub rescan_blocks: u64,
    pub recheck_interval: Duration,
    pub tunnel_backend: BackendKind,
    pub tunnel_interface: String,
    pub tunnel_network: TunnelNetwork,
    pub server_public_key: PeerKey,
    pub server_endpoint: String,
    pub client_dns: String,
    pub client_allowed_ips: String,
    pub nats_url: Option<String>,
    pub nats_subject: String,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let chain_rpc_url =
            var("CHAIN_RPC_URL").unwrap_or_else(|| "http://localhost:8545".to_string());
        let chain_ws_url = var("CHAIN_WS_URL").unwrap_or_else(|| derive_ws_url(&chain_rpc_url));

        Ok(Self {
            port: parse_or(&var, "PORT", 8080)?,
            domain: var("GATEWAY_DOMAIN").unwrap_or_else(|| "localhost".to_string()),
            chain_rpc_url,
            chain_ws_url,
            chain_timeout: seconds_or(&var, "CHAIN_TIMEOUT_SECS", 10)?,
            token_contract: required(&var, "TOKEN_CONTRACT")?,
            free_tier_token: parse_or(&var, "FREE_TIER_TOKEN_ID", TokenId::from(0u64))?,
            paid_tier_tokens: match var("PAID_TIER_TOKEN_IDS") {
                Some(list) => parse_list("PAID_TIER_TOKEN_IDS", &list)?,
                None => vec![TokenId::from(1u64)],
            },
            delegate_registry: match var("DELEGATE_REGISTRY") {
                Some(v) if v.eq_ignore_ascii_case("none") => None,
                Some(v) => Some(parse("DELEGATE_REGISTRY", &v)?),
                None => Some(parse("DELEGATE_REGISTRY", DEFAULT_DELEGATE_REGISTRY)?),
            },
            community_registry: optional(&var, "COMMUNITY_REGISTRY")?,
            policy_cache_ttl: seconds_or(&var, "POLICY_CACHE_TTL_SECS", 6)?,
            challenge_ttl: positive_seconds_or(&var, "CHALLENGE_TTL_SECS", 300)?,
            max_pending_challenges: parse_or(&var, "MAX_PENDING_CHALLENGES", 5)?,
            session_ttl_free: positive_seconds_or(&var, "SESSION_TTL_FREE_SECS", 3600)?,
            session_ttl_paid: positive_seconds_or(&var, "SESSION_TTL_PAID_SECS", 86400)?,
            sweep_interval: positive_seconds_or(&var, "SWEEP_INTERVAL_SECS", 30)?,
            rescan_blocks: parse_or(&var, "RESCAN_BLOCKS", 64)?,
            recheck_interval: seconds_or(&var, "RECHECK_INTERVAL_SECS", 600)?,
            tunnel_backend: parse_or(&var, "TUNNEL_BACKEND", BackendKind::Wg)?,
            tunnel_interface: var("TUNNEL_INTERFACE").unwrap_or_else(|| "wg0".to_string()),
            tunnel_network: parse_or(
                &var,
                "TUNNEL_NETWORK",
                parse("TUNNEL_NETWORK", "10.8.0.0/24")?,
            )?,
            server_public_key: required(&var, "SERVER_PUBLIC_KEY")?,
            server_endpoint: var("SERVER_ENDPOINT").ok_or(ConfigError::Missing("SERVER_ENDPOINT"))?,
            client_dns: var("CLIENT_DNS").unwrap_or_else(|| "1.1.1.1".to_string()),
            client_allowed_ips: var("CLIENT_ALLOWED_IPS").unwrap_or_else(|| "0.0.0.0/0".to_string()),
            nats_url: var("NATS_URL"),
            nats_subject: var("NATS_SUBJECT").unwrap_or_else(|| "gateway.events".to_string()),
        })
    }

    pub fn contracts(&self) -> ChainContracts {
        ChainContracts {
            token: self.token_contract,
            delegate_registry: self.delegate_registry,
            community_registry: self.community_registry,
        }
    }

    pub fn tier_rules(&self) -> TierRules {
        TierRules {
            free_tier: self.free_tier_token,
            paid_tier: self.paid_tier_tokens.clone(),
        }
    }

    pub fn session_lifetimes(&self) -> SessionLifetimes {
        SessionLifetimes {
            free: self.session_ttl_free,
            paid: self.session_ttl_paid,
        }
    }
}

/// `http(s)://` becomes `ws(s)://`; anything else is used as is.
fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        rpc_url.to_string()
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn parse_or<T, V>(var: &V, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => parse(name, &value),
        None => Ok(default),
    }
}

fn required<T, V>(var: &V, name: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    let value = var(name).ok_or(ConfigError::Missing(name))?;
    parse(name, &value)
}

fn optional<T, V>(var: &V, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(name).map(|value| parse(name, &value)).transpose()
}

fn parse_list<T>(name: &'static str, list: &str) -> Result<Vec<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse(name, item))
        .collect()
}

fn seconds_or<V>(var: &V, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    parse_or(var, name, default).map(Duration::from_secs)
}

fn positive_seconds_or<V>(
    var: &V,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    let duration = seconds_or(var, name, default)?;
    if duration.is_zero() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}
