//! Access Policy Evaluator.
//!
//! Turns on-chain holdings into a service tier. Direct ownership is checked
//! first; only a wallet that holds nothing itself is evaluated through the
//! accounts that delegated to it, and only one hop deep.

use crate::chain::{Address, ChainError, ChainReader, TokenId};
use chrono::{DateTime, Utc};
use log::{debug, info};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on cached decisions.
const DECISION_CACHE_CAPACITY: u64 = 10_000;

/// Default bound on one full evaluation, all chain round-trips included.
const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Service level. Ordered so that `Paid > Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Paid => write!(f, "paid"),
        }
    }
}

/// Result of a successful evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDecision {
    pub wallet: Address,
    pub tier: Tier,
    /// The delegator whose holdings granted the tier, for delegated access.
    pub via: Option<Address>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    #[error("Wallet {0} holds no qualifying token, directly or by delegation")]
    Denied(Address),

    /// The chain could not be consulted. Not a policy decision.
    #[error("Access policy could not be evaluated: {0}")]
    EvaluationUnavailable(#[from] ChainError),
}

/// Which token ids grant which tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRules {
    pub free_tier: TokenId,
    pub paid_tier: Vec<TokenId>,
}

pub struct AccessPolicy {
    reader: Arc<dyn ChainReader>,
    rules: TierRules,
    cache: Option<Cache<Address, TierDecision>>,
    timeout: Duration,
}

impl AccessPolicy {
    /// Create an evaluator without a decision cache.
    pub fn new(reader: Arc<dyn ChainReader>, rules: TierRules) -> Self {
        Self {
            reader,
            rules,
            cache: None,
            timeout: DEFAULT_EVALUATION_TIMEOUT,
        }
    }

    /// Cache successful decisions for `ttl`. A zero TTL disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = if ttl.is_zero() {
            None
        } else {
            Some(
                Cache::builder()
                    .max_capacity(DECISION_CACHE_CAPACITY)
                    .time_to_live(ttl)
                    .build(),
            )
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rules(&self) -> &TierRules {
        &self.rules
    }

    /// Evaluate `wallet`, answering from the decision cache when possible.
    pub async fn evaluate(&self, wallet: Address) -> Result<TierDecision, PolicyError> {
        if let Some(cache) = &self.cache {
            if let Some(decision) = cache.get(&wallet).await {
                debug!("Policy cache hit for {}", wallet);
                return Ok(decision);
            }
        }
        self.evaluate_fresh(wallet).await
    }

    /// Evaluate `wallet` against the chain, ignoring and then refreshing the
    /// cache. Used whenever a stale answer could keep a revoked wallet online.
    pub async fn evaluate_fresh(&self, wallet: Address) -> Result<TierDecision, PolicyError> {
        let result = match tokio::time::timeout(self.timeout, self.compute(wallet)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::EvaluationUnavailable(ChainError::Timeout)),
        };

        if let Some(cache) = &self.cache {
            match &result {
                Ok(decision) => cache.insert(wallet, decision.clone()).await,
                Err(PolicyError::Denied(_)) => cache.invalidate(&wallet).await,
                Err(PolicyError::EvaluationUnavailable(_)) => {}
            }
        }
        result
    }

    /// Drop any cached decision for `wallet`.
    pub async fn invalidate(&self, wallet: &Address) {
        if let Some(cache) = &self.cache {
            cache.invalidate(wallet).await;
        }
    }

    async fn compute(&self, wallet: Address) -> Result<TierDecision, PolicyError> {
        if let Some(tier) = self.holder_tier(wallet).await? {
            info!("Wallet {} holds {} tier directly", wallet, tier);
            return Ok(self.decision(wallet, tier, None));
        }

        let delegators = self.reader.resolve_delegations(wallet).await?;
        let mut best: Option<(Tier, Address)> = None;
        for delegator in delegators {
            match self.holder_tier(delegator).await? {
                Some(Tier::Paid) => {
                    best = Some((Tier::Paid, delegator));
                    break;
                }
                Some(Tier::Free) if best.is_none() => best = Some((Tier::Free, delegator)),
                _ => {}
            }
        }

        match best {
            Some((tier, delegator)) => {
                info!(
                    "Wallet {} holds {} tier through delegation from {}",
                    wallet, tier, delegator
                );
                Ok(self.decision(wallet, tier, Some(delegator)))
            }
            None => Err(PolicyError::Denied(wallet)),
        }
    }

    /// Tier from `holder`'s own balances. Paid is checked first so that an
    /// account holding both kinds of token resolves to paid.
    async fn holder_tier(&self, holder: Address) -> Result<Option<Tier>, ChainError> {
        if !self.rules.paid_tier.is_empty()
            && self
                .reader
                .check_ownership(holder, &self.rules.paid_tier)
                .await?
        {
            return Ok(Some(Tier::Paid));
        }
        if self
            .reader
            .check_ownership(holder, std::slice::from_ref(&self.rules.free_tier))
            .await?
        {
            return Ok(Some(Tier::Free));
        }
        Ok(None)
    }

    fn decision(&self, wallet: Address, tier: Tier, via: Option<Address>) -> TierDecision {
        TierDecision {
            wallet,
            tier,
            via,
            evaluated_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("rules", &self.rules)
            .field("cached", &self.cache.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
