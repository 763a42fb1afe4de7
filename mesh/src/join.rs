//! Seed resolution and cluster join.
//!
//! Startup runs a cheap fast join against a handful of seeds, then a full
//! join that sweeps every seed in batches and retries with backoff.

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::{
    broadcast::retransmit_limit,
    config::KvConfig,
    error::{KvError, KvResult},
    membership::Memberlist,
};

const JOIN_BATCH_SIZE: usize = 100;

/// Turns configured seeds into dialable `ip:port` addresses.
#[async_trait]
pub trait SeedResolver: Send + Sync {
    async fn resolve(&self, seeds: &[String]) -> Vec<String>;
}

/// Resolves `host[:port]` seeds through the tokio resolver. Seeds without a
/// port get `default_port`.
#[derive(Debug, Clone, Copy)]
pub struct HostResolver {
    pub default_port: u16,
}

impl HostResolver {
    async fn resolve_one(&self, seed: &str) -> std::io::Result<Vec<SocketAddr>> {
        if let Ok(addr) = seed.parse::<SocketAddr>() {
            return Ok(vec![addr]);
        }
        let has_port = seed
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.contains(':') && port.parse::<u16>().is_ok());
        let addrs = if has_port {
            tokio::net::lookup_host(seed).await?.collect()
        } else {
            tokio::net::lookup_host((seed, self.default_port)).await?.collect()
        };
        Ok(addrs)
    }
}

#[async_trait]
impl SeedResolver for HostResolver {
    async fn resolve(&self, seeds: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for seed in seeds {
            match self.resolve_one(seed).await {
                Ok(addrs) => {
                    for addr in addrs {
                        let addr = addr.to_string();
                        if seen.insert(addr.clone()) {
                            out.push(addr);
                        }
                    }
                }
                Err(e) => warn!(seed = %seed, error = %e, "Failed to resolve seed, skipping"),
            }
        }
        out
    }
}

/// Something nodes can be joined through.
#[async_trait]
pub trait JoinTarget: Send + Sync {
    /// Joins the given addresses, returning how many were reached.
    async fn join_nodes(&self, addrs: &[String]) -> usize;
}

#[async_trait]
impl JoinTarget for Memberlist {
    async fn join_nodes(&self, addrs: &[String]) -> usize {
        self.join(addrs).await
    }
}

/// delay = min(min_backoff * 2^(attempt-1), max_backoff)
pub fn join_backoff(min_backoff: Duration, max_backoff: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
    min_backoff.saturating_mul(factor).min(max_backoff)
}

/// Number of seeds a fast join tries to reach.
pub fn fast_join_target(retransmit_mult: usize, num_seeds: usize) -> usize {
    retransmit_limit(retransmit_mult, num_seeds)
}

/// Joins a few shuffled seeds one at a time. Returns how many were reached.
pub async fn fast_join(
    target: &dyn JoinTarget,
    resolver: &dyn SeedResolver,
    cfg: &KvConfig,
) -> usize {
    let mut nodes = resolver.resolve(&cfg.join_members).await;
    if nodes.is_empty() {
        return 0;
    }
    let to_join = fast_join_target(cfg.retransmit_mult, nodes.len());
    nodes.shuffle(&mut rand::rng());

    let mut reached = 0;
    for node in nodes {
        if reached >= to_join {
            break;
        }
        reached += target.join_nodes(std::slice::from_ref(&node)).await;
    }
    info!(reached, target = to_join, "Fast join finished");
    reached
}

/// One sweep over every seed in batches, re-resolving before each batch.
pub async fn join_in_batches(
    target: &dyn JoinTarget,
    resolver: &dyn SeedResolver,
    seeds: &[String],
) -> KvResult<usize> {
    let mut attempted = HashSet::new();
    let mut reached = 0;
    loop {
        let batch: Vec<String> = resolver
            .resolve(seeds)
            .await
            .into_iter()
            .filter(|addr| !attempted.contains(addr))
            .take(JOIN_BATCH_SIZE)
            .collect();
        if batch.is_empty() {
            break;
        }
        attempted.extend(batch.iter().cloned());
        let joined = target.join_nodes(&batch).await;
        debug!(batch = batch.len(), joined, "Joined batch of seeds");
        reached += joined;
    }

    if reached == 0 {
        return Err(KvError::Join(format!(
            "none of {} seed addresses could be reached",
            attempted.len()
        )));
    }
    Ok(reached)
}

/// Full join with exponential backoff between sweeps.
pub async fn join_members_with_retries(
    target: &dyn JoinTarget,
    resolver: &dyn SeedResolver,
    cfg: &KvConfig,
) -> KvResult<usize> {
    let attempts = cfg.max_join_retries.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match join_in_batches(target, resolver, &cfg.join_members).await {
            Ok(reached) => {
                info!(reached, attempt, "Joined cluster");
                return Ok(reached);
            }
            Err(e) => {
                if attempt < attempts {
                    let delay = join_backoff(cfg.min_join_backoff, cfg.max_join_backoff, attempt);
                    warn!(attempt, error = %e, retry_in = ?delay, "Join attempt failed");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| KvError::Join("no join attempt made".to_string())))
}
