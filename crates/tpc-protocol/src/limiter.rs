/// Per-agent sliding-window rate limiter.
///
/// Each agent owns a queue of admission timestamps. Entries older than
/// the window are pruned lazily on every call, so capacity comes back on
/// its own without a reset. Buckets live in a `DashMap`: different agents
/// never contend, calls for the same agent are serialized by its shard.
use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;
use tpc_transport::now_ms;
use tracing::{debug, warn};

use crate::config::RateLimiterConfig;

/// One row of [`RateLimiter::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRateStats {
    pub agent_id: String,
    pub remaining: u32,
    pub limited: bool,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, VecDeque<u64>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Admit and consume a slot. Returns whether the request was admitted.
    pub fn record(&self, agent_id: &str) -> bool {
        self.record_at(agent_id, now_ms())
    }

    pub fn record_at(&self, agent_id: &str, now: u64) -> bool {
        if self.config.max_per_window == 0 {
            warn!(agent_id, max = 0, "rate limit reached");
            return false;
        }
        let mut bucket = self.buckets.entry(agent_id.to_string()).or_default();
        prune(&mut bucket, now, self.config.window_ms);

        if bucket.len() >= self.config.max_per_window as usize {
            warn!(agent_id, max = self.config.max_per_window, "rate limit reached");
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Whether `record` would admit right now. Consumes nothing.
    pub fn is_allowed(&self, agent_id: &str) -> bool {
        self.is_allowed_at(agent_id, now_ms())
    }

    pub fn is_allowed_at(&self, agent_id: &str, now: u64) -> bool {
        self.remaining_at(agent_id, now) > 0
    }

    /// Slots left in the current window.
    pub fn remaining(&self, agent_id: &str) -> u32 {
        self.remaining_at(agent_id, now_ms())
    }

    pub fn remaining_at(&self, agent_id: &str, now: u64) -> u32 {
        let remaining = match self.buckets.get_mut(agent_id) {
            Some(mut bucket) => {
                prune(&mut bucket, now, self.config.window_ms);
                self.remaining_in(&bucket)
            }
            None => return self.config.max_per_window,
        };
        // Shard guard is released above; removing under it would deadlock.
        if remaining == self.config.max_per_window {
            self.buckets.remove_if(agent_id, |_, bucket| bucket.is_empty());
        }
        remaining
    }

    pub fn reset_agent(&self, agent_id: &str) {
        if self.buckets.remove(agent_id).is_some() {
            debug!(agent_id, "rate limit bucket reset");
        }
    }

    pub fn reset_all(&self) {
        self.buckets.clear();
    }

    /// Per-agent view, sorted by agent ID.
    pub fn stats(&self) -> Vec<AgentRateStats> {
        self.stats_at(now_ms())
    }

    pub fn stats_at(&self, now: u64) -> Vec<AgentRateStats> {
        self.prune_idle_at(now);
        let mut rows: Vec<AgentRateStats> = self
            .buckets
            .iter_mut()
            .map(|mut entry| {
                prune(entry.value_mut(), now, self.config.window_ms);
                let remaining = self.remaining_in(entry.value());
                AgentRateStats {
                    agent_id: entry.key().clone(),
                    remaining,
                    limited: remaining == 0,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        rows
    }

    /// Drop agents whose whole window has elapsed. Bounds memory for
    /// senders that are never seen again.
    pub fn prune_idle(&self) {
        self.prune_idle_at(now_ms())
    }

    pub fn prune_idle_at(&self, now: u64) {
        let window_ms = self.config.window_ms;
        self.buckets.retain(|_, bucket| {
            prune(bucket, now, window_ms);
            !bucket.is_empty()
        });
    }

    /// Number of agents with a live bucket.
    pub fn tracked_agents(&self) -> usize {
        self.buckets.len()
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn remaining_in(&self, bucket: &VecDeque<u64>) -> u32 {
        let used = u32::try_from(bucket.len()).unwrap_or(u32::MAX);
        self.config.max_per_window.saturating_sub(used)
    }
}

/// Drop timestamps that have left the window.
fn prune(bucket: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while let Some(&oldest) = bucket.front() {
        if now.saturating_sub(oldest) >= window_ms {
            bucket.pop_front();
        } else {
            break;
        }
    }
}
