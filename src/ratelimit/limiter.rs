//! Core rate limiter implementation.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::identity::EndpointKey;
use super::rules::RateLimitRules;
use super::window::{Limit, RequestWindow};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// The client IP is in the block map
    Blocked,
    /// The client IP just crossed the anomaly threshold
    Suspicious,
    /// The endpoint-specific limit for this client is exhausted
    EndpointLimit,
    /// The per-IP limit is exhausted
    IpLimit,
    /// The per-user limit is exhausted
    UserLimit,
}

impl RejectReason {
    /// Machine-readable name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Blocked => "blocked",
            RejectReason::Suspicious => "suspicious",
            RejectReason::EndpointLimit => "endpoint-limit",
            RejectReason::IpLimit => "ip-limit",
            RejectReason::UserLimit => "user-limit",
        }
    }

    /// Human-readable description of the reason.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Blocked => "IP address is temporarily blocked",
            RejectReason::Suspicious => "Suspicious activity detected",
            RejectReason::EndpointLimit => "Rate limit exceeded for this endpoint",
            RejectReason::IpLimit => "Too many requests from this IP address",
            RejectReason::UserLimit => "Too many requests for this user",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Whole seconds the client should wait before retrying; never zero
    pub retry_after_secs: u64,
}

/// Remaining allowance on an endpoint with its own configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_secs: u64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed. `quota` is set for endpoints with a specific limit.
    Allowed { quota: Option<Quota> },
    /// The request must be turned away.
    Rejected(Rejection),
}

impl Decision {
    fn rejected(reason: RejectReason, retry_after: Duration) -> Self {
        Decision::Rejected(Rejection {
            reason,
            retry_after_secs: ceil_secs(retry_after).max(1),
        })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Rejected(rejection) => Some(rejection),
            Decision::Allowed { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        self.rejection().map(|r| r.reason)
    }
}

/// Why an IP is in the block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Suspicious,
    Manual,
}

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    unblock_at: Instant,
    reason: BlockReason,
}

/// Read-only snapshot of limiter state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub active_ips: usize,
    pub active_users: usize,
    pub blocked_ips: usize,
    pub endpoint_requests: usize,
    pub suspicious_ips: usize,
}

/// Per-request admission control over IPs, users and endpoints.
///
/// State lives in per-structure concurrent maps; each key's purge-and-append
/// runs under that key's shard lock, so unrelated keys never contend on a
/// global lock.
pub struct RateLimiter {
    rules: RateLimitRules,
    /// Endpoint limits with defaults already applied
    endpoint_limits: HashMap<String, Limit>,
    ip_windows: DashMap<String, RequestWindow>,
    user_windows: DashMap<String, RequestWindow>,
    endpoint_windows: DashMap<EndpointKey, RequestWindow>,
    /// Activity per IP across every endpoint, used only for anomaly detection
    ledgers: DashMap<String, RequestWindow>,
    blocked: DashMap<String, BlockEntry>,
}

impl RateLimiter {
    /// Create a rate limiter enforcing `rules`.
    ///
    /// Rules are expected to have been validated at startup.
    pub fn new(rules: RateLimitRules) -> Self {
        let endpoint_limits = rules.resolved_endpoints();
        Self {
            rules,
            endpoint_limits,
            ip_windows: DashMap::new(),
            user_windows: DashMap::new(),
            endpoint_windows: DashMap::new(),
            ledgers: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    /// The rules this limiter enforces.
    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }

    /// Decide whether a request may proceed.
    pub fn check(&self, client_ip: &str, user: Option<&str>, endpoint: &str) -> Decision {
        self.check_at(client_ip, user, endpoint, Instant::now())
    }

    /// Decide whether a request arriving at `now` may proceed.
    ///
    /// Checks run in a fixed order and stop at the first violation: block map,
    /// anomaly ledger, endpoint limit, IP limit, user limit. Windows are only
    /// appended to once every check has passed; the anomaly ledger records
    /// every request that is not already blocked.
    pub fn check_at(
        &self,
        client_ip: &str,
        user: Option<&str>,
        endpoint: &str,
        now: Instant,
    ) -> Decision {
        trace!(ip = %client_ip, user = ?user, endpoint = %endpoint, "Checking rate limit");

        if let Some(remaining) = self.block_remaining(client_ip, now) {
            debug!(ip = %client_ip, remaining_secs = remaining.as_secs(), "Rejecting blocked IP");
            return Decision::rejected(RejectReason::Blocked, remaining);
        }

        if self.record_activity(client_ip, now) {
            let block = self.rules.anomaly.block_duration();
            self.blocked.insert(
                client_ip.to_string(),
                BlockEntry {
                    unblock_at: now + block,
                    reason: BlockReason::Suspicious,
                },
            );
            warn!(
                ip = %client_ip,
                threshold = self.rules.anomaly.threshold,
                block_secs = block.as_secs(),
                "Suspicious activity detected, blocking IP"
            );
            return Decision::rejected(RejectReason::Suspicious, block);
        }

        // Guards are taken endpoint, IP, user and held until the commit, so
        // each key's purge, compare and append happen under one lock.
        let endpoint_limit = self.endpoint_limits.get(endpoint).copied();
        let mut endpoint_window = match endpoint_limit {
            Some(limit) => {
                let key = EndpointKey::new(endpoint, client_ip);
                let mut window = window_mut(&self.endpoint_windows, &key);
                if window.is_exceeded(now, &limit) {
                    debug!(key = %key, limit = limit.requests, "Endpoint rate limit exceeded");
                    return Decision::rejected(RejectReason::EndpointLimit, limit.window());
                }
                Some((window, limit))
            }
            None => None,
        };

        let per_ip = self.rules.per_ip;
        let mut ip_window = window_mut(&self.ip_windows, client_ip);
        if ip_window.is_exceeded(now, &per_ip) {
            debug!(ip = %client_ip, limit = per_ip.requests, "IP rate limit exceeded");
            return Decision::rejected(RejectReason::IpLimit, per_ip.window());
        }

        let per_user = self.rules.per_user;
        let mut user_window = match user {
            Some(user) => {
                let mut window = window_mut(&self.user_windows, user);
                if window.is_exceeded(now, &per_user) {
                    debug!(user = %user, limit = per_user.requests, "User rate limit exceeded");
                    return Decision::rejected(RejectReason::UserLimit, per_user.window());
                }
                Some(window)
            }
            None => None,
        };

        let quota = endpoint_window.as_mut().map(|(window, limit)| {
            window.record(now);
            Quota {
                limit: limit.requests,
                remaining: limit.requests.saturating_sub(window.len() as u64),
                reset_after_secs: ceil_secs(window.reset_after(now, limit.window())),
            }
        });
        ip_window.record(now);
        if let Some(window) = user_window.as_mut() {
            window.record(now);
        }

        Decision::Allowed { quota }
    }

    /// Block an IP for `duration` from now.
    pub fn block_ip(&self, client_ip: &str, duration: Duration) {
        self.block_ip_until(client_ip, Instant::now() + duration);
    }

    /// Block an IP until `unblock_at`.
    ///
    /// An existing block that lasts longer is left in place.
    pub fn block_ip_until(&self, client_ip: &str, unblock_at: Instant) {
        let mut entry = self
            .blocked
            .entry(client_ip.to_string())
            .or_insert(BlockEntry {
                unblock_at,
                reason: BlockReason::Manual,
            });
        if entry.unblock_at < unblock_at {
            *entry = BlockEntry {
                unblock_at,
                reason: BlockReason::Manual,
            };
        }
        info!(ip = %client_ip, "IP blocked");
    }

    /// Lift a block. Returns whether the IP was in the block map.
    pub fn unblock_ip(&self, client_ip: &str) -> bool {
        let removed = self.blocked.remove(client_ip).is_some();
        if removed {
            info!(ip = %client_ip, "IP unblocked");
        }
        removed
    }

    /// Whether an IP is blocked right now.
    pub fn is_blocked(&self, client_ip: &str) -> bool {
        self.blocked
            .get(client_ip)
            .is_some_and(|entry| Instant::now() < entry.unblock_at)
    }

    /// Snapshot of the limiter's bookkeeping.
    pub fn stats(&self) -> RateLimiterStats {
        self.stats_at(Instant::now())
    }

    /// Snapshot of the limiter's bookkeeping as seen at `now`.
    pub fn stats_at(&self, now: Instant) -> RateLimiterStats {
        let per_ip = self.rules.per_ip.window();
        let per_user = self.rules.per_user.window();

        let active_ips = self
            .ip_windows
            .iter()
            .filter(|w| w.count_within(now, per_ip) > 0)
            .count();
        let active_users = self
            .user_windows
            .iter()
            .filter(|w| w.count_within(now, per_user) > 0)
            .count();

        let endpoint_requests = self
            .endpoint_windows
            .iter()
            .map(|entry| {
                self.endpoint_limits
                    .get(&entry.key().endpoint)
                    .map_or(0, |limit| entry.value().count_within(now, limit.window()))
            })
            .sum();

        let mut blocked_ips = 0;
        let mut suspicious_ips = 0;
        for entry in self.blocked.iter().filter(|e| now < e.unblock_at) {
            blocked_ips += 1;
            if entry.reason == BlockReason::Suspicious {
                suspicious_ips += 1;
            }
        }

        RateLimiterStats {
            active_ips,
            active_users,
            blocked_ips,
            endpoint_requests,
            suspicious_ips,
        }
    }

    /// Drop windows, ledgers and block entries that no longer hold live data.
    ///
    /// Decisions never depend on this having run.
    pub fn purge_stale(&self, now: Instant) {
        let per_ip = self.rules.per_ip.window();
        let per_user = self.rules.per_user.window();
        let retention = self.rules.anomaly.ledger_retention();

        self.ip_windows.retain(|_, w| {
            w.purge(now, per_ip);
            !w.is_empty()
        });
        self.user_windows.retain(|_, w| {
            w.purge(now, per_user);
            !w.is_empty()
        });
        self.endpoint_windows.retain(|key, w| {
            if let Some(limit) = self.endpoint_limits.get(&key.endpoint) {
                w.purge(now, limit.window());
            }
            !w.is_empty()
        });
        self.ledgers.retain(|_, w| {
            w.purge(now, retention);
            !w.is_empty()
        });
        self.blocked.retain(|_, entry| now < entry.unblock_at);

        debug!(
            ips = self.ip_windows.len(),
            users = self.user_windows.len(),
            endpoints = self.endpoint_windows.len(),
            "Purged stale rate limit state"
        );
    }

    /// Periodically purge stale state until `shutdown` is cancelled.
    pub fn spawn_compaction(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => limiter.purge_stale(Instant::now()),
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter compaction task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn block_remaining(&self, client_ip: &str, now: Instant) -> Option<Duration> {
        let unblock_at = self.blocked.get(client_ip).map(|entry| entry.unblock_at)?;
        if now < unblock_at {
            return Some(unblock_at - now);
        }

        self.blocked.remove_if(client_ip, |_, entry| now >= entry.unblock_at);
        None
    }

    /// Record activity in the IP's ledger and report whether it crossed the
    /// anomaly threshold.
    fn record_activity(&self, client_ip: &str, now: Instant) -> bool {
        let anomaly = &self.rules.anomaly;
        let mut ledger = self.ledgers.entry(client_ip.to_string()).or_default();
        ledger.purge(now, anomaly.ledger_retention());
        ledger.record(now);
        ledger.count_within(now, anomaly.detection_window()) as u64 > anomaly.threshold
    }
}

/// Lock `key`'s window, creating it on first use.
fn window_mut<'a, K, Q>(windows: &'a DashMap<K, RequestWindow>, key: &Q) -> RefMut<'a, K, RequestWindow>
where
    K: Hash + Eq + Borrow<Q> + From<Q::Owned>,
    Q: Hash + Eq + ToOwned + ?Sized,
{
    if let Some(window) = windows.get_mut(key) {
        return window;
    }
    windows.entry(K::from(key.to_owned())).or_default()
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitRules::default())
    }
}
