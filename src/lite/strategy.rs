//! Backend selection strategies and per-backend connection accounting.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{Config, RouteConfig};
use crate::motd::dialer::StatusDialer;
use crate::reload::ConfigService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
    LeastConnections,
    LowestLatency,
    WeightedRandom,
    WeightedRoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::LowestLatency => "lowest-latency",
            Strategy::WeightedRandom => "weighted-random",
            Strategy::WeightedRoundRobin => "weighted-round-robin",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits "address#weight" into address and weight; weight defaults to 1.
pub fn parse_backend(backend: &str) -> (&str, u32) {
    match backend.rsplit_once('#') {
        Some((address, weight)) => match weight.parse::<u32>() {
            Ok(weight) if weight > 0 => (address, weight),
            _ => (backend, 1),
        },
        None => (backend, 1),
    }
}

/// EWMA of dial + handshake latency, stored as f64 bits for lock-free updates.
/// Zero means unsampled, which sorts first so cold backends get probed.
struct LatencyEwma(AtomicU64);

const EWMA_DECAY: f64 = 0.5;

impl LatencyEwma {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn observe(&self, sample_ms: f64) {
        let mut current_bits = self.0.load(Ordering::Acquire);
        loop {
            let current = f64::from_bits(current_bits);
            let next = if current == 0.0 {
                sample_ms
            } else {
                sample_ms * (1.0 - EWMA_DECAY) + current * EWMA_DECAY
            };
            match self.0.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(updated) => current_bits = updated,
            }
        }
    }

    fn value_ms(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Decrement handle for a selected backend's active-connection counter.
/// Dropping it decrements exactly once, on every exit path of the transport.
pub struct ConnectionGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-backend counters, round-robin cursors and latency trackers. Keyed by
/// stable identifiers (backend address, route host set) so entries survive
/// config swaps and are pruned when the identifier disappears.
pub struct StrategyManager {
    counters: DashMap<String, Arc<AtomicU32>>,
    cursors: DashMap<String, AtomicUsize>,
    latencies: DashMap<String, Arc<LatencyEwma>>,
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyManager {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            cursors: DashMap::new(),
            latencies: DashMap::new(),
        }
    }

    /// Lazily creates the counter for a backend address.
    pub fn counter(&self, backend: &str) -> Arc<AtomicU32> {
        self.counters
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    /// Current count without creating a counter.
    pub fn active_connections(&self, backend: &str) -> u32 {
        self.counters
            .get(backend)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_latency(&self, backend: &str, latency: Duration) {
        self.latencies
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(LatencyEwma::new()))
            .observe(latency.as_secs_f64() * 1000.0);
    }

    fn latency_ms(&self, backend: &str) -> f64 {
        self.latencies
            .get(backend)
            .map(|e| e.value_ms())
            .unwrap_or(0.0)
    }

    /// Picks a backend for the route and increments its counter, returning
    /// the address together with the decrement guard.
    pub fn select(&self, route: &RouteConfig) -> Option<(String, ConnectionGuard)> {
        let backends: Vec<(&str, u32)> =
            route.backends.iter().map(|b| parse_backend(b)).collect();
        if backends.is_empty() {
            return None;
        }
        let index = match route.strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..backends.len()),
            Strategy::RoundRobin => self.next_cursor(route) % backends.len(),
            Strategy::LeastConnections => {
                let mut best = 0;
                let mut best_count = u32::MAX;
                for (i, (address, _)) in backends.iter().enumerate() {
                    let count = self.active_connections(address);
                    if count < best_count {
                        best = i;
                        best_count = count;
                    }
                }
                best
            }
            Strategy::LowestLatency => {
                let mut best = 0;
                let mut best_latency = f64::INFINITY;
                for (i, (address, _)) in backends.iter().enumerate() {
                    let latency = self.latency_ms(address);
                    if latency < best_latency {
                        best = i;
                        best_latency = latency;
                    }
                }
                best
            }
            Strategy::WeightedRandom => {
                let total: u32 = backends.iter().map(|(_, w)| w).sum();
                let pick = rand::thread_rng().gen_range(0..total);
                weighted_index(&backends, pick)
            }
            Strategy::WeightedRoundRobin => {
                let total: u32 = backends.iter().map(|(_, w)| w).sum();
                let pick = (self.next_cursor(route) % total as usize) as u32;
                weighted_index(&backends, pick)
            }
        };
        let (address, _) = backends[index];
        let counter = self.counter(address);
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %address, strategy = %route.strategy, "selected backend");
        Some((
            address.to_string(),
            ConnectionGuard { counter },
        ))
    }

    fn next_cursor(&self, route: &RouteConfig) -> usize {
        self.cursors
            .entry(route_key(route))
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Drops state for backends and routes the configuration no longer names.
    pub fn prune(&self, config: &Config) {
        let mut backends = HashSet::new();
        let mut routes = HashSet::new();
        for route in &config.lite.routes {
            routes.insert(route_key(route));
            for backend in &route.backends {
                backends.insert(parse_backend(backend).0.to_string());
            }
        }
        self.counters.retain(|address, _| backends.contains(address));
        self.latencies.retain(|address, _| backends.contains(address));
        self.cursors.retain(|key, _| routes.contains(key));
    }

    /// Periodically measures dial + handshake latency against the backends of
    /// lowest-latency routes.
    pub async fn run_latency_probes(self: Arc<Self>, config: Arc<ConfigService>) {
        loop {
            let cfg = config.current();
            self.probe_once(&cfg).await;
            tokio::time::sleep(cfg.lite.latency_probe_interval).await;
        }
    }

    async fn probe_once(&self, config: &Config) {
        let dialer = StatusDialer::new(config.connection_timeout, config.read_timeout);
        let penalty = config.connection_timeout + config.read_timeout;
        for route in &config.lite.routes {
            if route.strategy != Strategy::LowestLatency {
                continue;
            }
            for backend in &route.backends {
                let (address, _) = parse_backend(backend);
                let started = Instant::now();
                match dialer.fetch_status(address, address, 0).await {
                    Ok(_) => self.record_latency(address, started.elapsed()),
                    Err(err) => {
                        self.record_latency(address, penalty);
                        debug!(backend = %address, error = %err, "latency probe failed");
                    }
                }
            }
        }
    }
}

fn weighted_index(backends: &[(&str, u32)], pick: u32) -> usize {
    let mut cumulative = 0;
    for (i, (_, weight)) in backends.iter().enumerate() {
        cumulative += weight;
        if pick < cumulative {
            return i;
        }
    }
    backends.len() - 1
}

fn route_key(route: &RouteConfig) -> String {
    route.hosts.join(",").to_ascii_lowercase()
}
