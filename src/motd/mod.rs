//! MOTD passthrough: answering a client ping with a backend's own status.
//!
//! The resolver composes the TTL cache and the single-flight coalescer so
//! that at most one upstream status dialog is in flight per
//! (server, protocol) across the whole process, and outcomes (errors
//! included) are reused for the configured TTL.

pub mod cache;
pub mod dialer;
pub mod single_flight;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, Level};

use crate::config::{Config, ServerConfig};
use crate::error::{dial_log_level, ProxyError};
use crate::protocol::packet::StatusResponse;
use cache::TtlCache;
use dialer::StatusDialer;
use single_flight::SingleFlight;

/// Hard ceiling on how long a pinging client waits on a passthrough lookup.
/// The underlying dialog keeps running past it and may still warm the cache
/// for the next caller.
// TODO: allow overriding this per server once the server config grows a
// ping-deadline field.
pub const PASSTHROUGH_DEADLINE: Duration = Duration::from_secs(5);

const EVICTION_INTERVAL: Duration = Duration::from_secs(1);

/// Two protocol versions are distinct cache entries because the backend's
/// response may legitimately differ between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MotdKey {
    pub server: String,
    pub protocol: i32,
}

/// Both outcomes are cached; a cached error prevents a thundering herd on a
/// persistently failing backend.
pub type MotdResult = std::result::Result<StatusResponse, Arc<ProxyError>>;

pub struct MotdPassthrough {
    cache: TtlCache<MotdKey, MotdResult>,
    flight: SingleFlight<MotdKey, MotdResult>,
}

impl Default for MotdPassthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl MotdPassthrough {
    pub fn new() -> Self {
        Self {
            cache: TtlCache::new(EVICTION_INTERVAL),
            flight: SingleFlight::new(),
        }
    }

    /// Discards all cached outcomes. In-flight dialogs are not cancelled and
    /// will repopulate the cache when they finish.
    pub fn reset(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> (u64, u64, usize) {
        (self.cache.hits(), self.cache.misses(), self.cache.len())
    }

    /// Resolves the MOTD for a pinging client by forwarding the request to a
    /// backend with passthrough enabled.
    pub async fn resolve(&self, config: &Config, protocol: i32) -> MotdResult {
        let Some((name, server)) = find_passthrough_server(config) else {
            return Err(Arc::new(ProxyError::NoPassthroughConfigured));
        };
        let key = MotdKey {
            server: name.to_string(),
            protocol,
        };

        let cache_enabled = server.cache_ping_enabled();
        if cache_enabled {
            if let Some(result) = self.cache.get(&key) {
                debug!(server = %key.server, "returning cached MOTD passthrough result");
                return result;
            }
        }

        let dialer = StatusDialer::new(config.connection_timeout, config.read_timeout);
        let address = server.address.clone();
        let server_name = key.server.clone();
        let load = async move {
            debug!(server = %server_name, "resolving MOTD passthrough");
            match dialer.fetch_status(&server_name, &address, protocol).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    if dial_log_level(&err) == Level::DEBUG {
                        debug!(server = %server_name, error = %err, "MOTD passthrough lookup failed");
                    } else {
                        info!(server = %server_name, error = %err, "MOTD passthrough lookup failed");
                    }
                    Err(Arc::new(err))
                }
            }
        };

        if !cache_enabled {
            return load.await;
        }

        let ttl = server.cache_ping_ttl;
        let cache = self.cache.clone();
        let store_key = key.clone();
        let work = async move {
            // a fresh flight may start just after the previous one stored its
            // result; the store happens before the key is released, so this
            // re-check keeps it to one dialog per cached period
            if let Some(cached) = cache.get(&store_key) {
                return cached;
            }
            let outcome: MotdResult = load.await;
            cache.insert(store_key, outcome.clone(), ttl);
            outcome
        };

        match timeout(PASSTHROUGH_DEADLINE, self.flight.run(key, work)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Arc::new(ProxyError::Cancelled(
                "MOTD lookup task failed".into(),
            ))),
            Err(_) => Err(Arc::new(ProxyError::MotdTimeout)),
        }
    }
}

/// Finds the first server with MOTD passthrough enabled, preferring try-list
/// order and falling back to any other configured server. Pure function of
/// the snapshot.
pub fn find_passthrough_server(config: &Config) -> Option<(&str, &ServerConfig)> {
    for name in &config.try_servers {
        if let Some(server) = config.servers.get(name) {
            if server.passthrough_motd {
                return Some((name.as_str(), server));
            }
        }
    }
    config
        .servers
        .iter()
        .find(|(_, server)| server.passthrough_motd)
        .map(|(name, server)| (name.as_str(), server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet;
    use std::collections::HashMap;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    fn server(address: &str, passthrough: bool) -> ServerConfig {
        ServerConfig {
            address: address.into(),
            passthrough_motd: passthrough,
            cache_ping_ttl: Duration::ZERO,
        }
    }

    fn config_of(servers: Vec<(&str, ServerConfig)>, try_servers: Vec<&str>) -> Config {
        Config {
            servers: servers
                .into_iter()
                .map(|(name, server)| (name.to_string(), server))
                .collect::<HashMap<_, _>>(),
            try_servers: try_servers.into_iter().map(String::from).collect(),
            connection_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[test]
    fn selector_prefers_try_list_order() {
        let config = config_of(
            vec![
                ("server1", server("localhost:25561", false)),
                ("server2", server("localhost:25562", true)),
                ("server3", server("localhost:25563", true)),
            ],
            vec!["server2", "server3"],
        );
        let (name, found) = find_passthrough_server(&config).unwrap();
        assert_eq!(name, "server2");
        assert_eq!(found.address, "localhost:25562");
    }

    #[test]
    fn selector_returns_none_without_passthrough() {
        let config = config_of(
            vec![
                ("server1", server("localhost:25561", false)),
                ("server2", server("localhost:25562", false)),
            ],
            vec!["server1", "server2"],
        );
        assert!(find_passthrough_server(&config).is_none());
    }

    #[test]
    fn selector_falls_back_to_any_passthrough_server() {
        let config = config_of(
            vec![
                ("server1", server("localhost:25561", false)),
                ("server2", server("localhost:25562", false)),
                ("fallback", server("localhost:25563", true)),
            ],
            vec!["server1", "server2"],
        );
        let (name, _) = find_passthrough_server(&config).unwrap();
        assert_eq!(name, "fallback");
    }

    #[test]
    fn selector_handles_empty_configuration() {
        let config = config_of(vec![], vec![]);
        assert!(find_passthrough_server(&config).is_none());
    }

    async fn serve_status_once(stream: &mut TcpStream, status_json: &str) -> io::Result<()> {
        let (_, mut body) = packet::read_frame(stream).await?;
        packet::Handshake::decode(&mut body)?;
        packet::read_frame(stream).await?; // status request
        let response = packet::StatusResponse {
            status: status_json.to_string(),
        };
        packet::write_frame(stream, packet::STATUS_RESPONSE_ID, &response.encode()).await
    }

    /// Backend that answers every status handshake with a canned response.
    async fn spawn_status_backend(
        status_json: &'static str,
        accepts: Arc<AtomicUsize>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve_status_once(&mut stream, status_json).await;
                });
            }
        });
        addr
    }

    /// Backend that accepts, reads the handshake, then drops the connection.
    async fn spawn_dropping_backend(accepts: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                let _ = packet::read_frame(&mut stream).await;
            }
        });
        addr
    }

    /// An address that refuses connections: bind, then drop the listener.
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn resolves_through_the_first_passthrough_server() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let refused = refused_addr().await;
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;

        let mut config = config_of(
            vec![
                ("s1", server(&refused.to_string(), false)),
                (
                    "s2",
                    ServerConfig {
                        address: live.to_string(),
                        passthrough_motd: true,
                        cache_ping_ttl: Duration::from_secs(10),
                    },
                ),
            ],
            vec!["s1", "s2"],
        );
        config.read_timeout = Duration::from_secs(2);

        let motd = MotdPassthrough::new();
        let response = motd.resolve(&config, 763).await.unwrap();
        assert_eq!(response.status, r#"{"description":"hi"}"#);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_pings_share_one_dial() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;

        let config = Arc::new(config_of(
            vec![(
                "s2",
                ServerConfig {
                    address: live.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(10),
                },
            )],
            vec!["s2"],
        ));
        let motd = Arc::new(MotdPassthrough::new());

        let mut handles = Vec::new();
        for _ in 0..1000 {
            let motd = Arc::clone(&motd);
            let config = Arc::clone(&config);
            handles.push(tokio::spawn(async move {
                motd.resolve(&config, 763).await
            }));
        }
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, r#"{"description":"hi"}"#);
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        // follow-up pings are served straight from the cache
        let hits_before = motd.cache_stats().0;
        for _ in 0..999 {
            motd.resolve(&config, 763).await.unwrap();
        }
        assert_eq!(motd.cache_stats().0 - hits_before, 999);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_cached_for_the_ttl() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let dropping = spawn_dropping_backend(accepts.clone()).await;

        let config = config_of(
            vec![(
                "s2",
                ServerConfig {
                    address: dropping.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(5),
                },
            )],
            vec!["s2"],
        );
        let motd = MotdPassthrough::new();

        let first = motd.resolve(&config, 763).await.unwrap_err();
        let second = motd.resolve(&config, 763).await.unwrap_err();
        assert!(Arc::ptr_eq(&first, &second), "second caller must reuse the cached error");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_protocols_are_distinct_entries() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;
        let config = config_of(
            vec![(
                "s2",
                ServerConfig {
                    address: live.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(10),
                },
            )],
            vec!["s2"],
        );
        let motd = MotdPassthrough::new();
        motd.resolve(&config, 763).await.unwrap();
        motd.resolve(&config, 764).await.unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn removing_the_server_affects_only_new_callers() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;
        let with_server = config_of(
            vec![(
                "s2",
                ServerConfig {
                    address: live.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(10),
                },
            )],
            vec!["s2"],
        );
        let without_server = config_of(vec![], vec![]);
        let motd = Arc::new(MotdPassthrough::new());

        // caller 1 is mid-dialog against the old snapshot
        let caller1 = {
            let motd = Arc::clone(&motd);
            let config = with_server.clone();
            tokio::spawn(async move { motd.resolve(&config, 763).await })
        };

        // subsequent callers see the new snapshot and select nothing
        let err = motd.resolve(&without_server, 763).await.unwrap_err();
        assert!(matches!(*err, ProxyError::NoPassthroughConfigured));

        let response = caller1.await.unwrap().unwrap();
        assert_eq!(response.status, r#"{"description":"hi"}"#);
    }

    #[tokio::test]
    async fn uncached_servers_dial_every_time() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;
        let config = config_of(
            vec![("s2", {
                ServerConfig {
                    address: live.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::ZERO,
                }
            })],
            vec!["s2"],
        );
        let motd = MotdPassthrough::new();
        motd.resolve(&config, 763).await.unwrap();
        motd.resolve(&config, 763).await.unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
        assert_eq!(motd.cache_stats().2, 0);
    }

    #[tokio::test]
    async fn reset_during_flight_does_not_corrupt_state() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let live = spawn_status_backend(r#"{"description":"hi"}"#, accepts.clone()).await;
        let config = config_of(
            vec![(
                "s2",
                ServerConfig {
                    address: live.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(10),
                },
            )],
            vec!["s2"],
        );
        let motd = Arc::new(MotdPassthrough::new());
        let caller = {
            let motd = Arc::clone(&motd);
            let config = config.clone();
            tokio::spawn(async move { motd.resolve(&config, 763).await })
        };
        motd.reset();
        caller.await.unwrap().unwrap();
        // the flight was not cancelled and future callers still resolve
        motd.resolve(&config, 763).await.unwrap();
    }

    #[tokio::test]
    async fn stuck_backend_times_out_after_the_deadline() {
        // accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                sockets.push(stream);
            }
        });

        let mut config = config_of(
            vec![(
                "stuck",
                ServerConfig {
                    address: addr.to_string(),
                    passthrough_motd: true,
                    cache_ping_ttl: Duration::from_secs(30),
                },
            )],
            vec!["stuck"],
        );
        config.read_timeout = Duration::from_secs(60);

        let motd = MotdPassthrough::new();
        let started = std::time::Instant::now();
        let err = motd.resolve(&config, 763).await.unwrap_err();
        assert!(matches!(*err, ProxyError::MotdTimeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= PASSTHROUGH_DEADLINE);
        assert!(elapsed < PASSTHROUGH_DEADLINE + Duration::from_secs(2));
    }
}
