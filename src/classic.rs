//! Classic-mode front-end: terminates the status handshake itself and
//! forwards login connections to the first reachable try-list server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn, Level};

use crate::config::Config;
use crate::error::{dial_log_level, ProxyError};
use crate::events::{Event, EventBus, LoginStatus};
use crate::motd::dialer::split_host_port;
use crate::motd::MotdPassthrough;
use crate::protocol::packet::{self, Handshake, LoginStart, StatusResponse};
use crate::protocol::status::{StatusDocument, StatusPlayers, StatusVersion};
use crate::reload::ConfigService;

pub struct ClassicServer {
    config: Arc<ConfigService>,
    motd: Arc<MotdPassthrough>,
    events: Arc<EventBus>,
    active_players: Arc<AtomicU32>,
}

/// Emits the disconnect event and releases the player slot exactly once,
/// whichever way the forwarded connection ends.
struct PlayerSession {
    events: Arc<EventBus>,
    active_players: Arc<AtomicU32>,
    username: String,
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        self.active_players.fetch_sub(1, Ordering::Relaxed);
        self.events.publish(Event::PlayerDisconnect {
            username: std::mem::take(&mut self.username),
            login_status: LoginStatus::Successful,
        });
    }
}

impl ClassicServer {
    pub fn new(
        config: Arc<ConfigService>,
        motd: Arc<MotdPassthrough>,
        events: Arc<EventBus>,
        active_players: Arc<AtomicU32>,
    ) -> Self {
        Self {
            config,
            motd,
            events,
            active_players,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream, peer).await {
                            if dial_log_level(&err) == Level::DEBUG {
                                debug!(%peer, error = %err, "connection ended with error");
                            } else {
                                info!(%peer, error = %err, "connection ended with error");
                            }
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            }
        }
    }

    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let config = self.config.current();
        let io_err = |source| ProxyError::Transport {
            backend: peer.to_string(),
            source,
        };
        let (id, mut body) = timeout(config.read_timeout, packet::read_frame(&mut client))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                backend: peer.to_string(),
                stage: "client handshake",
            })?
            .map_err(io_err)?;
        if id != packet::HANDSHAKE_ID {
            return Err(ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "expected a handshake frame",
                ),
            });
        }
        let handshake =
            Handshake::decode(&mut body).map_err(|source| ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source,
            })?;

        match handshake.next_state {
            packet::STATUS_NEXT_STATE => self.handle_status(client, &config, &handshake).await,
            packet::LOGIN_NEXT_STATE => {
                self.handle_login(client, &config, &handshake, peer).await
            }
            other => Err(ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown next state {other}"),
                ),
            }),
        }
    }

    async fn handle_status(
        &self,
        mut client: TcpStream,
        config: &Config,
        handshake: &Handshake,
    ) -> Result<(), ProxyError> {
        let peer = client
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let io_err = |source| ProxyError::Transport {
            backend: peer.clone(),
            source,
        };

        // status request
        timeout(config.read_timeout, packet::read_frame(&mut client))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                backend: peer.clone(),
                stage: "status request",
            })?
            .map_err(io_err)?;

        // any passthrough failure falls back to the proxy's own MOTD
        let status = match self.motd.resolve(config, handshake.protocol).await {
            Ok(response) => response.status,
            Err(err) => {
                if !matches!(*err, ProxyError::NoPassthroughConfigured) {
                    if dial_log_level(&err) == Level::DEBUG {
                        debug!(error = %err, "MOTD passthrough unavailable, using own MOTD");
                    } else {
                        info!(error = %err, "MOTD passthrough unavailable, using own MOTD");
                    }
                }
                own_status_json(config, handshake.protocol)?
            }
        };
        let response = StatusResponse { status };
        packet::write_frame(&mut client, packet::STATUS_RESPONSE_ID, &response.encode())
            .await
            .map_err(io_err)?;

        while let Ok(Ok((id, mut body))) =
            timeout(config.read_timeout, packet::read_frame(&mut client)).await
        {
            if id != packet::STATUS_PING_ID {
                break;
            }
            let payload = packet::get_ping_payload(&mut body).map_err(io_err)?;
            packet::write_frame(
                &mut client,
                packet::STATUS_PING_ID,
                &packet::encode_ping_payload(payload),
            )
            .await
            .map_err(io_err)?;
        }
        Ok(())
    }

    async fn handle_login(
        &self,
        mut client: TcpStream,
        config: &Config,
        handshake: &Handshake,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let io_err = |source| ProxyError::Transport {
            backend: peer.to_string(),
            source,
        };
        let (id, login_body) = timeout(config.read_timeout, packet::read_frame(&mut client))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                backend: peer.to_string(),
                stage: "login start",
            })?
            .map_err(io_err)?;
        if id != packet::LOGIN_START_ID {
            return Err(ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "expected a login start frame",
                ),
            });
        }
        let login = LoginStart::decode(&mut login_body.clone()).map_err(|source| {
            ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source,
            }
        })?;

        let Some((server_name, mut upstream)) = self.dial_first_try_server(config).await else {
            info!(username = %login.username, "no reachable server for login");
            let reason = serde_json::json!({"text": "No server available. Try again later."});
            let _ = packet::write_frame(
                &mut client,
                packet::LOGIN_DISCONNECT_ID,
                &packet::encode_login_disconnect(&reason),
            )
            .await;
            self.events.publish(Event::PlayerDisconnect {
                username: login.username,
                login_status: LoginStatus::CancelledBeforeComplete,
            });
            return Ok(());
        };

        // replay the handshake and login start, then hand the stream over
        let (backend_host, backend_port) = split_host_port(
            &config
                .servers
                .get(&server_name)
                .map(|s| s.address.clone())
                .unwrap_or_default(),
        );
        let replayed = Handshake {
            server_address: backend_host,
            port: backend_port,
            ..handshake.clone()
        };
        let backend_err = |source| ProxyError::Transport {
            backend: server_name.clone(),
            source,
        };
        packet::write_frame(&mut upstream, packet::HANDSHAKE_ID, &replayed.encode())
            .await
            .map_err(backend_err)?;
        packet::write_frame(&mut upstream, packet::LOGIN_START_ID, &login_body)
            .await
            .map_err(backend_err)?;

        self.active_players.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::PlayerConnect {
            username: login.username.clone(),
            remote_addr: peer.to_string(),
            protocol: handshake.protocol,
        });
        self.events.publish(Event::PlayerServerSwitch {
            username: login.username.clone(),
            from_server: None,
            to_server: server_name.clone(),
        });
        let _session = PlayerSession {
            events: Arc::clone(&self.events),
            active_players: Arc::clone(&self.active_players),
            username: login.username.clone(),
        };

        info!(username = %login.username, server = %server_name, "forwarding login");
        if let Err(err) = copy_bidirectional(&mut client, &mut upstream).await {
            debug!(server = %server_name, error = %err, "session ended with error");
        }
        Ok(())
    }

    /// Dials try-list servers in order and returns the first that accepts.
    async fn dial_first_try_server(&self, config: &Config) -> Option<(String, TcpStream)> {
        for name in &config.try_servers {
            let Some(server) = config.servers.get(name) else {
                continue;
            };
            let (host, port) = split_host_port(&server.address);
            match timeout(
                config.connection_timeout,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => return Some((name.clone(), stream)),
                Ok(Err(err)) => {
                    if dial_log_level(&err) == Level::DEBUG {
                        debug!(server = %name, error = %err, "try server unreachable");
                    } else {
                        info!(server = %name, error = %err, "try server unreachable");
                    }
                }
                Err(_) => info!(server = %name, "try server timed out"),
            }
        }
        None
    }
}

/// The proxy's own status document, used when passthrough is unavailable.
fn own_status_json(config: &Config, client_protocol: i32) -> Result<String, ProxyError> {
    let protocol = if config.motd.protocol > 0 {
        config.motd.protocol
    } else {
        client_protocol
    };
    let document = StatusDocument {
        version: StatusVersion {
            name: config.motd.version_name.clone(),
            protocol,
        },
        players: Some(StatusPlayers {
            max: config.motd.max_players,
            online: 0,
            sample: None,
        }),
        description: config.motd.description.clone(),
        favicon: config.motd.favicon.clone(),
    };
    serde_json::to_string(&document).map_err(|err| ProxyError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::events::EventFilter;
    use std::time::Duration;

    fn harness(config: Config) -> (Arc<ClassicServer>, Arc<EventBus>, Arc<AtomicU32>) {
        let events = Arc::new(EventBus::new());
        let service = Arc::new(ConfigService::new(config, None, Arc::clone(&events)));
        let active = Arc::new(AtomicU32::new(0));
        let server = Arc::new(ClassicServer::new(
            service,
            Arc::new(MotdPassthrough::new()),
            Arc::clone(&events),
            Arc::clone(&active),
        ));
        (server, events, active)
    }

    async fn start(server: Arc<ClassicServer>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        addr
    }

    fn base_config() -> Config {
        Config {
            connection_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn status_ping_gets_the_proxys_own_motd() {
        let (server, _events, _active) = harness(base_config());
        let addr = start(server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let handshake = Handshake {
            protocol: 763,
            server_address: "localhost".into(),
            port: 25565,
            next_state: packet::STATUS_NEXT_STATE,
        };
        packet::write_frame(&mut client, packet::HANDSHAKE_ID, &handshake.encode())
            .await
            .unwrap();
        packet::write_frame(&mut client, packet::STATUS_REQUEST_ID, &[])
            .await
            .unwrap();

        let (id, mut body) = packet::read_frame(&mut client).await.unwrap();
        assert_eq!(id, packet::STATUS_RESPONSE_ID);
        let response = StatusResponse::decode(&mut body).unwrap();
        let document: StatusDocument = serde_json::from_str(&response.status).unwrap();
        assert_eq!(document.version.name, "Craftgate");

        packet::write_frame(
            &mut client,
            packet::STATUS_PING_ID,
            &packet::encode_ping_payload(1234),
        )
        .await
        .unwrap();
        let (id, mut body) = packet::read_frame(&mut client).await.unwrap();
        assert_eq!(id, packet::STATUS_PING_ID);
        assert_eq!(packet::get_ping_payload(&mut body).unwrap(), 1234);
    }

    #[tokio::test]
    async fn login_without_reachable_server_is_cancelled() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let mut config = base_config();
        config.servers.insert(
            "s1".into(),
            ServerConfig {
                address: closed_addr.to_string(),
                passthrough_motd: false,
                cache_ping_ttl: Duration::ZERO,
            },
        );
        config.try_servers = vec!["s1".into()];

        let (server, events, _active) = harness(config);
        let mut sub = events.subscribe(EventFilter::all());
        let addr = start(server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let handshake = Handshake {
            protocol: 763,
            server_address: "localhost".into(),
            port: 25565,
            next_state: packet::LOGIN_NEXT_STATE,
        };
        packet::write_frame(&mut client, packet::HANDSHAKE_ID, &handshake.encode())
            .await
            .unwrap();
        let mut login_body = bytes::BytesMut::new();
        packet::put_string(&mut login_body, "steve");
        packet::write_frame(&mut client, packet::LOGIN_START_ID, &login_body)
            .await
            .unwrap();

        let (id, mut body) = packet::read_frame(&mut client).await.unwrap();
        assert_eq!(id, packet::LOGIN_DISCONNECT_ID);
        let reason = packet::get_string(&mut body, packet::MAX_STRING_LEN).unwrap();
        assert!(reason.contains("No server available"));

        let Some(Event::PlayerDisconnect {
            username,
            login_status,
        }) = sub.recv().await
        else {
            panic!("expected a disconnect event");
        };
        assert_eq!(username, "steve");
        assert_eq!(login_status, LoginStatus::CancelledBeforeComplete);
    }

    #[tokio::test]
    async fn login_is_forwarded_and_events_fire() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let (id, _) = packet::read_frame(&mut stream).await.unwrap();
            assert_eq!(id, packet::HANDSHAKE_ID);
            let (id, mut body) = packet::read_frame(&mut stream).await.unwrap();
            assert_eq!(id, packet::LOGIN_START_ID);
            let login = LoginStart::decode(&mut body).unwrap();
            assert_eq!(login.username, "alex");
            // backend closes; the session ends
        });

        let mut config = base_config();
        config.servers.insert(
            "hub".into(),
            ServerConfig {
                address: backend_addr.to_string(),
                passthrough_motd: false,
                cache_ping_ttl: Duration::ZERO,
            },
        );
        config.try_servers = vec!["hub".into()];

        let (server, events, active) = harness(config);
        let mut sub = events.subscribe(EventFilter::all());
        let addr = start(server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let handshake = Handshake {
            protocol: 763,
            server_address: "localhost".into(),
            port: 25565,
            next_state: packet::LOGIN_NEXT_STATE,
        };
        packet::write_frame(&mut client, packet::HANDSHAKE_ID, &handshake.encode())
            .await
            .unwrap();
        let mut login_body = bytes::BytesMut::new();
        packet::put_string(&mut login_body, "alex");
        packet::write_frame(&mut client, packet::LOGIN_START_ID, &login_body)
            .await
            .unwrap();

        let Some(Event::PlayerConnect { username, .. }) = sub.recv().await else {
            panic!("expected a connect event");
        };
        assert_eq!(username, "alex");
        let Some(Event::PlayerServerSwitch { to_server, .. }) = sub.recv().await else {
            panic!("expected a server switch event");
        };
        assert_eq!(to_server, "hub");

        drop(client);
        let Some(Event::PlayerDisconnect { login_status, .. }) = sub.recv().await else {
            panic!("expected a disconnect event");
        };
        assert_eq!(login_status, LoginStatus::Successful);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }
}
