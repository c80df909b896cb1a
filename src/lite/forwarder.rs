//! Lite-mode front-end: host-routed L7 TCP forwarding.
//!
//! The forwarder reads just the handshake frame, resolves the virtual host
//! to a route, picks a backend via the route's strategy and then splices
//! bytes both ways. It never parses post-handshake traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn, Level};

use crate::config::{Config, RouteConfig};
use crate::error::{dial_log_level, ProxyError};
use crate::motd::dialer::split_host_port;
use crate::protocol::packet::{self, Handshake, StatusResponse};
use crate::protocol::status::{StatusDocument, StatusPlayers, StatusVersion};
use crate::reload::ConfigService;
use super::router;
use super::strategy::StrategyManager;

pub struct LiteForwarder {
    config: Arc<ConfigService>,
    strategies: Arc<StrategyManager>,
}

impl LiteForwarder {
    pub fn new(config: Arc<ConfigService>, strategies: Arc<StrategyManager>) -> Self {
        Self { config, strategies }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let forwarder = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = forwarder.handle_connection(stream, peer).await {
                            if dial_log_level(&err) == Level::DEBUG {
                                debug!(%peer, error = %err, "lite connection ended with error");
                            } else {
                                info!(%peer, error = %err, "lite connection ended with error");
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
        let (id, mut body) = timeout(config.read_timeout, packet::read_frame(&mut client))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                backend: peer.to_string(),
                stage: "client handshake",
            })?
            .map_err(|source| ProxyError::Transport {
                backend: peer.to_string(),
                source,
            })?;
        if id != packet::HANDSHAKE_ID {
            return Err(ProxyError::ProtocolDecode {
                backend: peer.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "expected a handshake frame",
                ),
            });
        }
        let handshake = Handshake::decode(&mut body).map_err(|source| ProxyError::ProtocolDecode {
            backend: peer.to_string(),
            source,
        })?;

        let host = router::clean_virtual_host(&handshake.server_address).to_string();
        let Some(route) = router::find_route(&config.lite, &host) else {
            debug!(%host, %peer, "no route for virtual host");
            return Ok(());
        };
        // the TCPShield edge hides the real client behind `peer`; prefer the
        // address it reports when the route opts in and it parses
        let mut client_addr = peer;
        if route.real_ip_from_tcpshield {
            if let Some(real_ip) = router::tcpshield_real_ip(&handshake.server_address) {
                match real_ip.parse::<SocketAddr>() {
                    Ok(addr) => {
                        debug!(%addr, %peer, "tcpshield reported client address");
                        client_addr = addr;
                    }
                    Err(err) => {
                        debug!(%real_ip, %peer, error = %err, "ignoring unparseable tcpshield client address");
                    }
                }
            }
        }

        let Some((backend, guard)) = self.strategies.select(route) else {
            debug!(%host, "route has no backends");
            return self.serve_fallback(client, &config, route, &handshake).await;
        };

        let (backend_host, backend_port) = split_host_port(&backend);
        let upstream = timeout(
            config.connection_timeout,
            TcpStream::connect((backend_host.as_str(), backend_port)),
        )
        .await;
        let mut upstream = match upstream {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                drop(guard);
                let err = ProxyError::Transport {
                    backend: backend.clone(),
                    source,
                };
                return self.dial_failed(client, &config, route, &handshake, err).await;
            }
            Err(_) => {
                drop(guard);
                let err = ProxyError::TransportTimeout {
                    backend: backend.clone(),
                    stage: "connect",
                };
                return self.dial_failed(client, &config, route, &handshake, err).await;
            }
        };

        if route.proxy_protocol {
            write_proxy_protocol_header(&mut upstream, client_addr)
                .await
                .map_err(|source| ProxyError::Transport {
                    backend: backend.clone(),
                    source,
                })?;
        }

        let replayed = if route.modify_virtual_host {
            Handshake {
                server_address: backend_host.clone(),
                port: backend_port,
                ..handshake
            }
        } else {
            handshake
        };
        packet::write_frame(&mut upstream, packet::HANDSHAKE_ID, &replayed.encode())
            .await
            .map_err(|source| ProxyError::Transport {
                backend: backend.clone(),
                source,
            })?;

        debug!(%host, %backend, %peer, "forwarding connection");
        if let Err(err) = copy_bidirectional(&mut client, &mut upstream).await {
            debug!(%backend, error = %err, "splice ended with error");
        }
        drop(guard);
        Ok(())
    }

    async fn dial_failed(
        &self,
        client: TcpStream,
        config: &Config,
        route: &RouteConfig,
        handshake: &Handshake,
        err: ProxyError,
    ) -> Result<(), ProxyError> {
        if dial_log_level(&err) == Level::DEBUG {
            debug!(error = %err, "failed to dial lite backend");
        } else {
            info!(error = %err, "failed to dial lite backend");
        }
        if handshake.next_state == packet::STATUS_NEXT_STATE && route.fallback.is_some() {
            return self.serve_fallback(client, config, route, handshake).await;
        }
        Err(err)
    }

    /// Serves the route's static fallback status to a pinging client.
    async fn serve_fallback(
        &self,
        mut client: TcpStream,
        config: &Config,
        route: &RouteConfig,
        handshake: &Handshake,
    ) -> Result<(), ProxyError> {
        if handshake.next_state != packet::STATUS_NEXT_STATE {
            return Ok(());
        }
        let Some(fallback) = &route.fallback else {
            return Ok(());
        };
        let document = StatusDocument {
            version: fallback
                .version
                .as_ref()
                .map(|version| StatusVersion {
                    name: version.name.clone(),
                    protocol: version.protocol,
                })
                .unwrap_or(StatusVersion {
                    name: config.motd.version_name.clone(),
                    protocol: handshake.protocol,
                }),
            players: fallback.players.as_ref().map(|players| StatusPlayers {
                max: players.max,
                online: players.online,
                sample: None,
            }),
            description: fallback
                .motd
                .clone()
                .unwrap_or_else(|| config.motd.description.clone()),
            favicon: fallback.favicon.clone(),
        };
        let status = serde_json::to_string(&document)
            .map_err(|err| ProxyError::Internal(err.to_string()))?;

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
        let response = StatusResponse { status };
        packet::write_frame(&mut client, packet::STATUS_RESPONSE_ID, &response.encode())
            .await
            .map_err(io_err)?;

        // optional ping/pong exchange
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
}

/// PROXY protocol v1 preamble announcing the real client address.
async fn write_proxy_protocol_header(
    upstream: &mut TcpStream,
    client: SocketAddr,
) -> std::io::Result<()> {
    let local = upstream.local_addr()?;
    let family = if client.is_ipv4() { "TCP4" } else { "TCP6" };
    let header = format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        client.ip(),
        local.ip(),
        client.port(),
        local.port()
    );
    upstream.write_all(header.as_bytes()).await
}
