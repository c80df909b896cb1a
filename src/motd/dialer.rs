//! Short-lived status dialog against a backend server.

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::error::ProxyError;
use crate::protocol::packet::{self, Handshake, StatusResponse};

/// Default Minecraft server port.
pub const DEFAULT_PORT: u16 = 25565;

/// Splits "host[:port]" into host and port, defaulting the port.
pub fn split_host_port(address: &str) -> (String, u16) {
    if let Some((host, port)) = address.rsplit_once(':') {
        // a second colon in the host part means a bare IPv6 address
        if !host.is_empty() && !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        if let Some(bracketed) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            if let Ok(port) = port.parse::<u16>() {
                return (bracketed.to_string(), port);
            }
        }
    }
    (address.to_string(), DEFAULT_PORT)
}

/// Performs bounded Minecraft status handshakes. Each dialog owns its socket;
/// the connection is closed on every exit path.
#[derive(Debug, Clone, Copy)]
pub struct StatusDialer {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl StatusDialer {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    /// Dials the backend, performs the status handshake and returns its
    /// status response. Errors are wrapped with the backend's name; the
    /// caller does not retry.
    pub async fn fetch_status(
        &self,
        server_name: &str,
        address: &str,
        protocol: i32,
    ) -> Result<StatusResponse, ProxyError> {
        let (host, port) = split_host_port(address);
        let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                backend: server_name.to_string(),
                stage: "connect",
            })?
            .map_err(|source| ProxyError::Transport {
                backend: server_name.to_string(),
                source,
            })?;

        match timeout(self.read_timeout, status_dialog(stream, &host, port, protocol)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) if source.kind() == io::ErrorKind::InvalidData => {
                Err(ProxyError::ProtocolDecode {
                    backend: server_name.to_string(),
                    source,
                })
            }
            Ok(Err(source)) => Err(ProxyError::Transport {
                backend: server_name.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::TransportTimeout {
                backend: server_name.to_string(),
                stage: "status dialog",
            }),
        }
    }
}

async fn status_dialog(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    protocol: i32,
) -> io::Result<StatusResponse> {
    let handshake = Handshake {
        protocol,
        server_address: host.to_string(),
        port,
        next_state: packet::STATUS_NEXT_STATE,
    };
    packet::write_frame(&mut stream, packet::HANDSHAKE_ID, &handshake.encode()).await?;
    packet::write_frame(&mut stream, packet::STATUS_REQUEST_ID, &[]).await?;

    loop {
        let (id, mut body) = packet::read_frame(&mut stream).await?;
        if id == packet::STATUS_RESPONSE_ID {
            return StatusResponse::decode(&mut body);
        }
        trace!(packet_id = id, "discarding non-status packet from backend");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("mc.example.com:25566"), ("mc.example.com".into(), 25566));
        assert_eq!(split_host_port("mc.example.com"), ("mc.example.com".into(), DEFAULT_PORT));
        assert_eq!(split_host_port("127.0.0.1:1234"), ("127.0.0.1".into(), 1234));
    }

    #[test]
    fn leaves_bare_ipv6_alone() {
        assert_eq!(split_host_port("::1"), ("::1".into(), DEFAULT_PORT));
        assert_eq!(split_host_port("[::1]:25566"), ("::1".into(), 25566));
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        assert_eq!(
            split_host_port("mc.example.com:notaport"),
            ("mc.example.com:notaport".into(), DEFAULT_PORT)
        );
    }
}
