//! UDP responder letting clients on the local network find the coordinator.
//!
//! A client broadcasts [`DISCOVERY_REQUEST`] and the coordinator answers with
//! `SERVER_FOUND:<tcp port>`.

use std::{io, net::SocketAddr, time::Duration};

use tokio::net::UdpSocket;

pub const DISCOVERY_REQUEST: &str = "ANDROID_CLIENT_DISCOVERY";
pub const DISCOVERY_REPLY_PREFIX: &str = "SERVER_FOUND:";

/// Pause after a failed receive before reading from the socket again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct DiscoveryResponder {
    socket: UdpSocket,
    tcp_port: u16,
}

impl DiscoveryResponder {
    /// Binds the responder. `tcp_port` is the port advertised to clients.
    pub async fn bind(address: &str, tcp_port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self { socket, tcp_port })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self) {
        let reply = format!("{}{}", DISCOVERY_REPLY_PREFIX, self.tcp_port);
        let mut buf = [0u8; 1024];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("discovery: receive failed: {}", e);
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                    continue;
                }
            };
            if String::from_utf8_lossy(&buf[..n]).trim() != DISCOVERY_REQUEST {
                debug!("discovery: ignoring datagram from {}", from);
                continue;
            }
            info!("discovery request from {}", from);
            if let Err(e) = self.socket.send_to(reply.as_bytes(), from).await {
                warn!("discovery: cannot reply to {}: {}", from, e);
            }
        }
    }
}
