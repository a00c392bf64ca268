//! UDP drivers for the sans-IO state machines.
//!
//! Each service owns its socket and its state machine and runs as a single
//! task: datagrams, timers and shutdown are all branches of one
//! `tokio::select!`, so the state machine never sees concurrent calls.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::{ClientAction, DhcpClient};
use crate::error::{Error, Result};
use crate::packet::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, Transmit};
use crate::server::DhcpServer;

const RECV_BUFFER_SIZE: usize = 1500;

/// Binds a broadcast-capable UDP socket on `0.0.0.0:port`.
pub fn create_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

async fn send(socket: &UdpSocket, transmit: &Transmit) {
    if let Err(error) = socket
        .send_to(&transmit.payload, transmit.destination)
        .await
    {
        warn!("Failed to send to {}: {}", transmit.destination, error);
    }
}

/// Serves one [`DhcpServer`] on a UDP socket.
pub struct ServerService {
    server: DhcpServer,
    socket: UdpSocket,
    sweep_interval: Duration,
}

impl ServerService {
    pub fn new(server: DhcpServer, socket: UdpSocket) -> Self {
        let sweep_interval = Duration::from_secs(u64::from(server.config().sweep_interval));
        Self {
            server,
            socket,
            sweep_interval,
        }
    }

    /// Binds the DHCP server port (67).
    pub fn bind(server: DhcpServer) -> Result<Self> {
        let socket = create_socket(DHCP_SERVER_PORT)?;
        Ok(Self::new(server, socket))
    }

    pub fn server(&self) -> &DhcpServer {
        &self.server
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until `shutdown` completes, then closes the server and hands it
    /// back so the caller can snapshot its leases.
    pub async fn run<F>(mut self, shutdown: F) -> Result<DhcpServer>
    where
        F: Future<Output = ()>,
    {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "DHCP server ready on {} ({} - {})",
            self.local_addr()?,
            self.server.config().range.0,
            self.server.config().range.1
        );

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => self.handle(&buffer[..size], source).await,
                    Err(error) => error!("Error receiving packet: {}", error),
                },
                _ = sweep.tick() => {
                    let expired = self.server.sweep(Utc::now());
                    if !expired.is_empty() {
                        info!("Reclaimed {} expired lease(s)", expired.len());
                    }
                }
                () = &mut shutdown => {
                    info!("Received shutdown signal, stopping server...");
                    self.server.close();
                    break;
                }
            }
        }

        Ok(self.server)
    }

    async fn handle(&mut self, data: &[u8], source: SocketAddr) {
        match self.server.handle_datagram(data, Utc::now()) {
            Ok(Some(response)) => send(&self.socket, &response.transmit).await,
            Ok(None) => {}
            Err(Error::Decode(error)) => {
                debug!("Dropping malformed packet from {}: {}", source, error);
            }
            Err(error) => warn!("Error handling packet from {}: {}", source, error),
        }
    }
}

/// Runs one [`DhcpClient`] on a UDP socket.
pub struct ClientService {
    client: DhcpClient,
    socket: UdpSocket,
}

impl ClientService {
    pub fn new(client: DhcpClient, socket: UdpSocket) -> Self {
        Self { client, socket }
    }

    /// Binds the DHCP client port (68).
    pub fn bind(client: DhcpClient) -> Result<Self> {
        let socket = create_socket(DHCP_CLIENT_PORT)?;
        Ok(Self::new(client, socket))
    }

    pub fn client(&self) -> &DhcpClient {
        &self.client
    }

    /// Starts discovery and runs until `shutdown` completes. A RELEASE
    /// produced by [`DhcpClient::close`] is sent before returning.
    pub async fn run<F>(mut self, shutdown: F) -> Result<DhcpClient>
    where
        F: Future<Output = ()>,
    {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        tokio::pin!(shutdown);

        let discover = self.client.send_discover(Instant::now())?;
        send(&self.socket, &discover).await;

        loop {
            let deadline = self.client.next_deadline();

            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => {
                        match self.client.handle_datagram(&buffer[..size], Instant::now()) {
                            Ok(actions) => self.perform(actions).await?,
                            Err(error) => debug!("Dropping packet from {}: {}", source, error),
                        }
                    }
                    Err(error) => error!("Error receiving packet: {}", error),
                },
                () = wait_for(deadline) => {
                    let actions = self.client.on_timeout(Instant::now());
                    self.perform(actions).await?;
                }
                () = &mut shutdown => {
                    if let Some(release) = self.client.close(Instant::now()) {
                        send(&self.socket, &release).await;
                    }
                    break;
                }
            }
        }

        Ok(self.client)
    }

    async fn perform(&mut self, actions: Vec<ClientAction>) -> Result<()> {
        for action in actions {
            match action {
                ClientAction::Send(transmit) => send(&self.socket, &transmit).await,
                ClientAction::Bound(lease) => {
                    info!(
                        "Lease {} from {}: mask {:?}, routers {:?}, dns {:?}, {}s",
                        lease.ip,
                        lease.server_id,
                        lease.subnet_mask,
                        lease.routers,
                        lease.dns_servers,
                        lease.lease_time
                    );
                }
                ClientAction::Deconfigure(ip) => info!("Lost lease on {}", ip),
                ClientAction::Restart => {
                    let discover = self.client.send_discover(Instant::now())?;
                    send(&self.socket, &discover).await;
                }
            }
        }
        Ok(())
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::codec::OptionCodec;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::options::MessageType;
    use crate::packet::{DhcpPacket, MacAddr};

    async fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_socket_ephemeral_port() {
        let socket = create_socket(0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_server_service_handles_and_stops() {
        let server = DhcpServer::new(ServerConfig::default(), OptionCodec::standard()).unwrap();
        let service = ServerService::new(server, loopback().await);
        let address = service.local_addr().unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(service.run(async {
            let _ = stopped.await;
        }));

        let peer = loopback().await;
        let mac = MacAddr([0x02, 0, 0, 0, 0, 0x77]);
        peer.send_to(&[0xde, 0xad], address).await.unwrap();
        let discover = DhcpPacket::request(MessageType::Discover, 0x1234, mac);
        peer.send_to(&discover.encode(), address).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.send(()).unwrap();

        let server = task.await.unwrap().unwrap();
        assert!(server.pool().lease_for_mac(mac).is_some());
        assert!(server.transaction(0x1234).is_none());
    }

    #[tokio::test]
    async fn test_client_service_stops_in_init() {
        let client = DhcpClient::new(ClientConfig::default(), OptionCodec::standard()).unwrap();
        let service = ClientService::new(client, loopback().await);

        let client = service
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Init);
        assert!(client.next_deadline().is_none());
    }
}
