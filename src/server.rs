use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{DHCP_SERVER_PORT, Engine, Reply};
use crate::error::{Error, Result};

const RECV_BUFFER_SIZE: usize = 1500;

/// UDP front end: one task per datagram, replies sent from the same socket.
pub struct DhcpServer {
    engine: Arc<Engine>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub fn new(config: &Config, engine: Engine) -> Result<Self> {
        let socket = Self::create_socket(config)?;
        info!(
            "DHCP server on {}:{} advertising {}",
            config.listen_ip, DHCP_SERVER_PORT, config.server_ip
        );
        Ok(Self::with_socket(socket, engine))
    }

    /// Wraps an already bound socket.
    pub fn with_socket(socket: UdpSocket, engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            socket: Arc::new(socket),
        }
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
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

        let bind_addr = SocketAddrV4::new(config.listen_ip, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        if let Some(interface_index) = config.interface_index {
            #[cfg(windows)]
            if let Err(error) = pin_outbound_interface(&socket, interface_index) {
                warn!("Replies not pinned to interface {}: {}", interface_index, error);
            }
            #[cfg(not(windows))]
            {
                warn!(
                    "interface_index ({}) is only supported on Windows and will be ignored",
                    interface_index
                );
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let engine = Arc::clone(&self.engine);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        let Some(reply) = process(&engine, &data, source).await else {
                            return;
                        };
                        let encoded = reply.packet.encode();
                        if let Err(error) = socket.send_to(&encoded, reply.target).await {
                            warn!("Failed to send reply to {}: {}", reply.target, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

/// Runs the engine on one datagram and logs whatever went wrong.
async fn process(engine: &Engine, data: &[u8], source: SocketAddr) -> Option<Reply> {
    match engine.handle(data).await {
        Ok(reply) => reply,
        Err(Error::InvalidPacket(reason)) => {
            warn!("Malformed packet from {}: {}", source, reason);
            None
        }
        Err(Error::UnsupportedMessageType(reason)) => {
            info!("Not answering {}", reason);
            None
        }
        Err(Error::StoreUnavailable(reason)) => {
            error!("Dropping packet from {}, store unavailable: {}", source, reason);
            None
        }
        Err(error) => {
            warn!("Error handling packet from {}: {}", source, error);
            None
        }
    }
}

/// Sends broadcast replies out of one interface (`IP_UNICAST_IF`).
#[cfg(windows)]
fn pin_outbound_interface(socket: &Socket, index: u32) -> std::io::Result<()> {
    use std::os::windows::io::AsRawSocket;
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_UNICAST_IF: i32 = 31;

    // Network byte order for IPv4.
    let value = index.to_be_bytes();
    let status = unsafe {
        setsockopt(
            socket.as_raw_socket() as SOCKET,
            IPPROTO_IP,
            IP_UNICAST_IF,
            value.as_ptr(),
            value.len() as i32,
        )
    };

    if status == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
