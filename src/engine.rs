//! DHCP protocol engine: classify, resolve, build the reply, pick a target.
//!
//! The engine holds no per-client state. Everything it knows about a client
//! comes from the [`LeaseSource`] on each packet, so any number of packets
//! can be handled concurrently.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::failover::{Decision, FailoverCoordinator};
use crate::model::{Identity, LeaseDescriptor, NoAddress};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::resolver::LeaseSource;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// An encoded-ready reply and where to send it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub packet: DhcpPacket,
    pub target: SocketAddrV4,
}

pub struct Engine {
    server_ip: Ipv4Addr,
    source: Arc<dyn LeaseSource>,
    failover: FailoverCoordinator,
}

impl Engine {
    pub fn new(
        server_ip: Ipv4Addr,
        source: Arc<dyn LeaseSource>,
        failover: FailoverCoordinator,
    ) -> Self {
        Self {
            server_ip,
            source,
            failover,
        }
    }

    /// Handles one inbound datagram.
    ///
    /// `Ok(None)` means the packet was understood and deliberately left
    /// unanswered (wrong opcode, standby with a live peer, a DISCOVER with
    /// no address to offer).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] and [`Error::UnsupportedMessageType`] for
    /// packets this server does not answer; resolution errors such as
    /// [`Error::StoreUnavailable`] are passed through unchanged.
    pub async fn handle(&self, data: &[u8]) -> Result<Option<Reply>> {
        let request = DhcpPacket::parse(data)?;

        if request.op != BOOTREQUEST {
            debug!("Ignoring packet with op {}", request.op);
            return Ok(None);
        }

        let reply_type = match request.message_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            Some(other) => {
                return Err(Error::UnsupportedMessageType(format!(
                    "{} from {}",
                    other,
                    request.format_mac()
                )));
            }
            None => {
                return Err(Error::UnsupportedMessageType(format!(
                    "no message type from {}",
                    request.format_mac()
                )));
            }
        };

        let allow_dynamic = match self.failover.decide().await {
            Decision::Respond { allow_dynamic } => allow_dynamic,
            Decision::Suppress => {
                debug!("Suppressed reply to {}", request.format_mac());
                return Ok(None);
            }
        };

        let identity = Identity::new(
            request.format_mac(),
            request.hostname().unwrap_or_default(),
        );
        let lease = self.source.resolve(&identity, allow_dynamic).await?;

        let packet = match (reply_type, lease.ip, lease.no_address) {
            (_, Some(_), _) => self.build_reply(&request, reply_type, &lease),
            (_, None, Some(NoAddress::Refused)) => {
                info!("Not allocating for {}, leaving it to the peer", identity.mac);
                return Ok(None);
            }
            (MessageType::Ack, None, _) => {
                info!("NAK to {}: no address via {}", identity.mac, lease.method);
                self.build_nak(&request)
            }
            _ => {
                info!("No address to offer {} (client {:?})", identity.mac, identity.client);
                return Ok(None);
            }
        };

        let message_type = packet.message_type().unwrap_or(reply_type);
        let target = reply_target(&request, message_type);
        if let Some(ip) = lease.ip {
            info!("{} {} to {} via {}", message_type, ip, identity.mac, lease.method);
        }

        Ok(Some(Reply { packet, target }))
    }

    /// Builds an OFFER or ACK carrying `lease`.
    pub fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        lease: &LeaseDescriptor,
    ) -> DhcpPacket {
        let mut reply = self.start_reply(request, message_type);

        if let Some(ip) = lease.ip {
            reply.yiaddr = ip;
        }
        reply.set_option(DhcpOption::LeaseTime(lease.lease_seconds()));
        if let Some(netmask) = lease.netmask {
            reply.set_option(DhcpOption::SubnetMask(netmask));
        }
        if let Some(broadcast) = lease.broadcast {
            reply.set_option(DhcpOption::BroadcastAddress(broadcast));
        }
        if let Some(gateway) = lease.gateway {
            reply.set_option(DhcpOption::Router(vec![gateway]));
        }
        if !lease.ntp.is_empty() {
            reply.set_option(DhcpOption::NtpServers(lease.ntp.clone()));
        }
        if !lease.domain.is_empty() {
            reply.set_option(DhcpOption::DomainSearch(lease.domain.clone()));
        }
        if !lease.dns.is_empty() {
            reply.set_option(DhcpOption::DnsServer(lease.dns.clone()));
        }

        reply
    }

    /// Builds a NAK: server identifier only, no address.
    pub fn build_nak(&self, request: &DhcpPacket) -> DhcpPacket {
        self.start_reply(request, MessageType::Nak)
    }

    fn start_reply(&self, request: &DhcpPacket, message_type: MessageType) -> DhcpPacket {
        let mut reply = DhcpPacket::reply_to(request);
        reply.set_option(DhcpOption::MessageType(message_type));
        reply.set_option(DhcpOption::ServerIdentifier(self.server_ip));
        if let Some(info) = request.relay_agent_info() {
            reply.set_option(DhcpOption::RelayAgentInfo(info.to_vec()));
        }
        reply
    }
}

/// Where a reply to `request` goes, per RFC 2131 §4.1.
pub fn reply_target(request: &DhcpPacket, reply_type: MessageType) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        return SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT);
    }
    if reply_type == MessageType::Nak {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);
    }
    if !request.ciaddr.is_unspecified() {
        return SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT);
    }
    if !request.is_broadcast() {
        info!(
            "Broadcasting to {}: unicast to an unconfigured client is not supported",
            request.format_mac()
        );
    }
    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
}
