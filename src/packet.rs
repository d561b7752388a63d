//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet is a fixed 236-byte BOOTP header, the 4-byte magic cookie
//! and a variable-length option area.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! |                          yiaddr (4)                           |
//! |                          siaddr (4)                           |
//! |                          giaddr (4)                           |
//! |                          chaddr (16)                          |
//! |                          sname (64)                           |
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const SNAME_OFFSET: usize = CHADDR_OFFSET + 16;
const FILE_OFFSET: usize = SNAME_OFFSET + 64;
const MAGIC_COOKIE_OFFSET: usize = FILE_OFFSET + 128;

/// Size of the fixed header portion including magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Replies are padded to the 300-byte BOOTP minimum for relay compatibility.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Minimum datagram every host must accept (RFC 791).
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Relay loop protection (RFC 2131 §4.1).
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;

pub const HLEN_ETHERNET: u8 = 6;

/// A parsed DHCP packet, either a client request or a reply being built.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 is the broadcast flag.
    pub flags: u16,
    /// Client IP, set by a client that already has an address.
    pub ciaddr: Ipv4Addr,
    /// "Your" IP: the address being handed out.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

fn addr_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

impl DhcpPacket {
    /// Parses a DHCP packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the packet is shorter than the
    /// fixed header, the magic cookie is wrong, the hop count exceeds 16,
    /// an Ethernet hlen is not 6, or the option area is malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let [op, htype, hlen, hops] = [data[0], data[1], data[2], data[3]];

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..SNAME_OFFSET]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[SNAME_OFFSET..FILE_OFFSET]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[FILE_OFFSET..MAGIC_COOKIE_OFFSET]);

        let mut options = Self::parse_options(&data[DHCP_FIXED_HEADER_SIZE..])?;

        let overload = options.iter().find_map(|option| match option {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                options.extend(Self::parse_options(&file)?);
            }
            if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                options.extend(Self::parse_options(&sname)?);
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: addr_at(data, 12),
            yiaddr: addr_at(data, 16),
            siaddr: addr_at(data, 20),
            giaddr: addr_at(data, 24),
            chaddr,
            sname,
            file,
            options,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while let Some(&code) = data.get(index) {
            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }
            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };
            let start = index + 2;
            let end = start + length as usize;
            let Some(option_data) = data.get(start..end) else {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            };

            options.push(DhcpOption::parse(code, option_data)?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes the packet for transmission, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&addr.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }

        packet
    }

    /// Starts a reply to `request` with no options set.
    ///
    /// Copies `xid`, `flags`, `giaddr`, `chaddr`, `htype` and `hlen`.
    pub fn reply_to(request: &DhcpPacket) -> Self {
        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        }
    }

    /// Sets an option, replacing any existing option with the same code.
    ///
    /// The message type is kept first in the option list.
    pub fn set_option(&mut self, option: DhcpOption) {
        let code = option.option_code();
        if let Some(existing) = self
            .options
            .iter_mut()
            .find(|existing| existing.option_code() == code)
        {
            *existing = option;
        } else if code == OptionCode::MessageType as u8 {
            self.options.insert(0, option);
        } else {
            self.options.push(option);
        }
    }

    /// First option with the given code.
    pub fn option(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.options
            .iter()
            .find(|option| option.option_code() == code as u8)
    }

    /// Returns the DHCP message type (Option 53) if present.
    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(message_type)) => Some(*message_type),
            _ => None,
        }
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<&str> {
        match self.option(OptionCode::Hostname) {
            Some(DhcpOption::Hostname(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Returns the relay agent information (Option 82) if present.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        match self.option(OptionCode::RelayAgentInfo) {
            Some(DhcpOption::RelayAgentInfo(info)) => Some(info.as_slice()),
            _ => None,
        }
    }

    /// Formats the client hardware address as a colon-separated string.
    pub fn format_mac(&self) -> String {
        let len = (self.hlen as usize).min(self.chaddr.len());
        self.chaddr[..len]
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_packet(message_type: MessageType, hostname: Option<&[u8]>) -> Vec<u8> {
        let mut packet = vec![0u8; 350];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = 240;
        packet[index..index + 3].copy_from_slice(&[53, 1, message_type as u8]);
        index += 3;

        if let Some(name) = hostname {
            packet[index] = OptionCode::Hostname as u8;
            packet[index + 1] = name.len() as u8;
            packet[index + 2..index + 2 + name.len()].copy_from_slice(name);
            index += 2 + name.len();
        }

        packet[index] = OptionCode::End as u8;
        packet
    }

    #[test]
    fn test_parse_and_roundtrip() {
        let data = create_test_packet(MessageType::Discover, Some(b"laptop"));
        let packet = DhcpPacket::parse(&data).unwrap();

        assert_eq!(packet.op, BOOTREQUEST);
        assert_eq!(packet.xid, 0x12345678);
        assert!(packet.is_broadcast());
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert_eq!(packet.hostname(), Some("laptop"));
        assert_eq!(packet.format_mac(), "aa:bb:cc:dd:ee:ff");

        let reparsed = DhcpPacket::parse(&packet.encode()).unwrap();
        assert_eq!(reparsed.xid, packet.xid);
        assert_eq!(reparsed.hostname(), Some("laptop"));
    }

    #[test]
    fn test_invalid_packets() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
        assert!(DhcpPacket::parse(&[0u8; 239]).is_err());

        let bad_cookie = [0u8; 300];
        assert!(DhcpPacket::parse(&bad_cookie).is_err());
    }

    #[test]
    fn test_hlen_and_hops_validation() {
        let mut packet = create_test_packet(MessageType::Discover, None);
        packet[2] = 7;
        assert!(DhcpPacket::parse(&packet).is_err());
        packet[2] = HLEN_ETHERNET;

        packet[3] = 17;
        assert!(DhcpPacket::parse(&packet).is_err());
        packet[3] = 16;
        assert!(DhcpPacket::parse(&packet).is_ok());
    }

    #[test]
    fn test_truncated_options_rejected() {
        let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE + 4];
        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        packet[240] = OptionCode::LeaseTime as u8;
        packet[241] = 4;
        assert!(DhcpPacket::parse(&packet).is_err());

        packet.truncate(DHCP_FIXED_HEADER_SIZE + 1);
        assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn test_option_overload_sname() {
        let mut packet = create_test_packet(MessageType::Discover, None);
        packet[243..246].copy_from_slice(&[52, 1, 2]);
        packet[246] = OptionCode::End as u8;

        packet[44] = OptionCode::Hostname as u8;
        packet[45] = 9;
        packet[46..55].copy_from_slice(b"snamehost");
        packet[55] = OptionCode::End as u8;

        let parsed = DhcpPacket::parse(&packet).unwrap();
        assert_eq!(parsed.hostname(), Some("snamehost"));
    }

    #[test]
    fn test_reply_copies_request_fields() {
        let mut data = create_test_packet(MessageType::Discover, None);
        data[24..28].copy_from_slice(&[192, 168, 2, 1]);
        let request = DhcpPacket::parse(&data).unwrap();

        let reply = DhcpPacket::reply_to(&request);
        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.flags, request.flags);
        assert_eq!(reply.chaddr, request.chaddr);
        assert_eq!(reply.giaddr, Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(reply.options.is_empty());
    }

    #[test]
    fn test_set_option_replaces() {
        let request = DhcpPacket::parse(&create_test_packet(MessageType::Request, None)).unwrap();
        let mut reply = DhcpPacket::reply_to(&request);

        reply.set_option(DhcpOption::LeaseTime(60));
        reply.set_option(DhcpOption::MessageType(MessageType::Offer));
        reply.set_option(DhcpOption::LeaseTime(7200));
        reply.set_option(DhcpOption::MessageType(MessageType::Ack));

        assert_eq!(reply.options.len(), 2);
        assert_eq!(reply.options[0], DhcpOption::MessageType(MessageType::Ack));
        assert_eq!(
            reply.option(OptionCode::LeaseTime),
            Some(&DhcpOption::LeaseTime(7200))
        );
    }

    #[test]
    fn test_encode_offsets_and_padding() {
        let request = DhcpPacket::parse(&create_test_packet(MessageType::Discover, None)).unwrap();
        let mut reply = DhcpPacket::reply_to(&request);
        reply.yiaddr = Ipv4Addr::new(10, 0, 0, 5);
        reply.set_option(DhcpOption::MessageType(MessageType::Offer));

        let encoded = reply.encode();
        assert!(encoded.len() >= DHCP_MIN_PACKET_SIZE);
        assert_eq!(encoded[0], BOOTREPLY);
        assert_eq!(&encoded[4..8], &0x12345678u32.to_be_bytes());
        assert_eq!(&encoded[16..20], &[10, 0, 0, 5]);
        assert_eq!(&encoded[28..34], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&encoded[236..240], &DHCP_MAGIC_COOKIE);
        assert_eq!(&encoded[240..243], &[53, 1, 2]);
        assert_eq!(encoded[243], OptionCode::End as u8);
    }

    #[test]
    fn test_relay_agent_info_parsing() {
        let mut packet = create_test_packet(MessageType::Discover, None);
        packet[243..250].copy_from_slice(&[82, 5, 1, 2, 3, 4, 5]);
        packet[250] = OptionCode::End as u8;

        let parsed = DhcpPacket::parse(&packet).unwrap();
        assert_eq!(parsed.relay_agent_info(), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn test_unicast_flag() {
        let mut packet = create_test_packet(MessageType::Discover, None);
        packet[10..12].copy_from_slice(&0u16.to_be_bytes());
        assert!(!DhcpPacket::parse(&packet).unwrap().is_broadcast());
    }
}
