//! DHCP options as defined in RFC 2132, plus domain search (RFC 3397).
//!
//! Each option is a code byte, a length byte and the data. Options this
//! server does not interpret are kept as [`DhcpOption::Unknown`].
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)
//! - RFC 3396: Encoding Long Options
//! - RFC 3397: Domain Search Option (Option 119)

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Option data is limited to 255 bytes, so at most 63 IPv4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

const MAX_OPTION_DATA: usize = 255;

/// Longest DNS label (RFC 1035 §2.3.4).
const MAX_LABEL_LEN: usize = 63;

/// Option codes this server reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    BroadcastAddress = 28,
    NtpServers = 42,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    DomainSearch = 119,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            12 => Self::Hostname,
            28 => Self::BroadcastAddress,
            42 => Self::NtpServers,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            52 => Self::OptionOverload,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            61 => Self::ClientIdentifier,
            82 => Self::RelayAgentInfo,
            119 => Self::DomainSearch,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// Option overload flags (Option 52), RFC 2132 §9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    /// Client hostname (Option 12). Doubles as the client identity token.
    Hostname(String),
    BroadcastAddress(Ipv4Addr),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds (Option 51).
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    /// Echoed back verbatim to the relay (RFC 3046).
    RelayAgentInfo(Vec<u8>),
    /// Domain search list (Option 119), one entry per domain.
    DomainSearch(Vec<String>),
    Unknown(u8, Vec<u8>),
}

fn invalid(what: &str) -> Error {
    Error::InvalidPacket(format!("Invalid {} length", what))
}

fn parse_addr(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().map_err(|_| invalid(what))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_addr_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(invalid(what));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| invalid(what))?;
    Ok(u32::from_be_bytes(bytes))
}

fn parse_single_byte(data: &[u8], what: &str) -> Result<u8> {
    match data {
        [byte] => Ok(*byte),
        _ => Err(invalid(what)),
    }
}

/// Decodes RFC 1035 wire-format names, following compression pointers
/// within the option data.
fn parse_domain_list(data: &[u8]) -> Result<Vec<String>> {
    let mut domains = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (name, next) = read_name(data, offset)?;
        if !name.is_empty() {
            domains.push(name);
        }
        offset = next;
    }
    Ok(domains)
}

fn read_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut resume_at = None;
    let mut jumps = 0;

    loop {
        let Some(&len) = data.get(offset) else {
            return Err(Error::InvalidPacket("Domain search name truncated".to_string()));
        };

        if len & 0xC0 == 0xC0 {
            let Some(&low) = data.get(offset + 1) else {
                return Err(Error::InvalidPacket("Domain search pointer truncated".to_string()));
            };
            jumps += 1;
            if jumps > data.len() {
                return Err(Error::InvalidPacket("Domain search pointer loop".to_string()));
            }
            resume_at.get_or_insert(offset + 2);
            offset = (((len & 0x3F) as usize) << 8) | low as usize;
            continue;
        }

        if len == 0 {
            let next = resume_at.unwrap_or(offset + 1);
            return Ok((labels.join("."), next));
        }

        let len = len as usize;
        let label = data
            .get(offset + 1..offset + 1 + len)
            .ok_or_else(|| Error::InvalidPacket("Domain search label truncated".to_string()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }
}

fn encode_domain_list(domains: &[String]) -> Vec<u8> {
    let mut data = Vec::new();
    for domain in domains {
        for label in domain.split('.').filter(|label| !label.is_empty()) {
            let bytes = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
            data.push(bytes.len() as u8);
            data.extend_from_slice(bytes);
        }
        data.push(0);
    }
    data
}

fn encode_addrs(code: OptionCode, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let count = addrs.len().min(MAX_ADDRESSES_PER_OPTION);
    let mut result = vec![code as u8, (count * 4) as u8];
    for addr in &addrs[..count] {
        result.extend_from_slice(&addr.octets());
    }
    result
}

fn encode_bytes(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(MAX_OPTION_DATA);
    let mut result = vec![code, len as u8];
    result.extend_from_slice(&data[..len]);
    result
}

/// Splits data longer than one option into consecutive instances of the
/// same code (RFC 3396).
fn encode_long(code: u8, data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return vec![code, 0];
    }
    let mut result = Vec::with_capacity(data.len() + 2 * data.len().div_ceil(MAX_OPTION_DATA));
    for chunk in data.chunks(MAX_OPTION_DATA) {
        result.push(code);
        result.push(chunk.len() as u8);
        result.extend_from_slice(chunk);
    }
    result
}

impl DhcpOption {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::NtpServers(_) => OptionCode::NtpServers,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::DomainSearch(_) => OptionCode::DomainSearch,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses an option from its code and data (without the length byte).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length or content is
    /// invalid for the option type.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Self::SubnetMask(parse_addr(data, "subnet mask")?),
            Ok(OptionCode::Router) => Self::Router(parse_addr_list(data, "router option")?),
            Ok(OptionCode::DnsServer) => {
                Self::DnsServer(parse_addr_list(data, "DNS server option")?)
            }
            Ok(OptionCode::Hostname) => {
                Self::Hostname(String::from_utf8_lossy(data).into_owned())
            }
            Ok(OptionCode::BroadcastAddress) => {
                Self::BroadcastAddress(parse_addr(data, "broadcast address")?)
            }
            Ok(OptionCode::NtpServers) => {
                Self::NtpServers(parse_addr_list(data, "NTP server option")?)
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(parse_addr(data, "requested IP address")?)
            }
            Ok(OptionCode::LeaseTime) => Self::LeaseTime(parse_u32(data, "lease time")?),
            Ok(OptionCode::OptionOverload) => {
                let value = parse_single_byte(data, "option overload")?;
                let flag = OverloadFlag::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                })?;
                Self::OptionOverload(flag)
            }
            Ok(OptionCode::MessageType) => {
                let value = parse_single_byte(data, "message type")?;
                let message_type = MessageType::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(parse_addr(data, "server identifier")?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::ClientIdentifier) => Self::ClientIdentifier(data.to_vec()),
            Ok(OptionCode::RelayAgentInfo) => Self::RelayAgentInfo(data.to_vec()),
            Ok(OptionCode::DomainSearch) => Self::DomainSearch(parse_domain_list(data)?),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
            Err(unknown_code) => Self::Unknown(unknown_code, data.to_vec()),
        };
        Ok(option)
    }

    /// Encodes the option to wire format (code + length + data).
    ///
    /// Domain search lists longer than 255 bytes come out as several
    /// consecutive options of the same code.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => encode_bytes(code, &addr.octets()),
            Self::Router(addrs) => encode_addrs(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => encode_addrs(OptionCode::DnsServer, addrs),
            Self::NtpServers(addrs) => encode_addrs(OptionCode::NtpServers, addrs),
            Self::Hostname(name) => encode_bytes(code, name.as_bytes()),
            Self::LeaseTime(seconds) => encode_bytes(code, &seconds.to_be_bytes()),
            Self::OptionOverload(flag) => vec![code, 1, *flag as u8],
            Self::MessageType(message_type) => vec![code, 1, *message_type as u8],
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::RelayAgentInfo(data)
            | Self::Unknown(_, data) => encode_bytes(code, data),
            Self::DomainSearch(domains) => encode_long(code, &encode_domain_list(domains)),
        }
    }
}
