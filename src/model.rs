//! Records read from the store and the lease descriptor built from them.
//!
//! Store hashes are decoded through explicit field tables. A field name
//! missing from the table, or a value that does not parse as the field's
//! type, is an [`Error::InvalidRecord`] rather than something to skip.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Who is asking: the hardware address and the client identity token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub client: String,
}

impl Identity {
    pub fn new(mac: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            client: client.into(),
        }
    }
}

/// Which precedence level produced the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionMethod {
    #[serde(rename = "ByClientID")]
    ByClientId,
    ByHardwareAddress,
    #[default]
    Dynamic,
}

impl std::fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByClientId => write!(f, "ByClientID"),
            Self::ByHardwareAddress => write!(f, "ByHardwareAddress"),
            Self::Dynamic => write!(f, "Dynamic"),
        }
    }
}

/// Why a lease carries no address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoAddress {
    /// Allocation was not permitted here, so another server may answer.
    Refused,
    /// The pool has no free entry.
    Exhausted,
}

/// A `client:<id>` or `mac:<addr>` hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingRecord {
    pub ip: Option<Ipv4Addr>,
    pub hostname: String,
    pub description: String,
    pub group: Option<String>,
    pub dynamic: bool,
    /// Unix seconds of the last lookup hit.
    pub last_seen: Option<i64>,
}

/// A `group:<name>` hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfig {
    pub gateway: Option<Ipv4Addr>,
    pub prefix: Option<u8>,
    pub dns: Vec<Ipv4Addr>,
    pub domain: Vec<String>,
    pub ntp: Vec<Ipv4Addr>,
    pub lease_time: Duration,
}

type Setter<T> = fn(&mut T, &str) -> std::result::Result<(), String>;

/// Binding field name → typed setter.
pub const BINDING_FIELDS: &[(&str, Setter<BindingRecord>)] = &[
    ("ip", set_binding_ip),
    ("hostname", set_binding_hostname),
    ("description", set_binding_description),
    ("group", set_binding_group),
    ("dynamic", set_binding_dynamic),
    ("ts", set_binding_ts),
];

/// Group field name → typed setter. `lease-time` is handled separately.
pub const GROUP_FIELDS: &[(&str, Setter<GroupConfig>)] = &[
    ("gateway", set_group_gateway),
    ("prefix", set_group_prefix),
    ("dns", set_group_dns),
    ("domain", set_group_domain),
    ("ntp", set_group_ntp),
];

pub const LEASE_TIME_FIELD: &str = "lease-time";

fn set_binding_ip(record: &mut BindingRecord, value: &str) -> std::result::Result<(), String> {
    record.ip = Some(parse_ip(value)?);
    Ok(())
}

fn set_binding_hostname(
    record: &mut BindingRecord,
    value: &str,
) -> std::result::Result<(), String> {
    record.hostname = value.to_string();
    Ok(())
}

fn set_binding_description(
    record: &mut BindingRecord,
    value: &str,
) -> std::result::Result<(), String> {
    record.description = value.to_string();
    Ok(())
}

fn set_binding_group(record: &mut BindingRecord, value: &str) -> std::result::Result<(), String> {
    record.group = Some(value.to_string());
    Ok(())
}

fn set_binding_dynamic(record: &mut BindingRecord, value: &str) -> std::result::Result<(), String> {
    record.dynamic = match value {
        "1" | "true" => true,
        "0" | "false" => false,
        other => return Err(format!("expected boolean, got {:?}", other)),
    };
    Ok(())
}

fn set_binding_ts(record: &mut BindingRecord, value: &str) -> std::result::Result<(), String> {
    let ts = value
        .parse::<i64>()
        .map_err(|error| format!("expected unix seconds: {}", error))?;
    record.last_seen = Some(ts);
    Ok(())
}

fn set_group_gateway(group: &mut GroupConfig, value: &str) -> std::result::Result<(), String> {
    group.gateway = Some(parse_ip(value)?);
    Ok(())
}

fn set_group_prefix(group: &mut GroupConfig, value: &str) -> std::result::Result<(), String> {
    let prefix = value
        .trim()
        .parse::<u8>()
        .map_err(|error| format!("expected prefix length: {}", error))?;
    if prefix > 32 {
        return Err(format!("prefix {} exceeds 32", prefix));
    }
    group.prefix = Some(prefix);
    Ok(())
}

fn set_group_dns(group: &mut GroupConfig, value: &str) -> std::result::Result<(), String> {
    group.dns = parse_ip_list(value)?;
    Ok(())
}

fn set_group_domain(group: &mut GroupConfig, value: &str) -> std::result::Result<(), String> {
    group.domain = split_list(value).map(str::to_string).collect();
    Ok(())
}

fn set_group_ntp(group: &mut GroupConfig, value: &str) -> std::result::Result<(), String> {
    group.ntp = parse_ip_list(value)?;
    Ok(())
}

fn parse_ip(value: &str) -> std::result::Result<Ipv4Addr, String> {
    value
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|error| format!("{:?} is not an IPv4 address: {}", value, error))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_ip_list(value: &str) -> std::result::Result<Vec<Ipv4Addr>, String> {
    split_list(value).map(parse_ip).collect()
}

fn apply_fields<T>(
    key: &str,
    hash: &HashMap<String, String>,
    table: &[(&str, Setter<T>)],
    target: &mut T,
    mut extra: impl FnMut(&str, &str) -> bool,
) -> Result<()> {
    for (field, value) in hash {
        if extra(field, value) {
            continue;
        }
        let Some((_, setter)) = table.iter().find(|(name, _)| *name == field.as_str()) else {
            return Err(Error::invalid_record(key, field, "unknown field"));
        };
        if value.is_empty() {
            continue;
        }
        setter(target, value).map_err(|reason| Error::invalid_record(key, field, reason))?;
    }
    Ok(())
}

impl BindingRecord {
    pub fn from_hash(key: &str, hash: &HashMap<String, String>) -> Result<Self> {
        let mut record = Self::default();
        apply_fields(key, hash, BINDING_FIELDS, &mut record, |_, _| false)?;
        Ok(record)
    }
}

impl GroupConfig {
    pub fn from_hash(key: &str, hash: &HashMap<String, String>) -> Result<Self> {
        let mut group = Self::default();
        let mut lease_time = Duration::ZERO;
        apply_fields(key, hash, GROUP_FIELDS, &mut group, |field, value| {
            if field != LEASE_TIME_FIELD {
                return false;
            }
            lease_time = parse_lease_time(value).unwrap_or_else(|| {
                warn!("{}: unparsable lease-time {:?}, using 0", key, value);
                Duration::ZERO
            });
            true
        })?;
        group.lease_time = lease_time;
        Ok(group)
    }

    pub fn netmask(&self) -> Option<Ipv4Addr> {
        self.prefix.map(prefix_mask)
    }

    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        match (self.gateway, self.prefix) {
            (Some(gateway), Some(prefix)) => Some(broadcast_address(gateway, prefix)),
            _ => None,
        }
    }
}

/// Netmask for a CIDR prefix length (clamped to 32).
pub fn prefix_mask(prefix: u8) -> Ipv4Addr {
    let prefix = prefix.min(32) as u32;
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ipv4Addr::from(mask)
}

/// `address` with every host bit set.
pub fn broadcast_address(address: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = u32::from(prefix_mask(prefix));
    Ipv4Addr::from(u32::from(address) | !mask)
}

/// Parses durations such as `2h`, `1h30m`, `90s`, `250ms` or `1.5h`.
///
/// A number needs a unit; a bare integer is rejected.
pub fn parse_lease_time(value: &str) -> Option<Duration> {
    let value = value.trim();
    humantime::parse_duration(value)
        .ok()
        .or_else(|| parse_fractional(value))
}

/// A single decimal amount with one unit, e.g. `1.5h` or `0.25s`.
fn parse_fractional(value: &str) -> Option<Duration> {
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = value.split_at(split);
    if !number.contains('.') {
        return None;
    }
    let seconds_per_unit = match unit {
        "h" => 3600.0,
        "m" => 60.0,
        "s" => 1.0,
        "ms" => 1e-3,
        _ => return None,
    };
    let number: f64 = number.parse().ok()?;
    Duration::try_from_secs_f64(number * seconds_per_unit).ok()
}

/// Network parameters resolved for one request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseDescriptor {
    pub mac: String,
    pub client: String,
    pub hostname: String,
    pub ip: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub prefix: Option<u8>,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub domain: Vec<String>,
    pub ntp: Vec<Ipv4Addr>,
    pub lease_time: Duration,
    pub description: String,
    pub method: ResolutionMethod,
    pub standby: bool,
    /// Set when `ip` is `None`.
    pub no_address: Option<NoAddress>,
}

impl LeaseDescriptor {
    /// Group parameters first, then binding fields on top.
    pub fn merge(
        identity: &Identity,
        method: ResolutionMethod,
        binding: &BindingRecord,
        group: &GroupConfig,
        standby: bool,
    ) -> Self {
        Self {
            mac: identity.mac.clone(),
            client: identity.client.clone(),
            hostname: binding.hostname.clone(),
            ip: binding.ip,
            gateway: group.gateway,
            prefix: group.prefix,
            netmask: group.netmask(),
            broadcast: group.broadcast(),
            dns: group.dns.clone(),
            domain: group.domain.clone(),
            ntp: group.ntp.clone(),
            lease_time: group.lease_time,
            description: binding.description.clone(),
            method,
            standby,
            no_address: None,
        }
    }

    /// Lease time in whole seconds, saturating at `u32::MAX`.
    pub fn lease_seconds(&self) -> u32 {
        u32::try_from(self.lease_time.as_secs()).unwrap_or(u32::MAX)
    }
}
