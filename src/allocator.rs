//! First-use allocation from the shared dynamic pool.
//!
//! The pool is one hash mapping candidate IP → owner MAC, empty when free.
//! Candidates are tried in ascending address order and each claim is an
//! atomic conditional write at the store, so two allocators racing for the
//! same entry cannot both win: the loser moves on to the next free entry.

use std::net::Ipv4Addr;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Role;
use crate::error::{Error, Result};
use crate::store::{DynStore, POOL_KEY, mac_key};

/// Whether this instance may create new dynamic bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    pub role: Role,
    pub allow_standby: bool,
}

impl AllocationPolicy {
    pub fn active() -> Self {
        Self {
            role: Role::Active,
            allow_standby: false,
        }
    }

    pub fn permits(&self) -> bool {
        self.role == Role::Active || self.allow_standby
    }
}

/// Outcome of a pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Claimed(Ipv4Addr),
    /// The policy gate said no; nothing was written.
    Refused,
    /// Every pool entry already has an owner.
    Exhausted,
}

impl Allocation {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Claimed(ip) => Some(*ip),
            _ => None,
        }
    }
}

pub struct Allocator {
    store: DynStore,
}

impl Allocator {
    pub fn new(store: DynStore) -> Self {
        Self { store }
    }

    /// Claims a free pool entry for `mac` and writes its `mac:<mac>` binding.
    pub async fn allocate(
        &self,
        mac: &str,
        client: &str,
        policy: AllocationPolicy,
    ) -> Result<Allocation> {
        if !policy.permits() {
            info!("Standby without override, not allocating for {}", mac);
            return Ok(Allocation::Refused);
        }

        if mac.is_empty() {
            warn!("Refusing dynamic allocation without a hardware address");
            return Ok(Allocation::Refused);
        }

        let pool = self.store.get_all(POOL_KEY).await?;

        let mut candidates: Vec<(Ipv4Addr, &str)> = Vec::with_capacity(pool.len());
        for (address, owner) in &pool {
            match address.parse::<Ipv4Addr>() {
                Ok(ip) => candidates.push((ip, owner.as_str())),
                Err(_) => warn!("Skipping pool entry {:?}: not an IPv4 address", address),
            }
        }
        candidates.sort_by_key(|(ip, _)| u32::from(*ip));

        // A previous claim whose binding write never landed.
        let owned = candidates
            .iter()
            .find(|(_, owner)| *owner == mac)
            .map(|(ip, _)| *ip);

        let ip = match owned {
            Some(ip) => {
                debug!("{} already owns pool entry {}", mac, ip);
                ip
            }
            None => match self.claim_first_free(&candidates, mac).await? {
                Some(ip) => ip,
                None => {
                    warn!("Pool exhausted, cannot allocate for {}", mac);
                    return Ok(Allocation::Exhausted);
                }
            },
        };

        let key = mac_key(mac);
        if !self
            .store
            .set_field_if_absent(&key, "ip", &ip.to_string())
            .await?
        {
            return self.settle_lost_race(mac, &key, ip).await;
        }

        let fields = [
            ("description", format!("dynamic:{}", client)),
            ("dynamic", "1".to_string()),
            ("ts", Utc::now().timestamp().to_string()),
        ];
        self.store.set_fields(&key, &fields).await?;

        info!("Allocated {} to {} from pool", ip, mac);

        Ok(Allocation::Claimed(ip))
    }

    /// Another request for the same MAC wrote the binding first. Its address
    /// stands; the entry this request claimed goes back to the pool.
    async fn settle_lost_race(
        &self,
        mac: &str,
        key: &str,
        claimed: Ipv4Addr,
    ) -> Result<Allocation> {
        let bound = self.store.get_field(key, "ip").await?;
        let winner = bound.as_deref().and_then(|ip| ip.parse::<Ipv4Addr>().ok());

        if winner != Some(claimed) {
            self.store
                .release_field(POOL_KEY, &claimed.to_string(), mac)
                .await?;
            debug!("Released {} after concurrent allocation for {}", claimed, mac);
        }

        match winner {
            Some(ip) => Ok(Allocation::Claimed(ip)),
            None => Err(Error::invalid_record(
                key,
                "ip",
                format!("{:?} is not an IPv4 address", bound.unwrap_or_default()),
            )),
        }
    }

    async fn claim_first_free(
        &self,
        candidates: &[(Ipv4Addr, &str)],
        mac: &str,
    ) -> Result<Option<Ipv4Addr>> {
        for (ip, owner) in candidates {
            if !owner.is_empty() {
                continue;
            }
            if self.store.claim_field(POOL_KEY, &ip.to_string(), mac).await? {
                return Ok(Some(*ip));
            }
            debug!("Pool entry {} was claimed concurrently, trying next", ip);
        }
        Ok(None)
    }
}
