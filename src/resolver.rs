//! Address resolution: binding lookup, group selection and merge.
//!
//! Precedence is fixed: a `client:<id>` binding wins over a `mac:<addr>`
//! binding, which wins over dynamic allocation from the pool. A lookup that
//! finds nothing falls through silently; a store failure is returned as
//! `StoreUnavailable` and never mistaken for "not found".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, AllocationPolicy, Allocator};
use crate::config::Role;
use crate::error::Result;
use crate::model::{
    BindingRecord, GroupConfig, Identity, LeaseDescriptor, NoAddress, ResolutionMethod,
};
use crate::store::{DynStore, Store, client_key, group_key, mac_key};

pub const DEFAULT_GROUP: &str = "default";
pub const POOL_GROUP: &str = "pool";

/// Resolution interface used by the protocol engine.
///
/// `allow_dynamic` narrows the source's own allocation policy for a single
/// request; it can never widen it.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn resolve(&self, identity: &Identity, allow_dynamic: bool) -> Result<LeaseDescriptor>;
}

/// Snapshot of `group:default` and `group:pool`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDefaults {
    pub default: GroupConfig,
    pub pool: GroupConfig,
}

impl GroupDefaults {
    /// Reads both groups. Unknown fields fail here, at startup, rather than
    /// on the first request that needs them.
    pub async fn load(store: &dyn Store) -> Result<Self> {
        Ok(Self {
            default: load_group(store, DEFAULT_GROUP).await?,
            pool: load_group(store, POOL_GROUP).await?,
        })
    }
}

async fn load_group(store: &dyn Store, name: &str) -> Result<GroupConfig> {
    let key = group_key(name);
    let hash = store.get_all(&key).await?;
    if hash.is_empty() {
        warn!("{} is not provisioned, clients using it get no network parameters", key);
    }
    GroupConfig::from_hash(&key, &hash)
}

pub struct Resolver {
    store: DynStore,
    allocator: Allocator,
    defaults: RwLock<Arc<GroupDefaults>>,
    policy: AllocationPolicy,
}

impl Resolver {
    pub fn new(store: DynStore, defaults: GroupDefaults, policy: AllocationPolicy) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&store)),
            store,
            defaults: RwLock::new(Arc::new(defaults)),
            policy,
        }
    }

    /// Builds a resolver with group defaults read from the store.
    pub async fn load(store: DynStore, policy: AllocationPolicy) -> Result<Self> {
        let defaults = GroupDefaults::load(store.as_ref()).await?;
        Ok(Self::new(store, defaults, policy))
    }

    /// Re-reads the default and pool groups and swaps them in.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<()> {
        let fresh = GroupDefaults::load(self.store.as_ref()).await?;
        *self.defaults.write().await = Arc::new(fresh);
        info!("Reloaded default and pool groups");
        Ok(())
    }

    pub async fn defaults(&self) -> Arc<GroupDefaults> {
        Arc::clone(&*self.defaults.read().await)
    }

    pub async fn resolve_identity(
        &self,
        identity: &Identity,
        allow_dynamic: bool,
    ) -> Result<LeaseDescriptor> {
        let defaults = self.defaults().await;
        let standby = self.policy.role == Role::Standby;

        let found = match self.lookup(&identity.client, client_key).await? {
            Some(binding) => Some((ResolutionMethod::ByClientId, binding)),
            None => self
                .lookup(&identity.mac, mac_key)
                .await?
                .map(|binding| (ResolutionMethod::ByHardwareAddress, binding)),
        };

        let mut no_address = None;
        let (method, binding, group) = match found {
            Some((method, binding)) => {
                let group = match binding.group {
                    Some(ref name) => self.named_group(name).await?,
                    None => defaults.default.clone(),
                };
                (method, binding, group)
            }
            None => {
                let policy = if allow_dynamic {
                    self.policy
                } else {
                    AllocationPolicy {
                        role: Role::Standby,
                        allow_standby: false,
                    }
                };
                let allocation = self
                    .allocator
                    .allocate(&identity.mac, &identity.client, policy)
                    .await?;
                let binding = match allocation {
                    Allocation::Claimed(ip) => BindingRecord {
                        ip: Some(ip),
                        description: format!("dynamic:{}", identity.client),
                        dynamic: true,
                        ..Default::default()
                    },
                    Allocation::Refused => {
                        no_address = Some(NoAddress::Refused);
                        BindingRecord::default()
                    }
                    Allocation::Exhausted => {
                        no_address = Some(NoAddress::Exhausted);
                        BindingRecord::default()
                    }
                };
                (ResolutionMethod::Dynamic, binding, defaults.pool.clone())
            }
        };

        let mut lease = LeaseDescriptor::merge(identity, method, &binding, &group, standby);
        lease.no_address = no_address;
        debug!(
            "Resolved mac={:?} client={:?} via {} to {:?}",
            identity.mac, identity.client, method, lease.ip
        );
        Ok(lease)
    }

    async fn lookup(
        &self,
        id: &str,
        key_for: fn(&str) -> String,
    ) -> Result<Option<BindingRecord>> {
        if id.is_empty() {
            return Ok(None);
        }

        let key = key_for(id);
        let hash = self.store.get_all(&key).await?;
        if hash.is_empty() {
            return Ok(None);
        }

        let binding = BindingRecord::from_hash(&key, &hash)?;
        self.store
            .set_field(&key, "ts", &Utc::now().timestamp().to_string())
            .await?;
        Ok(Some(binding))
    }

    async fn named_group(&self, name: &str) -> Result<GroupConfig> {
        let key = group_key(name);
        let hash = self.store.get_all(&key).await?;
        if hash.is_empty() {
            warn!("Binding references missing {}", key);
        }
        GroupConfig::from_hash(&key, &hash)
    }
}

#[async_trait]
impl LeaseSource for Resolver {
    async fn resolve(&self, identity: &Identity, allow_dynamic: bool) -> Result<LeaseDescriptor> {
        self.resolve_identity(identity, allow_dynamic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{MemoryStore, POOL_KEY};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(
                "group:default",
                [
                    ("gateway", "10.0.0.1"),
                    ("prefix", "24"),
                    ("lease-time", "2h"),
                    ("dns", "10.0.0.53"),
                ],
            )
            .await;
        store
            .insert(
                "group:pool",
                [("gateway", "10.0.1.1"), ("prefix", "24"), ("lease-time", "10m")],
            )
            .await;
        store
            .insert(POOL_KEY, [("10.0.1.100", ""), ("10.0.1.101", "")])
            .await;
        store
    }

    async fn resolver(store: Arc<MemoryStore>, role: Role, allow_standby: bool) -> Resolver {
        Resolver::load(store, AllocationPolicy { role, allow_standby })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_id_wins_over_mac() {
        let store = seeded_store().await;
        store.insert("client:laptop", [("ip", "10.0.0.7")]).await;
        store.insert(&format!("mac:{}", MAC), [("ip", "10.0.0.8")]).await;
        let resolver = resolver(store.clone(), Role::Active, false).await;

        let lease = resolver
            .resolve_identity(&Identity::new(MAC, "laptop"), true)
            .await
            .unwrap();
        assert_eq!(lease.method, ResolutionMethod::ByClientId);
        assert_eq!(lease.ip, Some(Ipv4Addr::new(10, 0, 0, 7)));

        let touched = store.get_field("client:laptop", "ts").await.unwrap();
        assert!(touched.is_some());
    }

    #[tokio::test]
    async fn test_mac_binding_is_sticky() {
        let store = seeded_store().await;
        store
            .insert(&format!("mac:{}", MAC), [("ip", "10.0.0.5"), ("hostname", "nas")])
            .await;
        let resolver = resolver(store, Role::Active, false).await;

        for _ in 0..3 {
            let lease = resolver
                .resolve_identity(&Identity::new(MAC, "unknown-client"), true)
                .await
                .unwrap();
            assert_eq!(lease.method, ResolutionMethod::ByHardwareAddress);
            assert_eq!(lease.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
            assert_eq!(lease.hostname, "nas");
            assert_eq!(lease.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
            assert_eq!(lease.lease_time, Duration::from_secs(7200));
        }
    }

    #[tokio::test]
    async fn test_dynamic_then_sticky() {
        let store = seeded_store().await;
        let resolver = resolver(store, Role::Active, false).await;
        let identity = Identity::new(MAC, "phone");

        let first = resolver.resolve_identity(&identity, true).await.unwrap();
        assert_eq!(first.method, ResolutionMethod::Dynamic);
        assert_eq!(first.ip, Some(Ipv4Addr::new(10, 0, 1, 100)));
        assert_eq!(first.gateway, Some(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(first.lease_time, Duration::from_secs(600));
        assert_eq!(first.description, "dynamic:phone");

        let second = resolver.resolve_identity(&identity, true).await.unwrap();
        assert_eq!(second.method, ResolutionMethod::ByHardwareAddress);
        assert_eq!(second.ip, first.ip);
    }

    #[tokio::test]
    async fn test_named_group() {
        let store = seeded_store().await;
        store
            .insert("group:office", [("gateway", "172.16.0.1"), ("prefix", "16")])
            .await;
        store
            .insert(&format!("mac:{}", MAC), [("ip", "172.16.4.4"), ("group", "office")])
            .await;
        let resolver = resolver(store, Role::Active, false).await;

        let lease = resolver
            .resolve_identity(&Identity::new(MAC, ""), true)
            .await
            .unwrap();
        assert_eq!(lease.netmask, Some(Ipv4Addr::new(255, 255, 0, 0)));
        assert_eq!(lease.broadcast, Some(Ipv4Addr::new(172, 16, 255, 255)));
        assert_eq!(lease.lease_time, Duration::ZERO);
        assert!(lease.dns.is_empty());
    }

    #[tokio::test]
    async fn test_standby_refuses_dynamic_but_serves_sticky() {
        let store = seeded_store().await;
        store
            .insert("mac:11:22:33:44:55:66", [("ip", "10.0.0.9")])
            .await;
        let resolver = resolver(store.clone(), Role::Standby, false).await;

        let sticky = resolver
            .resolve_identity(&Identity::new("11:22:33:44:55:66", ""), true)
            .await
            .unwrap();
        assert_eq!(sticky.ip, Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(sticky.standby);
        assert_eq!(sticky.no_address, None);

        let dynamic = resolver
            .resolve_identity(&Identity::new(MAC, ""), true)
            .await
            .unwrap();
        assert_eq!(dynamic.method, ResolutionMethod::Dynamic);
        assert_eq!(dynamic.ip, None);
        assert_eq!(dynamic.no_address, Some(NoAddress::Refused));
        assert!(store.get_all(&format!("mac:{}", MAC)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allow_dynamic_false_narrows_policy() {
        let store = seeded_store().await;
        let resolver = resolver(store, Role::Active, false).await;

        let lease = resolver
            .resolve_identity(&Identity::new(MAC, ""), false)
            .await
            .unwrap();
        assert_eq!(lease.ip, None);
        assert_eq!(lease.no_address, Some(NoAddress::Refused));
    }

    #[tokio::test]
    async fn test_full_pool_is_exhausted_not_refused() {
        let store = seeded_store().await;
        store
            .insert(
                POOL_KEY,
                [("10.0.1.100", "99:99:99:99:99:01"), ("10.0.1.101", "99:99:99:99:99:02")],
            )
            .await;
        let resolver = resolver(store, Role::Active, false).await;

        let lease = resolver
            .resolve_identity(&Identity::new(MAC, ""), true)
            .await
            .unwrap();
        assert_eq!(lease.ip, None);
        assert_eq!(lease.no_address, Some(NoAddress::Exhausted));
    }

    #[tokio::test]
    async fn test_store_outage_is_not_not_found() {
        let store = seeded_store().await;
        let resolver = resolver(store.clone(), Role::Active, false).await;
        store.fail_requests(true);

        let result = resolver.resolve_identity(&Identity::new(MAC, ""), true).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let store = seeded_store().await;
        let resolver = resolver(store.clone(), Role::Active, false).await;
        assert_eq!(
            resolver.defaults().await.default.gateway,
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );

        store.insert("group:default", [("gateway", "10.0.0.254")]).await;
        assert_eq!(
            resolver.defaults().await.default.gateway,
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );

        resolver.reload().await.unwrap();
        assert_eq!(
            resolver.defaults().await.default.gateway,
            Some(Ipv4Addr::new(10, 0, 0, 254))
        );
    }

    #[tokio::test]
    async fn test_invalid_default_group_fails_load() {
        let store = seeded_store().await;
        store.insert("group:default", [("routers", "10.0.0.1")]).await;
        let result = Resolver::load(store, AllocationPolicy::active()).await;
        assert!(matches!(result, Err(Error::InvalidRecord { .. })));
    }
}
