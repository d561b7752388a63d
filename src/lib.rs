//! # stickydhcp
//!
//! A DHCP server (RFC 2131) whose address policy lives in a shared store,
//! so several daemons can answer for the same network with the same
//! answers.
//!
//! ## Features
//!
//! - Sticky bindings by client identity or hardware address
//! - First-use allocation from a shared dynamic pool, race-free across processes
//! - Per-group network parameters (gateway, prefix, DNS, domain search, NTP, lease time)
//! - Active/standby failover driven by a peer heartbeat
//! - HTTP resolution service so daemons need not talk to the store directly
//! - Relay agent support (Option 82 echo, replies to `giaddr`)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stickydhcp::{
//!     AllocationPolicy, Config, DhcpServer, Engine, FailoverCoordinator, RedisStore, Resolver,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stickydhcp::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let store = RedisStore::connect(&config.store.redis_url, config.store_timeout()).await?;
//!     let resolver = Resolver::load(Arc::new(store), AllocationPolicy::active()).await?;
//!     let engine = Engine::new(
//!         config.server_ip,
//!         Arc::new(resolver),
//!         FailoverCoordinator::active(),
//!     );
//!     DhcpServer::new(&config, engine)?.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`] - Shared hash store ([`RedisStore`], [`MemoryStore`])
//! - [`Resolver`] - Binding lookup, group selection and merge
//! - [`Allocator`] - Atomic claims on the dynamic pool
//! - [`Engine`] - DHCP message handling and reply targeting
//! - [`FailoverCoordinator`] - Decides whether a standby answers
//! - [`DhcpServer`] - UDP listener on port 67
//! - [`api`] - HTTP resolution and heartbeat services

pub mod allocator;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod failover;
pub mod inspect;
pub mod model;
pub mod options;
pub mod packet;
pub mod resolver;
pub mod server;
pub mod store;

pub use allocator::{Allocation, AllocationPolicy, Allocator};
pub use config::{Config, Role};
pub use engine::{Engine, Reply};
pub use error::{Error, Result};
pub use failover::{Decision, FailoverCoordinator, HttpProbe, PeerProbe};
pub use model::{Identity, LeaseDescriptor, NoAddress, ResolutionMethod};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use resolver::{GroupDefaults, LeaseSource, Resolver};
pub use server::DhcpServer;
pub use store::{DynStore, MemoryStore, RedisStore, Store};
