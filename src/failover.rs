//! Active/standby coordination.
//!
//! An active instance always answers. A standby instance probes its peer's
//! heartbeat before every reply: a live peer means stay silent, a dead one
//! means take over for this packet. Taking over never widens what the
//! standby may allocate; that still needs `allow_standby_allocation`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{FailoverConfig, Role};
use crate::error::{Error, Result};

/// Liveness check against the active peer.
#[async_trait]
pub trait PeerProbe: Send + Sync {
    /// `Ok` when the peer answered with a success status.
    async fn probe(&self) -> Result<()>;
}

/// Probes `GET http://<peer>/ping` with a hard timeout.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(peer: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidConfig(format!("HTTP client: {}", error)))?;

        let url = if peer.starts_with("http://") || peer.starts_with("https://") {
            format!("{}/ping", peer.trim_end_matches('/'))
        } else {
            format!("http://{}/ping", peer)
        };

        Ok(Self { client, url })
    }
}

#[async_trait]
impl PeerProbe for HttpProbe {
    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|error| Error::PeerUnreachable(format!("{}: {}", self.url, error)))?;

        if !response.status().is_success() {
            return Err(Error::PeerUnreachable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Whether to answer a packet, and with which allocation permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Respond { allow_dynamic: bool },
    Suppress,
}

pub struct FailoverCoordinator {
    role: Role,
    allow_standby_allocation: bool,
    probe: Option<Arc<dyn PeerProbe>>,
    debounce: Duration,
    last_verdict: Mutex<Option<(Instant, bool)>>,
}

impl FailoverCoordinator {
    /// Coordinator for an instance that always answers.
    pub fn active() -> Self {
        Self {
            role: Role::Active,
            allow_standby_allocation: false,
            probe: None,
            debounce: Duration::ZERO,
            last_verdict: Mutex::new(None),
        }
    }

    pub fn new(config: &FailoverConfig, probe: Option<Arc<dyn PeerProbe>>) -> Self {
        Self {
            role: config.role,
            allow_standby_allocation: config.allow_standby_allocation,
            probe,
            debounce: Duration::from_millis(config.debounce_ms),
            last_verdict: Mutex::new(None),
        }
    }

    pub async fn decide(&self) -> Decision {
        if self.role == Role::Active {
            return Decision::Respond {
                allow_dynamic: true,
            };
        }

        if self.peer_alive().await {
            debug!("Peer is alive, standby stays silent");
            Decision::Suppress
        } else {
            Decision::Respond {
                allow_dynamic: self.allow_standby_allocation,
            }
        }
    }

    async fn peer_alive(&self) -> bool {
        let Some(probe) = &self.probe else {
            warn!("Standby has no peer to probe, taking over");
            return false;
        };

        if self.debounce.is_zero() {
            return Self::run_probe(probe.as_ref()).await;
        }

        // Held across the probe so concurrent packets share one probe.
        let mut last = self.last_verdict.lock().await;
        if let Some((at, alive)) = *last
            && at.elapsed() < self.debounce
        {
            return alive;
        }

        let alive = Self::run_probe(probe.as_ref()).await;
        *last = Some((Instant::now(), alive));
        alive
    }

    async fn run_probe(probe: &dyn PeerProbe) -> bool {
        match probe.probe().await {
            Ok(()) => true,
            Err(error) => {
                warn!("{}, standby taking over", error);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProbe {
        alive: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerProbe for FakeProbe {
        async fn probe(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::PeerUnreachable("connection refused".to_string()))
            }
        }
    }

    fn standby(allow: bool, debounce_ms: u64) -> FailoverConfig {
        FailoverConfig {
            role: Role::Standby,
            allow_standby_allocation: allow,
            peer: Some("10.0.0.2:8079".to_string()),
            debounce_ms,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_active_always_responds() {
        let coordinator = FailoverCoordinator::active();
        assert_eq!(
            coordinator.decide().await,
            Decision::Respond {
                allow_dynamic: true
            }
        );
    }

    #[tokio::test]
    async fn test_standby_suppressed_while_peer_alive() {
        let probe = FakeProbe::new(true);
        let coordinator = FailoverCoordinator::new(&standby(true, 0), Some(probe.clone()));

        for _ in 0..3 {
            assert_eq!(coordinator.decide().await, Decision::Suppress);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_standby_takes_over_without_allocation() {
        let probe = FakeProbe::new(false);
        let coordinator = FailoverCoordinator::new(&standby(false, 0), Some(probe));
        assert_eq!(
            coordinator.decide().await,
            Decision::Respond {
                allow_dynamic: false
            }
        );
    }

    #[tokio::test]
    async fn test_standby_override_allows_allocation() {
        let probe = FakeProbe::new(false);
        let coordinator = FailoverCoordinator::new(&standby(true, 0), Some(probe));
        assert_eq!(
            coordinator.decide().await,
            Decision::Respond {
                allow_dynamic: true
            }
        );
    }

    #[tokio::test]
    async fn test_debounce_reuses_verdict() {
        let probe = FakeProbe::new(true);
        let coordinator = FailoverCoordinator::new(&standby(false, 60_000), Some(probe.clone()));

        assert_eq!(coordinator.decide().await, Decision::Suppress);
        probe.alive.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.decide().await, Decision::Suppress);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpProbe::new(&addr.to_string(), Duration::from_millis(200)).unwrap();
        assert!(matches!(
            probe.probe().await,
            Err(Error::PeerUnreachable(_))
        ));
    }

    async fn serve_heartbeat(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(crate::api::serve(listener, router));
        addr.to_string()
    }

    #[tokio::test]
    async fn test_heartbeat_answer_means_peer_alive() {
        let peer = serve_heartbeat(crate::api::heartbeat_router()).await;
        let checker = HttpProbe::new(&peer, Duration::from_secs(2)).unwrap();
        assert!(checker.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_error_status_means_unreachable() {
        let router = axum::Router::new().route(
            "/ping",
            axum::routing::get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        );
        let peer = serve_heartbeat(router).await;
        let checker = HttpProbe::new(&peer, Duration::from_secs(2)).unwrap();

        match checker.probe().await {
            Err(Error::PeerUnreachable(reason)) => assert!(reason.contains("503")),
            other => panic!("expected PeerUnreachable, got {:?}", other),
        }
    }

    #[test]
    fn test_http_probe_url() {
        let probe = HttpProbe::new("10.0.0.2:8079", Duration::from_millis(500)).unwrap();
        assert_eq!(probe.url, "http://10.0.0.2:8079/ping");

        let probe = HttpProbe::new("http://peer:8079/", Duration::from_millis(500)).unwrap();
        assert_eq!(probe.url, "http://peer:8079/ping");
    }
}
