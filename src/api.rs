//! HTTP resolution service, its client, and the heartbeat endpoint.
//!
//! The resolution service exposes the in-process [`Resolver`] over JSON so
//! several DHCP daemons can share one resolution point:
//!
//! - `POST /` with `{"mac": "...", "client": "..."}` returns a lease
//! - `POST /reload` re-reads the default and pool groups
//! - `GET /ping` answers 200 with an empty body
//!
//! A store outage answers 502 so callers can tell it apart from a bad
//! record (500) or a bad request (400).

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Identity, LeaseDescriptor, NoAddress, ResolutionMethod};
use crate::resolver::{LeaseSource, Resolver};

/// Body of `POST /`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub client: String,
    /// Per-request narrowing of dynamic allocation. Absent means allowed.
    #[serde(default = "allow_dynamic_default")]
    pub allow_dynamic: bool,
}

fn allow_dynamic_default() -> bool {
    true
}

/// Wire form of a [`LeaseDescriptor`]. Addresses and lists are strings,
/// lists comma-separated, `leasetime` in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseResponse {
    pub mac: String,
    pub client: String,
    pub hostname: String,
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
    pub broadcast: String,
    pub prefix: String,
    pub dns: String,
    pub domain: String,
    pub ntp: String,
    pub leasetime: u64,
    pub description: String,
    pub method: ResolutionMethod,
    pub slave: bool,
    /// Why `ip` is empty: `refused` or `exhausted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned: Option<NoAddress>,
}

fn addr_string(addr: Option<Ipv4Addr>) -> String {
    addr.map(|addr| addr.to_string()).unwrap_or_default()
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_optional<T: FromStr>(field: &str, value: &str) -> Result<Option<T>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| Error::Api(format!("invalid {} {:?} in response", field, value)))
}

fn parse_list<T: FromStr>(field: &str, value: &str) -> Result<Vec<T>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|_| Error::Api(format!("invalid {} entry {:?} in response", field, item)))
        })
        .collect()
}

impl From<&LeaseDescriptor> for LeaseResponse {
    fn from(lease: &LeaseDescriptor) -> Self {
        Self {
            mac: lease.mac.clone(),
            client: lease.client.clone(),
            hostname: lease.hostname.clone(),
            ip: addr_string(lease.ip),
            gateway: addr_string(lease.gateway),
            netmask: addr_string(lease.netmask),
            broadcast: addr_string(lease.broadcast),
            prefix: lease.prefix.map(|p| p.to_string()).unwrap_or_default(),
            dns: join(&lease.dns),
            domain: lease.domain.join(","),
            ntp: join(&lease.ntp),
            leasetime: u64::try_from(lease.lease_time.as_nanos()).unwrap_or(u64::MAX),
            description: lease.description.clone(),
            method: lease.method,
            slave: lease.standby,
            unassigned: lease.no_address,
        }
    }
}

impl TryFrom<LeaseResponse> for LeaseDescriptor {
    type Error = Error;

    fn try_from(response: LeaseResponse) -> Result<Self> {
        Ok(Self {
            ip: parse_optional("ip", &response.ip)?,
            gateway: parse_optional("gateway", &response.gateway)?,
            netmask: parse_optional("netmask", &response.netmask)?,
            broadcast: parse_optional("broadcast", &response.broadcast)?,
            prefix: parse_optional("prefix", &response.prefix)?,
            dns: parse_list("dns", &response.dns)?,
            domain: parse_list("domain", &response.domain)?,
            ntp: parse_list("ntp", &response.ntp)?,
            lease_time: Duration::from_nanos(response.leasetime),
            mac: response.mac,
            client: response.client,
            hostname: response.hostname,
            description: response.description,
            method: response.method,
            standby: response.slave,
            no_address: response.unassigned,
        })
    }
}

/// Maps crate errors onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::StoreUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self.0);
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Router for the resolution service. Also answers `/ping`.
pub fn router(resolver: Arc<Resolver>) -> Router {
    Router::new()
        .route("/", post(resolve))
        .route("/reload", post(reload))
        .route("/ping", get(ping))
        .with_state(resolver)
}

/// Router for the standalone heartbeat listener.
pub fn heartbeat_router() -> Router {
    Router::new().route("/ping", get(ping))
}

pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    info!("HTTP listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn resolve(
    State(resolver): State<Arc<Resolver>>,
    body: Bytes,
) -> std::result::Result<Json<LeaseResponse>, ApiError> {
    let request: ResolveRequest = serde_json::from_slice(&body).map_err(|error| {
        warn!("Rejected resolution request: {}", error);
        Error::Json(error)
    })?;

    let identity = Identity::new(request.mac, request.client);
    let lease = resolver
        .resolve_identity(&identity, request.allow_dynamic)
        .await?;
    Ok(Json(LeaseResponse::from(&lease)))
}

async fn reload(
    State(resolver): State<Arc<Resolver>>,
) -> std::result::Result<StatusCode, ApiError> {
    resolver.reload().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

/// [`LeaseSource`] backed by a remote resolution service.
pub struct HttpLeaseSource {
    client: reqwest::Client,
    url: String,
}

impl HttpLeaseSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidConfig(format!("HTTP client: {}", error)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl LeaseSource for HttpLeaseSource {
    async fn resolve(&self, identity: &Identity, allow_dynamic: bool) -> Result<LeaseDescriptor> {
        let request = ResolveRequest {
            mac: identity.mac.clone(),
            client: identity.client.clone(),
            allow_dynamic,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|error| Error::Api(format!("{}: {}", self.url, error)))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_GATEWAY {
            return Err(Error::StoreUnavailable(format!(
                "resolution service at {} reports store outage",
                self.url
            )));
        }
        if !status.is_success() {
            return Err(Error::Api(format!("{} returned {}", self.url, status)));
        }

        let body: LeaseResponse = response
            .json()
            .await
            .map_err(|error| Error::Api(format!("{}: {}", self.url, error)))?;
        LeaseDescriptor::try_from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocationPolicy;
    use crate::store::MemoryStore;
    use std::net::SocketAddr;

    async fn start(store: Arc<MemoryStore>) -> SocketAddr {
        let resolver = Resolver::load(store, AllocationPolicy::active()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, router(Arc::new(resolver))));
        addr
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(
                "group:default",
                [
                    ("gateway", "10.0.0.1"),
                    ("prefix", "24"),
                    ("lease-time", "2h"),
                    ("dns", "10.0.0.53,10.0.0.54"),
                    ("domain", "example.com"),
                ],
            )
            .await;
        store
            .insert("mac:aa:bb:cc:dd:ee:ff", [("ip", "10.0.0.5"), ("hostname", "nas")])
            .await;
        store
    }

    #[tokio::test]
    async fn test_resolve_over_http() {
        let addr = start(seeded().await).await;
        let source =
            HttpLeaseSource::new(&format!("http://{}/", addr), Duration::from_secs(2)).unwrap();

        let lease = source
            .resolve(&Identity::new("aa:bb:cc:dd:ee:ff", ""), true)
            .await
            .unwrap();
        assert_eq!(lease.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(lease.hostname, "nas");
        assert_eq!(lease.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(
            lease.dns,
            vec![Ipv4Addr::new(10, 0, 0, 53), Ipv4Addr::new(10, 0, 0, 54)]
        );
        assert_eq!(lease.domain, vec!["example.com".to_string()]);
        assert_eq!(lease.lease_time, Duration::from_secs(7200));
        assert_eq!(lease.method, ResolutionMethod::ByHardwareAddress);
    }

    #[tokio::test]
    async fn test_response_wire_format() {
        let addr = start(seeded().await).await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .body(r#"{"mac":"aa:bb:cc:dd:ee:ff"}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["ip"], "10.0.0.5");
        assert_eq!(body["client"], "");
        assert_eq!(body["prefix"], "24");
        assert_eq!(body["leasetime"], 7_200_000_000_000u64);
        assert_eq!(body["method"], "ByHardwareAddress");
        assert_eq!(body["slave"], false);
        assert!(body.get("unassigned").is_none());
    }

    #[tokio::test]
    async fn test_unassigned_reason_crosses_the_wire() {
        let addr = start(seeded().await).await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .body(r#"{"mac":"02:42:ac:11:00:02","allow_dynamic":false}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ip"], "");
        assert_eq!(body["unassigned"], "refused");

        let source =
            HttpLeaseSource::new(&format!("http://{}/", addr), Duration::from_secs(2)).unwrap();
        let refused = source
            .resolve(&Identity::new("02:42:ac:11:00:02", ""), false)
            .await
            .unwrap();
        assert_eq!(refused.no_address, Some(NoAddress::Refused));

        let exhausted = source
            .resolve(&Identity::new("02:42:ac:11:00:02", ""), true)
            .await
            .unwrap();
        assert_eq!(exhausted.ip, None);
        assert_eq!(exhausted.no_address, Some(NoAddress::Exhausted));
    }

    #[tokio::test]
    async fn test_bad_body_is_400() {
        let addr = start(seeded().await).await;
        let response = reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_store_outage_is_502() {
        let store = seeded().await;
        let addr = start(store.clone()).await;
        store.fail_requests(true);

        let response = reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .body(r#"{"mac":"aa:bb:cc:dd:ee:ff"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("Store unavailable"));

        let source =
            HttpLeaseSource::new(&format!("http://{}/", addr), Duration::from_secs(2)).unwrap();
        let result = source.resolve(&Identity::new("aa:bb:cc:dd:ee:ff", ""), true).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_record_is_500() {
        let store = seeded().await;
        store.insert("mac:11:22:33:44:55:66", [("address", "10.0.0.9")]).await;
        let addr = start(store).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .body(r#"{"mac":"11:22:33:44:55:66"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_ping_and_reload() {
        let addr = start(seeded().await).await;
        let client = reqwest::Client::new();

        let ping = client.get(format!("http://{}/ping", addr)).send().await.unwrap();
        assert_eq!(ping.status(), reqwest::StatusCode::OK);
        assert!(ping.bytes().await.unwrap().is_empty());

        let reload = client
            .post(format!("http://{}/reload", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(reload.status(), reqwest::StatusCode::NO_CONTENT);
    }

    #[test]
    fn test_request_defaults() {
        let request: ResolveRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.mac, "");
        assert_eq!(request.client, "");
        assert!(request.allow_dynamic);
    }
}
