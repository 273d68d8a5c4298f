//! Overpass API client.
//!
//! Queries OpenStreetMap parking elements through a rotating list of
//! interchangeable Overpass mirrors, with a per-attempt timeout and
//! exponential backoff between attempts.

pub mod transform;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::UpstreamConfig;
use common::{Error, OSM_ID_PREFIX};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub use transform::{transform, MAX_FACILITIES};

// ── Overpass response types ───────────────────────────────────────────

/// Body of a `[out:json]` interpreter response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<OverpassElement>,
}

/// A node, way or relation. Ways and relations carry `center` when the
/// query asks for `out center`.
#[derive(Debug, Clone, Deserialize)]
pub struct OverpassElement {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub id: u64,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub center: Option<Center>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Center {
    pub lat: f64,
    pub lon: f64,
}

// ── Query builders ────────────────────────────────────────────────────

/// Overpass QL for every parking amenity within `radius_m` of a point.
pub fn area_query(lat: f64, lng: f64, radius_m: u32, timeout_secs: u32) -> String {
    let around = format!("(around:{radius_m},{lat},{lng})");
    format!(
        "[out:json][timeout:{timeout_secs}];(\
         node[\"amenity\"=\"parking\"]{around};\
         way[\"amenity\"=\"parking\"]{around};\
         relation[\"amenity\"=\"parking\"]{around};\
         );out center tags;"
    )
}

/// Overpass QL for a single element id, whatever its type.
pub fn element_query(element_id: u64, timeout_secs: u32) -> String {
    format!(
        "[out:json][timeout:{timeout_secs}];(\
         node({element_id});way({element_id});relation({element_id});\
         );out center tags;"
    )
}

/// Extract the upstream element id from a facility id like `osm_123`.
pub fn parse_element_id(facility_id: &str) -> Option<u64> {
    facility_id.strip_prefix(OSM_ID_PREFIX)?.parse().ok()
}

// ── Transport ─────────────────────────────────────────────────────────

/// One request against one mirror. Implementations report any failure
/// (transport, non-2xx, undecodable body) as an `Err`.
#[async_trait]
pub trait MirrorTransport: Send + Sync {
    async fn post_query(&self, endpoint: &str, query: &str) -> Result<OverpassResponse, Error>;
}

fn format_reqwest_error(err: &reqwest::Error) -> String {
    // Keep chained causes so network failures (DNS/TLS/socket) are visible.
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !cause_msg.is_empty() && !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }

    message
}

const MAX_ERROR_BODY_CHARS: usize = 500;

/// First `MAX_ERROR_BODY_CHARS` characters of an error body.
fn error_excerpt(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

/// reqwest-backed transport with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", format_reqwest_error(&e))))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MirrorTransport for HttpTransport {
    async fn post_query(&self, endpoint: &str, query: &str) -> Result<OverpassResponse, Error> {
        let resp = self
            .client
            .post(endpoint)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", endpoint, format_reqwest_error(&e))))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "{} returned {}: {}",
                endpoint,
                status.as_u16(),
                error_excerpt(&body)
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Http(format!("JSON parse error from {}: {}", endpoint, e)))
    }
}

// ── Mirror client ─────────────────────────────────────────────────────

/// Failover client over a fixed list of mirrors.
///
/// Attempt `i` goes to mirror `i % mirrors.len()`, so the order is
/// deterministic and never hits the same mirror twice in a row when more
/// than one is configured. Dropping the future returned by [`fetch`]
/// abandons the in-flight attempt and any pending backoff.
///
/// [`fetch`]: MirrorClient::fetch
#[derive(Clone)]
pub struct MirrorClient {
    transport: Arc<dyn MirrorTransport>,
    mirrors: Vec<String>,
    backoff_base: Duration,
    default_attempts: u32,
    default_timeout: Duration,
    query_timeout_secs: u32,
}

impl MirrorClient {
    pub fn new(transport: Arc<dyn MirrorTransport>, config: &UpstreamConfig) -> Self {
        Self {
            transport,
            mirrors: config.mirrors.clone(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            default_attempts: config.attempts,
            default_timeout: Duration::from_millis(config.attempt_timeout_ms),
            query_timeout_secs: config.query_timeout_secs,
        }
    }

    /// Client over real HTTP mirrors.
    pub fn http(config: &UpstreamConfig) -> Result<Self, Error> {
        let transport = HttpTransport::new(&config.user_agent)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub fn query_timeout_secs(&self) -> u32 {
        self.query_timeout_secs
    }

    /// Mirror contacted on attempt `attempt`.
    pub fn mirror_for(&self, attempt: u32) -> Option<&str> {
        if self.mirrors.is_empty() {
            return None;
        }
        let idx = attempt as usize % self.mirrors.len();
        Some(self.mirrors[idx].as_str())
    }

    /// Delay slept after failed attempt `attempt`: `base * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }

    /// Run `query` with the configured attempts and timeout.
    pub async fn fetch_default(&self, query: &str) -> Result<OverpassResponse, Error> {
        self.fetch(query, self.default_attempts, self.default_timeout)
            .await
    }

    /// Run `query`, trying at most `attempts` mirrors in round-robin order.
    ///
    /// Fails with [`Error::UpstreamUnavailable`] carrying the last observed
    /// error once every attempt has failed.
    pub async fn fetch(
        &self,
        query: &str,
        attempts: u32,
        attempt_timeout: Duration,
    ) -> Result<OverpassResponse, Error> {
        if self.mirrors.is_empty() {
            return Err(Error::UpstreamUnavailable("no mirrors configured".into()));
        }

        let mut last_error = String::from("no attempts made");

        for attempt in 0..attempts {
            let Some(endpoint) = self.mirror_for(attempt) else {
                break;
            };

            debug!(
                "Overpass attempt {}/{} via {}",
                attempt + 1,
                attempts,
                endpoint
            );

            match timeout(attempt_timeout, self.transport.post_query(endpoint, query)).await {
                Ok(Ok(response)) => {
                    if attempt > 0 {
                        info!(
                            "Overpass query succeeded on attempt {} via {}",
                            attempt + 1,
                            endpoint
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!("Overpass attempt {} via {} failed: {}", attempt + 1, endpoint, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Overpass attempt {} via {} timed out after {:?}",
                        attempt + 1,
                        endpoint,
                        attempt_timeout
                    );
                    last_error = format!("{} timed out after {:?}", endpoint, attempt_timeout);
                }
            }

            if attempt + 1 < attempts {
                sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(Error::UpstreamUnavailable(last_error))
    }
}

impl std::fmt::Debug for MirrorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorClient")
            .field("mirrors", &self.mirrors)
            .field("backoff_base", &self.backoff_base)
            .field("default_attempts", &self.default_attempts)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
