#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/mandi-ear/offline-cache/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! HTTP origin for the offline cache.
//!
//! [`HttpOrigin`] implements [`OriginDataService`] against the platform's REST
//! services. Every data type maps to one resource path; the logical id of the
//! cache key is the last path segment.
//!
//! # Features
//!
//! - Client-side rate limiting between requests
//! - Per-request timeout
//! - `X-Content-Hash` support, with a locally computed hash as fallback
//! - HTTP status mapped onto the cache error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use mandi_origin::HttpOrigin;
//! use mandi_core::{CacheKey, DataType, FetchFilter, OriginDataService};
//!
//! # async fn example() -> mandi_core::Result<()> {
//! let origin = HttpOrigin::new("https://api.example.org/v1")?;
//! let key = CacheKey::msp("wheat");
//! let record = origin.fetch(DataType::MspRate, &FetchFilter::for_key(&key)).await?;
//! println!("hash {}", record.content_hash);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mandi_core::{
    CacheContent, CacheError, DataType, FetchFilter, OriginDataService, OriginRecord, Result,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Response header carrying the origin's content hash.
pub const CONTENT_HASH_HEADER: &str = "x-content-hash";

/// User agent for HTTP requests.
const USER_AGENT: &str = concat!("mandi-offline-cache/", env!("CARGO_PKG_VERSION"));

/// Connection settings of an [`HttpOrigin`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpOriginConfig {
    /// Base URL the resource paths are appended to.
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum gap between requests in milliseconds; zero disables limiting.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_rate_limit_ms() -> u64 {
    100
}

impl HttpOriginConfig {
    /// Settings for `base_url` with default timeout and rate limit.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            rate_limit_ms: default_rate_limit_ms(),
        }
    }
}

/// Origin data service over HTTP.
#[derive(Debug)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    rate_limit_ms: u64,
    epoch: Instant,
    last_request_ms: AtomicU64,
}

impl HttpOrigin {
    /// An origin at `base_url` with default settings.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] if `base_url` is not an absolute URL.
    /// - [`CacheError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::from_config(&HttpOriginConfig::new(base_url))
    }

    /// An origin built from `config`.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &HttpOriginConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Network(e.to_string()))?;
        let mut origin = Self::with_client(client, &config.base_url)?;
        origin.timeout = timeout;
        origin.rate_limit_ms = config.rate_limit_ms;
        Ok(origin)
    }

    /// An origin using a caller-supplied client. Rate limiting still applies.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] if `base_url` is not an absolute URL.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CacheError::Validation(format!("invalid origin URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CacheError::Validation(format!(
                "origin URL {base_url} cannot be a base"
            )));
        }
        Ok(Self {
            client,
            base_url,
            timeout: Duration::from_secs(default_timeout_secs()),
            rate_limit_ms: default_rate_limit_ms(),
            epoch: Instant::now(),
            last_request_ms: AtomicU64::new(0),
        })
    }

    /// Overrides the gap enforced between requests.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit_ms = u64::try_from(rate_limit.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn apply_rate_limit(&self) {
        if self.rate_limit_ms == 0 {
            return;
        }
        let last = self.last_request_ms.load(Ordering::Relaxed);
        let elapsed = self.elapsed_ms().saturating_sub(last);
        // The first request never waits
        if last != 0 && elapsed < self.rate_limit_ms {
            let wait = self.rate_limit_ms - elapsed;
            debug!(wait_ms = wait, "Rate limiting origin request");
            sleep(Duration::from_millis(wait)).await;
        }
        self.last_request_ms
            .store(self.elapsed_ms().max(1), Ordering::Relaxed);
    }

    /// URL of the record `filter` identifies.
    fn url_for(&self, data_type: DataType, filter: &FetchFilter) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| CacheError::Validation(format!("origin URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(resource_path(data_type))
            .push(&filter.logical_id);

        if filter.commodity.is_some() || filter.location.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(commodity) = &filter.commodity {
                query.append_pair("commodity", commodity);
            }
            if let Some(location) = &filter.location {
                query
                    .append_pair("lat", &location.lat.to_string())
                    .append_pair("lng", &location.lng.to_string());
            }
        }
        Ok(url)
    }
}

/// Path segments of the resource serving `data_type`.
#[must_use]
pub const fn resource_path(data_type: DataType) -> &'static [&'static str] {
    match data_type {
        DataType::Price => &["prices"],
        DataType::MandiInfo => &["mandis"],
        DataType::Weather => &["weather"],
        DataType::MspRate => &["msp", "rates"],
        DataType::UserPreference => &["preferences"],
        DataType::CropRecommendation => &["recommendations"],
        DataType::MarketTrend => &["trends"],
    }
}

/// Maps a non-success status onto the error taxonomy.
fn status_error(status: StatusCode, headers: &HeaderMap, origin: &str, url: &Url) -> CacheError {
    match status {
        StatusCode::NOT_FOUND => CacheError::NotFound(url.path().to_string()),
        StatusCode::TOO_MANY_REQUESTS => CacheError::RateLimited {
            origin: origin.to_string(),
            retry_after: retry_after(headers),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            CacheError::OriginUnavailable(format!("HTTP {status} for {url}"))
        }
        s if s.is_server_error() => CacheError::OriginUnavailable(format!("HTTP {s} for {url}")),
        s if s.is_client_error() => CacheError::Validation(format!("HTTP {s} for {url}")),
        s => CacheError::Network(format!("HTTP {s} for {url}")),
    }
}

/// `Retry-After` in its delay-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn transport_error(err: &reqwest::Error, url: &Url, timeout: Duration) -> CacheError {
    if err.is_timeout() {
        CacheError::Timeout {
            operation: format!("GET {url}"),
            after: timeout,
        }
    } else if err.is_connect() {
        CacheError::OriginUnavailable(err.to_string())
    } else {
        CacheError::Network(err.to_string())
    }
}

/// Decodes a response body as the payload of `data_type`.
///
/// # Errors
/// Returns [`CacheError::Parse`] if the body is not a valid payload.
pub fn decode_payload(data_type: DataType, body: &[u8]) -> Result<CacheContent> {
    fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
        serde_json::from_slice(body).map_err(|e| CacheError::Parse(e.to_string()))
    }

    Ok(match data_type {
        DataType::Price => CacheContent::Price(parse(body)?),
        DataType::MandiInfo => CacheContent::MandiInfo(parse(body)?),
        DataType::Weather => CacheContent::Weather(parse(body)?),
        DataType::MspRate => CacheContent::MspRate(parse(body)?),
        DataType::UserPreference => CacheContent::UserPreference(parse(body)?),
        DataType::CropRecommendation => CacheContent::CropRecommendation(parse(body)?),
        DataType::MarketTrend => CacheContent::MarketTrend(parse(body)?),
    })
}

/// Builds the record, keeping the origin's hash when it is well formed.
fn record_from(content: CacheContent, header_hash: Option<&str>) -> Result<OriginRecord> {
    let supplied = header_hash
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()));
    match supplied {
        Some(content_hash) => Ok(OriginRecord {
            content,
            content_hash,
        }),
        None => {
            if header_hash.is_some() {
                warn!("Ignoring malformed content hash header");
            }
            OriginRecord::from_content(content)
        }
    }
}

#[async_trait]
impl OriginDataService for HttpOrigin {
    fn name(&self) -> &str {
        self.base_url.host_str().unwrap_or("http-origin")
    }

    #[instrument(skip(self, filter), fields(data_type = %data_type, id = %filter.logical_id))]
    async fn fetch(&self, data_type: DataType, filter: &FetchFilter) -> Result<OriginRecord> {
        let url = self.url_for(data_type, filter)?;
        self.apply_rate_limit().await;
        debug!(url = %url, "Fetching from origin");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(&e, &url, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.headers(), self.name(), &url));
        }

        let header_hash = response
            .headers()
            .get(CONTENT_HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, &url, self.timeout))?;

        let content = decode_payload(data_type, &body)?;
        record_from(content, header_hash.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandi_core::{CacheKey, GeoPoint, MspRate};
    use reqwest::header::HeaderValue;

    fn origin() -> HttpOrigin {
        HttpOrigin::new("https://api.example.org/v1/").unwrap()
    }

    #[test]
    fn test_url_for_each_type() {
        let origin = origin();
        let msp = CacheKey::msp("wheat");
        let url = origin
            .url_for(DataType::MspRate, &FetchFilter::for_key(&msp))
            .unwrap();
        assert_eq!(url.as_str(), "https://api.example.org/v1/msp/rates/wheat");

        let price = CacheKey::price("onion", "lasalgaon");
        let filter = FetchFilter::for_key(&price).with_commodity("onion");
        let url = origin.url_for(DataType::Price, &filter).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.org/v1/prices/onion:lasalgaon?commodity=onion"
        );

        let weather = CacheKey::new(DataType::Weather, "nashik");
        let filter = FetchFilter::for_key(&weather).with_location(GeoPoint::new(20.0, 73.8));
        let url = origin.url_for(DataType::Weather, &filter).unwrap();
        assert_eq!(url.query(), Some("lat=20&lng=73.8"));
    }

    #[test]
    fn test_logical_id_is_escaped() {
        let key = CacheKey::new(DataType::MandiInfo, "a b/c");
        let url = origin()
            .url_for(DataType::MandiInfo, &FetchFilter::for_key(&key))
            .unwrap();
        assert_eq!(url.path(), "/v1/mandis/a%20b%2Fc");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpOrigin::new("not a url"),
            Err(CacheError::Validation(_))
        ));
        assert!(matches!(
            HttpOrigin::new("mailto:ops@example.org"),
            Err(CacheError::Validation(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        let url = Url::parse("https://api.example.org/v1/msp/rates/wheat").unwrap();
        let mut headers = HeaderMap::new();

        let err = status_error(StatusCode::NOT_FOUND, &headers, "origin", &url);
        assert!(matches!(err, CacheError::NotFound(_)));
        assert!(!err.is_retryable());

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, &headers, "origin", &url);
        assert!(matches!(err, CacheError::OriginUnavailable(_)));
        assert!(err.is_retryable());

        let err = status_error(StatusCode::BAD_REQUEST, &headers, "origin", &url);
        assert!(matches!(err, CacheError::Validation(_)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, &headers, "origin", &url);
        assert_eq!(
            err,
            CacheError::RateLimited {
                origin: "origin".to_string(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[test]
    fn test_decode_payload() {
        let body = br#"{"commodity":"wheat","season":"rabi","crop_year":"2024-25","price_per_quintal":2275.0}"#;
        let content = decode_payload(DataType::MspRate, body).unwrap();
        assert_eq!(content.data_type(), DataType::MspRate);

        assert!(matches!(
            decode_payload(DataType::Weather, body),
            Err(CacheError::Parse(_))
        ));
    }

    #[test]
    fn test_content_hash_header() {
        let content = CacheContent::MspRate(MspRate {
            commodity: "wheat".to_string(),
            season: "rabi".to_string(),
            crop_year: "2024-25".to_string(),
            price_per_quintal: 2275.0,
        });
        let local = content.content_hash().unwrap();

        let supplied = "AB".repeat(32);
        let record = record_from(content.clone(), Some(&supplied)).unwrap();
        assert_eq!(record.content_hash, "ab".repeat(32));

        let record = record_from(content.clone(), Some("not-a-hash")).unwrap();
        assert_eq!(record.content_hash, local);

        let record = record_from(content, None).unwrap();
        assert_eq!(record.content_hash, local);
    }

    #[test]
    fn test_name_is_host() {
        assert_eq!(origin().name(), "api.example.org");
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_requests() {
        let origin = origin().with_rate_limit(Duration::from_millis(40));
        let start = Instant::now();
        origin.apply_rate_limit().await;
        origin.apply_rate_limit().await;
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
