//! Store client for a Cosmos-style document REST API.
//!
//! [`CosmosClient`] is a `tower::Service<Document>` that upserts each document with a
//! master-key signed `POST`, reports the request charge as the write cost and maps HTTP
//! 429 to [`StoreError::Throttled`] so the importer can gate on it.
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use adaptive_import::{Document, StoreError, WriteReceipt};
use base64::{Engine, engine::general_purpose::STANDARD};
use bon::Builder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Request as HttpRequest, StatusCode, header};
use serde_json::Value;
use sha2::Sha256;
use snafu::{OptionExt, ResultExt, Snafu};
use tower::Service;
use url::Url;

#[macro_use]
extern crate tracing;

const DEFAULT_API_VERSION: &str = "2018-12-31";
const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const MS_DATE: &str = "x-ms-date";
const MS_VERSION: &str = "x-ms-version";
const MS_UPSERT: &str = "x-ms-documentdb-is-upsert";
const MS_PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
const MS_REQUEST_CHARGE: &str = "x-ms-request-charge";
const MS_RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CosmosClientError {
    #[snafu(display("{name} must not be empty"))]
    EmptySetting { name: &'static str },

    #[snafu(display("Master key is not valid base64: {source}"))]
    InvalidMasterKey { source: base64::DecodeError },

    #[snafu(display("Invalid endpoint URL: {source}"))]
    InvalidEndpoint { source: url::ParseError },

    #[snafu(display("Endpoint does not support path segments: {url}"))]
    EndpointCannotHavePathSegments { url: String },

    #[snafu(display("Partition key path must look like /field or /a/b, got {path:?}"))]
    InvalidPartitionKeyPath { path: String },

    #[snafu(display("Invalid {name} header value: {source}"))]
    InvalidHeader {
        name: &'static str,
        source: http::header::InvalidHeaderValue,
    },

    #[snafu(display("Failed to build the HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
}

#[derive(Clone, Debug, Builder)]
pub struct CosmosClientConfig {
    /// Account endpoint, e.g. `https://myaccount.documents.azure.com:443/`.
    #[builder(into)]
    pub endpoint: String,

    /// Base64-encoded account master key.
    #[builder(into)]
    pub master_key: String,

    #[builder(into)]
    pub database: String,

    #[builder(into)]
    pub collection: String,

    /// Path of the partition key inside each document (`/tenant`). Required by
    /// partitioned collections.
    #[builder(into)]
    pub partition_key_path: Option<String>,

    #[builder(into, default = DEFAULT_API_VERSION.to_owned())]
    pub api_version: String,

    #[builder(default = Duration::from_secs(60))]
    pub request_timeout: Duration,

    #[builder(into, default = DEFAULT_USER_AGENT.to_owned())]
    pub user_agent: String,

    /// Used as is instead of building a client from `request_timeout`.
    pub reqwest_client: Option<reqwest::Client>,
}

struct Inner {
    http: reqwest::Client,
    docs_url: Url,
    resource_link: String,
    key: Vec<u8>,
    partition_key: Option<Vec<String>>,
    api_version: HeaderValue,
    user_agent: HeaderValue,
}

/// Upserts documents into one collection. Cheap to clone; clones share the connection
/// pool.
#[derive(Clone)]
pub struct CosmosClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CosmosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosClient")
            .field("docs_url", &self.inner.docs_url.as_str())
            .field("partition_key", &self.inner.partition_key)
            .finish_non_exhaustive()
    }
}

impl CosmosClient {
    pub fn new(config: CosmosClientConfig) -> Result<Self, CosmosClientError> {
        for (name, value) in [
            ("endpoint", &config.endpoint),
            ("master key", &config.master_key),
            ("database", &config.database),
            ("collection", &config.collection),
        ] {
            snafu::ensure!(!value.trim().is_empty(), EmptySettingSnafu { name });
        }

        let key = STANDARD
            .decode(config.master_key.trim())
            .context(InvalidMasterKeySnafu)?;

        let mut docs_url = Url::parse(&config.endpoint).context(InvalidEndpointSnafu)?;
        docs_url
            .path_segments_mut()
            .ok()
            .context(EndpointCannotHavePathSegmentsSnafu {
                url: config.endpoint.clone(),
            })?
            .pop_if_empty()
            .extend([
                "dbs",
                config.database.as_str(),
                "colls",
                config.collection.as_str(),
                "docs",
            ]);

        let partition_key = config
            .partition_key_path
            .as_deref()
            .map(parse_partition_key_path)
            .transpose()?;

        let api_version = HeaderValue::from_str(&config.api_version)
            .context(InvalidHeaderSnafu { name: MS_VERSION })?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .context(InvalidHeaderSnafu { name: "user-agent" })?;

        let http = match config.reqwest_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(config.request_timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .context(BuildClientSnafu)?,
        };

        info!(
            target: "cosmos_client",
            url = %docs_url,
            partition_key_path = ?config.partition_key_path,
            "Cosmos client initialized."
        );

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                resource_link: format!("dbs/{}/colls/{}", config.database, config.collection),
                docs_url,
                key,
                partition_key,
                api_version,
                user_agent,
            }),
        })
    }

    pub fn docs_url(&self) -> &Url {
        &self.inner.docs_url
    }

    /// The signed upsert request for `document`, dated `date`.
    pub fn build_request(
        &self,
        document: &Document,
        date: DateTime<Utc>,
    ) -> Result<HttpRequest<Bytes>, StoreError> {
        let inner = &self.inner;
        let date = format_date(date);
        let token = authorization_token(&inner.key, "post", "docs", &inner.resource_link, &date);

        let mut builder = HttpRequest::post(inner.docs_url.as_str())
            .header(header::AUTHORIZATION, token)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, inner.user_agent.clone())
            .header(MS_DATE, date)
            .header(MS_VERSION, inner.api_version.clone())
            .header(MS_UPSERT, "True");

        if let Some(path) = &inner.partition_key {
            builder = builder.header(MS_PARTITION_KEY, partition_key_header(document, path)?);
        }

        builder
            .body(document.body().clone())
            .map_err(|error| StoreError::InvalidRequest {
                details: error.to_string(),
            })
    }
}

impl Service<Document> for CosmosClient {
    type Response = WriteReceipt;
    type Error = StoreError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, document: Document) -> Self::Future {
        let request = self
            .build_request(&document, Utc::now())
            .and_then(|request| {
                reqwest::Request::try_from(request).map_err(|error| StoreError::InvalidRequest {
                    details: error.to_string(),
                })
            });
        let http = self.inner.http.clone();

        Box::pin(async move {
            let request = request?;
            trace!(target: "cosmos_client", document = %document, "Sending upsert.");
            let response = http.execute(request).await.map_err(|error| {
                if error.is_timeout() {
                    StoreError::Timeout
                } else {
                    debug!(target: "cosmos_client", document = %document, %error, "Transport error.");
                    StoreError::Transport {
                        source: Box::new(error),
                    }
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return Ok(WriteReceipt::new(request_charge(response.headers())));
            }

            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_owned());
            let error = error_for_status(status, &headers, body);
            if !status.is_server_error() && status != StatusCode::TOO_MANY_REQUESTS {
                warn!(target: "cosmos_client", document = %document, %status, %error, "Write rejected.");
            }
            Err(error)
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

/// RFC 1123 date in the form the signature and `x-ms-date` expect.
pub fn format_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// URL-encoded master-key authorization header value.
pub fn authorization_token(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> String {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 takes keys of any size"),
    };
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    let token = format!("type=master&ver=1.0&sig={signature}");
    url::form_urlencoded::byte_serialize(token.as_bytes()).collect()
}

fn parse_partition_key_path(path: &str) -> Result<Vec<String>, CosmosClientError> {
    let segments: Vec<String> = path
        .strip_prefix('/')
        .map(|rest| rest.split('/').map(str::to_owned).collect())
        .unwrap_or_default();
    snafu::ensure!(
        !segments.is_empty() && segments.iter().all(|segment| !segment.is_empty()),
        InvalidPartitionKeyPathSnafu { path }
    );
    Ok(segments)
}

/// JSON array holding the document's partition key value. A document without the field
/// is sent with the undefined key `[{}]`.
fn partition_key_header(document: &Document, path: &[String]) -> Result<String, StoreError> {
    let json = document
        .json()
        .map_err(|error| StoreError::InvalidRequest {
            details: format!("{document} is not valid JSON: {error}"),
        })?;
    let value = path
        .iter()
        .try_fold(&json, |value, segment| value.get(segment.as_str()));
    let header = match value {
        Some(value) => Value::Array(vec![value.clone()]),
        None => serde_json::json!([{}]),
    };
    Ok(header.to_string())
}

fn request_charge(headers: &HeaderMap) -> f64 {
    headers
        .get(MS_REQUEST_CHARGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0.0)
}

fn error_for_status(status: StatusCode, headers: &HeaderMap, body: String) -> StoreError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(MS_RETRY_AFTER_MS)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis);
        StoreError::Throttled { retry_after }
    } else {
        StoreError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
