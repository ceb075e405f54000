//! Azure Cosmos DB (SQL API) document store over the REST interface.

use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use bon::Builder;
use bytes::Bytes;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use http::{HeaderValue, Method, Request as HttpRequest, Response as HttpResponse, StatusCode};
use sha2::Sha256;
use snafu::{ResultExt, Snafu};
use tower::{
    BoxError, Service, ServiceExt,
    timeout::{Timeout, error::Elapsed},
};
use url::{Url, form_urlencoded};

use super::{CollectionRef, Document, DocumentStore};
use crate::adaptive_concurrency::{
    MIN_LOADERS,
    retries::{RetryAction, RetryLogic},
};

const API_VERSION: &str = "2018-12-31";
const RETRY_AFTER_HEADER: &str = "x-ms-retry-after-ms";
const PARTITION_KEY_HEADER: &str = "x-ms-documentdb-partitionkey";
// Used when a 429 arrives without a retry-after header.
const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_millis(100);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("Store transport error: {}", source))]
    Transport { source: reqwest::Error },

    /// The request took longer than the connection policy allows.
    #[snafu(display("Store request timed out after {:?}", timeout))]
    Timeout { timeout: Duration },

    /// The request itself was malformed or invalid before sending.
    #[snafu(display("Invalid store request: {}", details))]
    InvalidRequest { details: String },

    /// The request exceeded the collection's request-unit budget.
    #[snafu(display("Request rate is large; retry after {:?}", retry_after))]
    Throttled { retry_after: Option<Duration> },

    /// The store answered with an error status other than throttling.
    #[snafu(display("Store error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    #[snafu(display("Master key is not valid base64: {}", source))]
    InvalidKey { source: base64::DecodeError },

    #[snafu(display("Failed to serialize document: {}", source))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Invalid endpoint '{}': {}", endpoint, source))]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display("Failed to build HTTP client: {}", source))]
    BuildClient { source: reqwest::Error },
}

/// Connection settings handed to the store client.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_connections` | 12 | Idle connections kept pooled per host; twice the loader ceiling |
/// | `request_timeout` | 120s | Upper bound of a single request |
/// | `max_retry_attempts_on_throttle` | 10 | 429 responses retried inside the client before the loader sees them |
/// | `max_retry_wait` | 120s | Cumulative wait the client spends on those retries |
///
/// `max_connections` becomes reqwest's `pool_max_idle_per_host`. It caps the
/// idle connections kept for reuse, not the connections open at once; those
/// are bounded by the loader's concurrency window.
#[derive(Clone, Copy, Debug, Builder)]
pub struct ConnectionPolicy {
    #[builder(default = 12)]
    max_connections: usize,
    #[builder(default = Duration::from_secs(120))]
    request_timeout: Duration,
    #[builder(default = 10)]
    max_retry_attempts_on_throttle: usize,
    #[builder(default = Duration::from_secs(120))]
    max_retry_wait: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConnectionPolicy {
    /// Default policy sized for `max_loaders` concurrent workers.
    pub fn for_loaders(max_loaders: usize) -> Self {
        Self::builder()
            .max_connections(max_loaders.max(MIN_LOADERS) * 2)
            .build()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_retry_attempts_on_throttle(&self) -> usize {
        self.max_retry_attempts_on_throttle
    }

    pub fn max_retry_wait(&self) -> Duration {
        self.max_retry_wait
    }
}

/// A `tower::Service` wrapper for `reqwest::Client`.
///
/// Successful responses are returned as-is; 429 becomes
/// [`StoreError::Throttled`] and every other error status
/// [`StoreError::ServerError`].
#[derive(Clone)]
pub struct CosmosTransport {
    client: reqwest::Client,
}

impl CosmosTransport {
    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<HttpRequest<Option<Bytes>>> for CosmosTransport {
    type Response = HttpResponse<Bytes>;
    type Error = StoreError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, http_request: HttpRequest<Option<Bytes>>) -> Self::Future {
        let (parts, body_option) = http_request.into_parts();

        let url_str = parts.uri.to_string();
        let url = match reqwest::Url::parse(&url_str) {
            Ok(u) => u,
            Err(parse_err) => {
                let error = StoreError::InvalidRequest {
                    details: format!("Invalid URL '{}': {}", url_str, parse_err),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let mut request_builder = self.client.request(parts.method, url).headers(parts.headers);
        if let Some(body) = body_option {
            request_builder = request_builder.body(body);
        }

        let request_future = request_builder.send();
        Box::pin(async move {
            let response = request_future.await.context(TransportSnafu)?;
            let status = response.status();
            if status.is_success() {
                let headers = response.headers().clone();
                let body = response.bytes().await.context(TransportSnafu)?;
                let mut out = HttpResponse::new(body);
                *out.status_mut() = status;
                *out.headers_mut() = headers;
                return Ok(out);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_retry_after);
                debug!(status = %status, retry_after = ?retry_after, "Request rate is large.");
                return Err(StoreError::Throttled { retry_after });
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());
            if status.is_server_error() {
                warn!(status = %status, error_body = %error_body, "Server error");
            } else {
                error!(status = %status, error_body = %error_body, "Client error");
            }
            Err(StoreError::ServerError {
                status: status.as_u16(),
                body: error_body,
            })
        })
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let millis = value.trim().parse::<f64>().ok()?;
    (millis.is_finite() && millis >= 0.0).then(|| Duration::from_nanos((millis * 1_000_000.0) as u64))
}

/// Signs requests with the account's master key.
struct MasterKey(Vec<u8>);

impl MasterKey {
    fn parse(key: &str) -> Result<Self, StoreError> {
        BASE64_STANDARD
            .decode(key.trim())
            .context(InvalidKeySnafu)
            .map(Self)
    }

    fn authorization(
        &self,
        verb: &Method,
        resource_type: &str,
        resource_link: &str,
        date: &str,
    ) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n\n",
            verb.as_str().to_lowercase(),
            resource_type.to_lowercase(),
            resource_link,
            date.to_lowercase()
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        let token = format!("type=master&ver=1.0&sig={signature}");
        form_urlencoded::byte_serialize(token.as_bytes()).collect()
    }
}

/// Expands a bare account name to its public endpoint; full URLs are kept.
pub fn resolve_endpoint(account: &str) -> Result<Url, StoreError> {
    let account = account.trim();
    let raw = if account.contains("://") {
        account.to_string()
    } else {
        format!("https://{}.documents.azure.com:443/", account.to_lowercase())
    };
    let mut url = Url::parse(&raw).context(InvalidEndpointSnafu { endpoint: raw.clone() })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Document store backed by a Cosmos DB account.
#[derive(Clone)]
pub struct CosmosStore {
    service: Timeout<CosmosTransport>,
    endpoint: Url,
    key: Arc<MasterKey>,
    policy: ConnectionPolicy,
    partition_key: Option<Arc<str>>,
}

impl CosmosStore {
    pub fn new(account: &str, key: &str, policy: ConnectionPolicy) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(policy.max_connections())
            .user_agent(concat!("adaptive-bulk-loader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(BuildClientSnafu)?;

        Ok(Self {
            service: Timeout::new(
                CosmosTransport::new_with_client(client),
                policy.request_timeout(),
            ),
            endpoint: resolve_endpoint(account)?,
            key: Arc::new(MasterKey::parse(key)?),
            policy,
            partition_key: None,
        })
    }

    /// Opens the account and checks that `database` exists.
    pub async fn connect(
        account: &str,
        key: &str,
        database: &str,
        policy: ConnectionPolicy,
    ) -> Result<Self, StoreError> {
        let store = Self::new(account, key, policy)?;
        store.read_resource("dbs", &format!("dbs/{database}")).await?;
        info!(endpoint = %store.endpoint, database, "Connected to document store.");
        Ok(store)
    }

    /// Sends the value at `path` (for example `/id`) as the partition key of every upsert.
    pub fn with_partition_key(mut self, path: impl AsRef<str>) -> Self {
        let path = path.as_ref().trim();
        let pointer = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        self.partition_key = Some(pointer.into());
        self
    }

    /// Fails unless the collection exists.
    pub async fn ensure_collection(&self, collection: &CollectionRef) -> Result<(), StoreError> {
        self.read_resource("colls", &collection.link()).await
    }

    async fn read_resource(&self, resource_type: &str, link: &str) -> Result<(), StoreError> {
        let request = self.build_request(Method::GET, resource_type, link, link, None, None)?;
        self.send(request).await.map(drop)
    }

    fn build_request(
        &self,
        method: Method,
        resource_type: &str,
        resource_link: &str,
        path: &str,
        body: Option<Bytes>,
        partition_key: Option<&str>,
    ) -> Result<HttpRequest<Option<Bytes>>, StoreError> {
        let url = self
            .endpoint
            .join(path)
            .context(InvalidEndpointSnafu { endpoint: path })?;
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let authorization = self
            .key
            .authorization(&method, resource_type, resource_link, &date);

        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(url.as_str())
            .header("authorization", authorization)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("accept", "application/json");
        if body.is_some() {
            builder = builder
                .header("content-type", "application/json")
                .header("x-ms-documentdb-is-upsert", "True");
        }
        if let Some(partition_key) = partition_key {
            let value = HeaderValue::from_bytes(partition_key.as_bytes()).map_err(|e| {
                StoreError::InvalidRequest {
                    details: format!("Invalid partition key '{}': {}", partition_key, e),
                }
            })?;
            builder = builder.header(PARTITION_KEY_HEADER, value);
        }

        builder
            .body(body)
            .map_err(|e| StoreError::InvalidRequest {
                details: e.to_string(),
            })
    }

    async fn send(
        &self,
        request: HttpRequest<Option<Bytes>>,
    ) -> Result<HttpResponse<Bytes>, StoreError> {
        let mut service = self.service.clone();
        let timeout = self.policy.request_timeout();
        service
            .ready()
            .await
            .map_err(|error| from_service_error(error, timeout))?
            .call(request)
            .await
            .map_err(|error| from_service_error(error, timeout))
    }

    fn partition_key_value(&self, document: &Document) -> Option<String> {
        let pointer = self.partition_key.as_deref()?;
        let key = document
            .pointer(pointer)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        Some(serde_json::Value::Array(vec![key]).to_string())
    }
}

fn from_service_error(error: BoxError, timeout: Duration) -> StoreError {
    match error.downcast::<StoreError>() {
        Ok(store_error) => *store_error,
        Err(error) if error.is::<Elapsed>() => StoreError::Timeout { timeout },
        Err(error) => StoreError::InvalidRequest {
            details: error.to_string(),
        },
    }
}

#[async_trait]
impl DocumentStore for CosmosStore {
    type Error = StoreError;

    async fn upsert(
        &self,
        collection: &CollectionRef,
        document: &Document,
    ) -> Result<(), StoreError> {
        let body = Bytes::from(serde_json::to_vec(document).context(SerializeSnafu)?);
        let partition_key = self.partition_key_value(document);
        let link = collection.link();
        let path = format!("{link}/docs");

        let mut attempts = 0;
        let mut waited = Duration::ZERO;
        loop {
            let request = self.build_request(
                Method::POST,
                "docs",
                &link,
                &path,
                Some(body.clone()),
                partition_key.as_deref(),
            )?;
            match self.send(request).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Throttled { retry_after }) => {
                    let delay = retry_after.unwrap_or(DEFAULT_THROTTLE_DELAY);
                    if attempts >= self.policy.max_retry_attempts_on_throttle()
                        || waited + delay > self.policy.max_retry_wait()
                    {
                        return Err(StoreError::Throttled { retry_after });
                    }
                    attempts += 1;
                    waited += delay;
                    trace!(
                        collection = %collection,
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        "Retrying throttled request inside the client."
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Treats 429 responses as throttling and everything else as fatal.
#[derive(Clone, Copy, Debug, Default)]
pub struct CosmosRetryLogic;

impl RetryLogic for CosmosRetryLogic {
    type Error = StoreError;

    fn retry_action(&self, error: &Self::Error) -> RetryAction {
        match error {
            StoreError::Throttled { retry_after } => RetryAction::Throttled(*retry_after),
            other => RetryAction::DontRetry(other.to_string().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, header_regex, method, path},
    };

    use super::*;

    // base64 of "test-master-key"
    const KEY: &str = "dGVzdC1tYXN0ZXIta2V5";

    fn policy() -> ConnectionPolicy {
        ConnectionPolicy::builder()
            .max_retry_attempts_on_throttle(0)
            .request_timeout(Duration::from_secs(5))
            .build()
    }

    fn movies() -> CollectionRef {
        CollectionRef::new("imdb", "movies")
    }

    #[test]
    fn bare_account_names_expand_to_the_public_endpoint() {
        let url = resolve_endpoint(" MyAccount ").unwrap();
        assert_eq!(url.as_str(), "https://myaccount.documents.azure.com/");

        let url = resolve_endpoint("http://localhost:8081/base").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8081/base/");
    }

    #[test]
    fn rejects_keys_that_are_not_base64() {
        let error = CosmosStore::new("account", "not base64!", policy()).err().unwrap();
        assert!(matches!(error, StoreError::InvalidKey { .. }));
    }

    #[test]
    fn authorization_token_is_url_encoded_and_verb_specific() {
        let key = MasterKey::parse(KEY).unwrap();
        let date = "Tue, 01 Oct 2024 10:00:00 GMT";
        let post = key.authorization(&Method::POST, "docs", "dbs/imdb/colls/movies", date);
        let again = key.authorization(&Method::POST, "docs", "dbs/imdb/colls/movies", date);
        let get = key.authorization(&Method::GET, "docs", "dbs/imdb/colls/movies", date);

        assert!(post.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        assert_eq!(post, again);
        assert_ne!(post, get);
    }

    #[test]
    fn retry_after_accepts_integer_and_fractional_millis() {
        assert_eq!(parse_retry_after("200"), Some(Duration::from_millis(200)));
        assert_eq!(parse_retry_after("12.5"), Some(Duration::from_micros(12_500)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn classifies_throttling_and_fatal_errors() {
        let logic = CosmosRetryLogic;
        let throttled = StoreError::Throttled {
            retry_after: Some(Duration::from_millis(200)),
        };
        assert!(matches!(
            logic.retry_action(&throttled),
            RetryAction::Throttled(Some(d)) if d == Duration::from_millis(200)
        ));

        let not_found = StoreError::ServerError {
            status: 404,
            body: "Resource Not Found".into(),
        };
        assert!(logic.retry_action(&not_found).is_not_retryable());
        let unavailable = StoreError::ServerError {
            status: 503,
            body: "Service Unavailable".into(),
        };
        assert!(logic.retry_action(&unavailable).is_not_retryable());
        assert!(logic.retry_action(&StoreError::Timeout {
            timeout: Duration::from_secs(1)
        })
        .is_not_retryable());
    }

    #[tokio::test]
    async fn upsert_posts_the_document_with_upsert_headers() {
        let server = MockServer::start().await;
        let document = json!({"id": "tt0000001", "type": "Movie"});
        Mock::given(method("POST"))
            .and(path("/dbs/imdb/colls/movies/docs"))
            .and(header("x-ms-documentdb-is-upsert", "True"))
            .and(header("x-ms-version", API_VERSION))
            .and(header_regex("authorization", "^type%3Dmaster%26ver%3D1.0%26sig%3D.+"))
            .and(body_json(&document))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = CosmosStore::new(&server.uri(), KEY, policy()).unwrap();
        store.upsert(&movies(), &document).await.unwrap();
    }

    #[tokio::test]
    async fn partition_key_is_taken_from_the_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(PARTITION_KEY_HEADER, r#"["Movie"]"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = CosmosStore::new(&server.uri(), KEY, policy())
            .unwrap()
            .with_partition_key("type");
        store
            .upsert(&movies(), &json!({"id": "tt1", "type": "Movie"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn throttling_surfaces_the_suggested_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header(RETRY_AFTER_HEADER, "250"))
            .expect(1)
            .mount(&server)
            .await;

        let store = CosmosStore::new(&server.uri(), KEY, policy()).unwrap();
        let error = store.upsert(&movies(), &json!({"id": "1"})).await.unwrap_err();
        assert!(matches!(
            error,
            StoreError::Throttled { retry_after: Some(d) } if d == Duration::from_millis(250)
        ));
        assert!(CosmosRetryLogic.retry_action(&error).is_throttled());
    }

    #[tokio::test]
    async fn throttling_without_a_header_has_no_suggested_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let store = CosmosStore::new(&server.uri(), KEY, policy()).unwrap();
        let error = store.upsert(&movies(), &json!({"id": "1"})).await.unwrap_err();
        assert!(matches!(error, StoreError::Throttled { retry_after: None }));
        assert!(matches!(
            CosmosRetryLogic.retry_action(&error),
            RetryAction::Throttled(None)
        ));
    }

    #[tokio::test]
    async fn client_retries_throttling_within_its_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header(RETRY_AFTER_HEADER, "5"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let policy = ConnectionPolicy::builder()
            .max_retry_attempts_on_throttle(3)
            .build();
        let store = CosmosStore::new(&server.uri(), KEY, policy).unwrap();
        store.upsert(&movies(), &json!({"id": "1"})).await.unwrap();
    }

    #[tokio::test]
    async fn error_statuses_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad document"))
            .mount(&server)
            .await;

        let store = CosmosStore::new(&server.uri(), KEY, policy()).unwrap();
        let error = store.upsert(&movies(), &json!({"id": "1"})).await.unwrap_err();
        assert!(matches!(
            &error,
            StoreError::ServerError { status: 400, body } if body == "bad document"
        ));
        assert!(CosmosRetryLogic.retry_action(&error).is_not_retryable());
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let policy = ConnectionPolicy::builder()
            .request_timeout(Duration::from_millis(50))
            .build();
        let store = CosmosStore::new(&server.uri(), KEY, policy).unwrap();
        let error = store.upsert(&movies(), &json!({"id": "1"})).await.unwrap_err();
        assert!(matches!(error, StoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn connect_checks_database_and_collection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dbs/imdb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "imdb"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dbs/imdb/colls/movies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "movies"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dbs/imdb/colls/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = CosmosStore::connect(&server.uri(), KEY, "imdb", policy())
            .await
            .unwrap();
        store.ensure_collection(&movies()).await.unwrap();
        let error = store
            .ensure_collection(&CollectionRef::new("imdb", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::ServerError { status: 404, .. }));
    }
}
