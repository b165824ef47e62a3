//! Credential-isolating streaming proxy.
//!
//! Sandboxed sessions reach the LLM API through this server. Every request
//! carries a placeholder credential; the proxy swaps in the real secret,
//! forwards to the fixed upstream origin, and relays the response body chunk
//! by chunk as it arrives.
//!
//! The real secret is loaded once at startup and lives only in this process.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ProxyConfig;
use crate::error::{ConfigError, ProxyError};
use crate::secrets::DecryptedSecret;

/// Inbound headers that describe the inbound hop and never travel upstream.
fn is_hop_header(name: &HeaderName) -> bool {
    name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING
}

/// Upstream response headers that describe the upstream hop. The relayed body
/// is re-framed, so its length and transfer coding are set downstream.
fn is_response_hop_header(name: &HeaderName) -> bool {
    name == CONTENT_LENGTH
        || name == TRANSFER_ENCODING
        || name == CONNECTION
        || name == UPGRADE
        || name.as_str() == "keep-alive"
}

const DEFAULT_CONTENT_TYPE: &str = "text/event-stream";

/// Shared, immutable state for the proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream: Arc<str>,
    credential_header: HeaderName,
    credential: HeaderValue,
    limiter: Arc<Semaphore>,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig, secret: &DecryptedSecret) -> Result<Self, ConfigError> {
        let credential_header = HeaderName::from_bytes(config.credential_header.as_bytes())
            .map_err(|e| ConfigError::InvalidValue {
                key: "PROXY_CREDENTIAL_HEADER".to_string(),
                message: e.to_string(),
            })?;
        let mut credential =
            HeaderValue::from_str(secret.expose()).map_err(|_| ConfigError::InvalidValue {
                key: config.secret_name.clone(),
                message: "secret is not a valid header value".to_string(),
            })?;
        credential.set_sensitive(true);

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            upstream: Arc::from(config.upstream_url.trim_end_matches('/')),
            credential_header,
            credential,
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
        })
    }

    /// Permits not currently held by an in-flight request.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    fn upstream_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.upstream, path_and_query)
    }
}

/// Build the outbound header set.
///
/// Copies every inbound header except the stripped ones, then sets the
/// credential header to the real secret, replacing whatever the caller sent.
pub fn outbound_headers(
    inbound: &HeaderMap,
    credential_header: &HeaderName,
    credential: &HeaderValue,
) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_header(name) || name == credential_header {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound.insert(credential_header.clone(), credential.clone());
    outbound
}

/// Build the header set returned to the caller.
///
/// End-to-end headers (`content-type`, `content-encoding`, rate-limit and
/// request-id headers) pass through unchanged, so the body bytes stay
/// consistent with their labels. `content-type` defaults to an event stream.
pub fn relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if !is_response_hop_header(name) {
            relayed.append(name.clone(), value.clone());
        }
    }
    if !relayed.contains_key(CONTENT_TYPE) {
        relayed.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }
    relayed
}

/// The proxy's HTTP server.
pub struct CredentialProxy;

impl CredentialProxy {
    /// Build the axum router: one catch-all POST route.
    ///
    /// Request bodies are forwarded whole, so axum's default body cap is off;
    /// the upstream enforces its own size limit.
    pub fn router(state: ProxyState) -> Router {
        Router::new()
            .route("/{*path}", post(forward))
            .layer(DefaultBodyLimit::disable())
            .with_state(state)
    }

    /// Bind to the configured address and serve until the process is killed.
    pub async fn start(
        config: &ProxyConfig,
        secret: &DecryptedSecret,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let state = ProxyState::new(config, secret)?;
        let addr = config.listen_addr()?;
        let router = Self::router(state);

        tracing::info!(
            upstream = %config.upstream_url,
            max_concurrency = config.max_concurrency,
            timeout_secs = config.timeout_secs,
            "Credential proxy listening on {}",
            addr
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

// -- Handlers --

async fn forward(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match relay(&state, &uri, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(path = %uri.path(), error = %e, "Upstream request failed");
            let status = match e {
                ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
                ProxyError::LimiterClosed => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn relay(
    state: &ProxyState,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let permit = Arc::clone(&state.limiter)
        .acquire_owned()
        .await
        .map_err(|_| ProxyError::LimiterClosed)?;

    let url = state.upstream_url(uri);
    tracing::debug!(url = %url, bytes = body.len(), "Forwarding request");

    let upstream = state
        .client
        .post(&url)
        .headers(outbound_headers(
            headers,
            &state.credential_header,
            &state.credential,
        ))
        .body(body)
        .send()
        .await
        .map_err(classify)?;

    let status = upstream.status();
    let headers = relayed_headers(upstream.headers());

    let body = Body::from_stream(hold_permit(upstream.bytes_stream(), permit));
    Ok((status, headers, body).into_response())
}

fn classify(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout
    } else {
        ProxyError::Transport(e.to_string())
    }
}

/// Pass chunks through untouched, keeping `permit` alive until the stream is
/// exhausted or dropped.
fn hold_permit<S>(
    chunks: S,
    permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    chunks.map(move |chunk| {
        let _held = &permit;
        if let Err(ref e) = chunk {
            tracing::warn!(error = %e, "Upstream stream broke mid-response");
        }
        chunk
    })
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use futures::stream;
    use tower::ServiceExt;

    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn outbound_headers_swap_credential_and_strip_hop_headers() {
        let inbound = header_map(&[
            ("host", "proxy.internal:8080"),
            ("content-length", "42"),
            ("x-api-key", "PLACEHOLDER"),
            ("x", "y"),
        ]);
        let out = outbound_headers(
            &inbound,
            &HeaderName::from_static("x-api-key"),
            &HeaderValue::from_static("REAL"),
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out["x"], "y");
        assert_eq!(out["x-api-key"], "REAL");
        assert!(!out.contains_key(HOST));
        assert!(!out.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn outbound_headers_add_credential_when_caller_sent_none() {
        let inbound = header_map(&[("anthropic-version", "2023-06-01")]);
        let out = outbound_headers(
            &inbound,
            &HeaderName::from_static("x-api-key"),
            &HeaderValue::from_static("REAL"),
        );
        assert_eq!(out["x-api-key"], "REAL");
        assert_eq!(out["anthropic-version"], "2023-06-01");
    }

    #[test]
    fn outbound_headers_keep_repeated_values() {
        let inbound = header_map(&[("accept", "text/event-stream"), ("accept", "application/json")]);
        let out = outbound_headers(
            &inbound,
            &HeaderName::from_static("x-api-key"),
            &HeaderValue::from_static("REAL"),
        );
        assert_eq!(out.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn outbound_headers_strip_transfer_encoding() {
        let inbound = header_map(&[("transfer-encoding", "chunked"), ("x", "y")]);
        let out = outbound_headers(
            &inbound,
            &HeaderName::from_static("x-api-key"),
            &HeaderValue::from_static("REAL"),
        );
        assert!(!out.contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn relayed_headers_keep_encoding_and_drop_framing() {
        let upstream = header_map(&[
            ("content-type", "application/json"),
            ("content-encoding", "gzip"),
            ("content-length", "31"),
            ("connection", "keep-alive"),
            ("request-id", "req_011"),
        ]);
        let relayed = relayed_headers(&upstream);

        assert_eq!(relayed["content-type"], "application/json");
        assert_eq!(relayed["content-encoding"], "gzip");
        assert_eq!(relayed["request-id"], "req_011");
        assert!(!relayed.contains_key(CONTENT_LENGTH));
        assert!(!relayed.contains_key(CONNECTION));
    }

    #[test]
    fn relayed_headers_default_to_event_stream() {
        let relayed = relayed_headers(&HeaderMap::new());
        assert_eq!(relayed[CONTENT_TYPE], DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn hold_permit_relays_chunks_in_order_and_releases() {
        let limiter = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&limiter).acquire_owned().await.unwrap();
        let chunks = vec![
            Ok(Bytes::from_static(b"event: a\n\n")),
            Ok(Bytes::from_static(b"event: b\n\n")),
            Ok(Bytes::from_static(b"event: c\n\n")),
        ];

        let relayed = hold_permit(stream::iter(chunks), permit);
        assert_eq!(limiter.available_permits(), 0);
        let relayed: Vec<Bytes> = relayed.map(|c| c.unwrap()).collect().await;

        assert_eq!(
            relayed,
            vec![
                Bytes::from_static(b"event: a\n\n"),
                Bytes::from_static(b"event: b\n\n"),
                Bytes::from_static(b"event: c\n\n"),
            ]
        );
        assert_eq!(limiter.available_permits(), 1);
    }

    fn test_state(upstream: &str) -> ProxyState {
        let config = ProxyConfig {
            upstream_url: upstream.to_string(),
            timeout_secs: 5,
            ..ProxyConfig::default()
        };
        ProxyState::new(&config, &DecryptedSecret::from_string("sk-real".to_string())).unwrap()
    }

    #[test]
    fn upstream_url_keeps_path_and_query() {
        let state = test_state("https://api.example.com/");
        let uri: Uri = "/v1/messages?beta=true".parse().unwrap();
        assert_eq!(
            state.upstream_url(&uri),
            "https://api.example.com/v1/messages?beta=true"
        );
    }

    #[test]
    fn invalid_credential_header_is_config_error() {
        let config = ProxyConfig {
            credential_header: "bad header".to_string(),
            ..ProxyConfig::default()
        };
        let secret = DecryptedSecret::from_string("sk".to_string());
        let err = ProxyState::new(&config, &secret).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        // Port 1 on loopback refuses connections.
        let router = CredentialProxy::router(test_state("http://127.0.0.1:1"));
        let req = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .body(Body::from("{}"))
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn get_is_not_routed() {
        let router = CredentialProxy::router(test_state("http://127.0.0.1:1"));
        let req = Request::builder()
            .uri("/v1/messages")
            .body(Body::empty())
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
