//! Forwarding with per-attempt timeouts and bounded retries.

use std::net::IpAddr;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::Client as HttpClient;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::proxy::headers::{
    apply_forwarded_headers, apply_header_rules, filter_request_headers, filter_response_headers, to_reqwest_headers,
};
use crate::proxy::ProxyConfig;

/// A buffered inbound request, ready to forward
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path as received, before any rewrite
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the caller
    pub client_addr: Option<IpAddr>,
    /// Scheme the caller used, for `X-Forwarded-Proto`
    pub scheme: String,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
            scheme: "http".to_string(),
        }
    }
}

/// A fully read upstream response
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// HTTP forwarder shared by every service
#[derive(Clone)]
pub struct ReverseProxy {
    client: HttpClient,
}

impl ReverseProxy {
    /// Build the shared client; redirects are relayed, not followed
    pub fn new() -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Forward `request` to `backend_url`.
    ///
    /// Any response that arrives, 5xx included, is returned as `Ok`. Only
    /// transport failures and timeouts are retried.
    pub async fn proxy(&self, request: ProxyRequest, backend_url: &Url, config: &ProxyConfig) -> GatewayResult<ProxyResponse> {
        let target = target_url(backend_url, &config.path_rewrite.apply(&request.path), request.query.as_deref());
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("Unsupported method {}: {}", request.method, e)))?;

        let mut headers = filter_request_headers(&request.headers);
        apply_forwarded_headers(
            &mut headers,
            request.client_addr,
            &request.scheme,
            request.headers.get(axum::http::header::HOST),
        );
        apply_header_rules(&mut headers, &config.add_headers, &config.remove_headers);
        let headers = to_reqwest_headers(&headers);

        let attempts = config.retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let start = Instant::now();
            debug!(target = %target, method = %method, attempt, "Forwarding request");

            let sent = self
                .client
                .request(method.clone(), target.clone())
                .headers(headers.clone())
                .body(request.body.clone())
                .timeout(config.timeout)
                .send()
                .await;

            let outcome = match sent {
                Ok(response) => read_response(response).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => {
                    debug!(
                        target = %target,
                        status = response.status.as_u16(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(target = %target, attempt, attempts, error = %e, "Upstream attempt failed");
                    last_error = Some(e);
                    if attempt < attempts && !config.retry_delay.is_zero() {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) if attempts == 1 && e.is_timeout() => GatewayError::ProxyTimeout {
                timeout_ms: config.timeout.as_millis() as u64,
            },
            Some(e) => GatewayError::ProxyExhaustedRetries {
                attempts,
                last_error: e.to_string(),
            },
            None => GatewayError::ProxyExhaustedRetries {
                attempts,
                last_error: "no attempt made".to_string(),
            },
        })
    }
}

async fn read_response(response: reqwest::Response) -> Result<ProxyResponse, reqwest::Error> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = filter_response_headers(response.headers());
    let body = response.bytes().await?;
    Ok(ProxyResponse { status, headers, body })
}

/// Backend base path joined with the rewritten request path
fn target_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    url
}
