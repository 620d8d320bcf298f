//! HTTP listeners: the proxy listener serves every path, the admin listener
//! serves the admin API and `/metrics`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::orchestrator::Gateway;
use crate::proxy::headers::X_FORWARDED_FOR;
use crate::proxy::ProxyRequest;

/// Header carrying an authenticated user id set by an upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct ProxyState {
    gateway: Arc<Gateway>,
    identity: Arc<ClientIdentity>,
    max_body_size: usize,
}

/// Router that sends every request through the gateway
pub fn gateway_router(gateway: Arc<Gateway>, config: &ServerConfig) -> Router {
    let state = ProxyState {
        gateway,
        identity: Arc::new(ClientIdentity::from_config(config)),
        max_body_size: config.max_body_size,
    };

    Router::new()
        .fallback(handle_request)
        .with_state(state)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_request(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let path = parts.uri.path().to_string();
    let Some(service) = state.gateway.resolve_service(&path).map(str::to_string) else {
        return GatewayError::service_not_found(path).into_response();
    };

    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return (
                axum::http::StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(serde_json::json!({
                    "error": {
                        "code": 413,
                        "message": "Request body too large",
                        "type": "payload_too_large",
                    }
                })),
            )
                .into_response();
        }
    };

    let identifier = state.identity.identify(&parts.headers, peer);
    let request = ProxyRequest {
        method: parts.method,
        path,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        client_addr: peer,
        scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
    };

    state.gateway.handle(&service, &identifier, request).await
}

/// Rate-limit identity of a caller.
///
/// The peer address is the identity unless configuration says a header can
/// be believed: `X-Forwarded-For` only from a trusted proxy, `X-User-Id` only
/// when an auth layer in front owns it.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    trusted_proxies: Vec<IpAddr>,
    trust_user_id_header: bool,
}

impl ClientIdentity {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            trusted_proxies: config.trusted_proxies.clone(),
            trust_user_id_header: config.trust_user_id_header,
        }
    }

    pub fn identify(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if self.trust_user_id_header {
            if let Some(user) = headers
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return format!("user:{}", user);
            }
        }

        if let Some(client) = peer.filter(|ip| self.is_trusted(ip)).and_then(|_| self.forwarded_client(headers)) {
            return format!("ip:{}", client);
        }

        match peer {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        }
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.contains(ip)
    }

    /// Rightmost forwarded hop that is not one of our proxies
    fn forwarded_client(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let hops: Vec<&str> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();

        let mut outermost = None;
        for hop in hops.iter().rev() {
            // Anything unparseable left of our proxies cannot be trusted.
            let ip: IpAddr = hop.parse().ok()?;
            if !self.is_trusted(&ip) {
                return Some(ip);
            }
            outermost = Some(ip);
        }
        outermost
    }
}

/// Serve both routers until `shutdown` is cancelled
pub async fn serve(
    config: &ServerConfig,
    gateway_app: Router,
    admin_app: Router,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let gateway_listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
        GatewayError::internal(format!("Failed to bind gateway server to {}: {}", config.bind_address, e))
    })?;
    let admin_listener = TcpListener::bind(&config.admin_bind_address).await.map_err(|e| {
        GatewayError::internal(format!("Failed to bind admin server to {}: {}", config.admin_bind_address, e))
    })?;

    info!("Gateway HTTP server listening on {}", config.bind_address);
    info!("Admin HTTP server listening on {}", config.admin_bind_address);

    let gateway_token = shutdown.clone();
    let gateway_server = axum::serve(
        gateway_listener,
        gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { gateway_token.cancelled().await });

    let admin_token = shutdown.clone();
    let admin_server = axum::serve(admin_listener, admin_app.into_make_service())
        .with_graceful_shutdown(async move { admin_token.cancelled().await });

    let (gateway_result, admin_result) = tokio::join!(
        async move { gateway_server.await },
        async move { admin_server.await }
    );
    gateway_result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
    admin_result.map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))?;

    info!("HTTP servers stopped");
    Ok(())
}
