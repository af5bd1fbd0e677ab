use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tideway_cache::RequestIdentity;
use tracing::info;
use uuid::Uuid;

use crate::metrics::record_http_request;
use crate::server::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    // Preserve an incoming request id, otherwise generate one
    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// Count requests by matched route to keep label cardinality bounded.
pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let res = next.run(req).await;
    record_http_request(&method, &route, res.status().as_u16(), started.elapsed());
    res
}

/// Who is asking.
///
/// `X-User-Id` and the first `X-Forwarded-For` hop count only when the peer
/// is a trusted proxy; anyone else is keyed on the peer address alone.
pub fn request_identity(req: &Request<Body>, trusted_proxies: &[IpAddr]) -> RequestIdentity {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if !peer.is_some_and(|ip| trusted_proxies.contains(&ip)) {
        return RequestIdentity {
            user_id: None,
            ip: peer.map(|ip| ip.to_string()),
        };
    }

    let header_text = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let user_id = header_text(USER_ID_HEADER);
    let ip = header_text("x-forwarded-for")
        .and_then(|chain| chain.split(',').next().map(|hop| hop.trim().to_string()))
        .filter(|hop| !hop.is_empty())
        .or_else(|| peer.map(|ip| ip.to_string()));

    RequestIdentity { user_id, ip }
}

/// Multi-scope sliding-window limit in front of booking intake.
pub async fn booking_rate_limit(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let identity = request_identity(&req, &state.services.config.rate_limit.trusted_proxies);
    let decision = state.policy.check(&identity).await;

    if !decision.allowed {
        let now = state.services.clock.now();
        let retry_after = decision
            .retry_at
            .map(|at| {
                let millis = (at - now).whole_milliseconds().max(0);
                ((millis + 999) / 1000) as u64
            })
            .unwrap_or(1)
            .max(1);
        info!(
            scope = decision.denied_scope.as_deref().unwrap_or(""),
            retry_after_secs = retry_after,
            "booking request rate limited"
        );
        return too_many_requests(retry_after);
    }

    let mut res = next.run(req).await;
    if let Some(remaining) = decision.remaining
        && let Ok(value) = HeaderValue::from_str(&remaining.to_string())
    {
        res.headers_mut()
            .insert(HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER), value);
    }
    res
}

fn too_many_requests(retry_after_secs: u64) -> Response {
    let body = json!({
        "error": "too_many_requests",
        "message": "Too many requests. Please try again later.",
    });
    let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        res.headers_mut().insert(header::RETRY_AFTER, value);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY: [u8; 4] = [10, 0, 0, 2];

    fn request(peer: [u8; 4], headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/bookings");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 5555))));
        req
    }

    fn trusted() -> Vec<IpAddr> {
        vec![IpAddr::from(PROXY)]
    }

    #[test]
    fn trusted_proxy_headers_identify_the_client() {
        let identity = request_identity(
            &request(
                PROXY,
                &[
                    ("x-user-id", "u-42"),
                    ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
                ],
            ),
            &trusted(),
        );
        assert_eq!(identity.user_id.as_deref(), Some("u-42"));
        assert_eq!(identity.ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn blank_headers_fall_back_to_peer_address() {
        let identity = request_identity(&request(PROXY, &[("x-user-id", "  ")]), &trusted());
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.ip.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn untrusted_peers_cannot_pick_their_identity() {
        let identity = request_identity(
            &request(
                [192, 0, 2, 1],
                &[("x-user-id", "u-42"), ("x-forwarded-for", "203.0.113.7")],
            ),
            &trusted(),
        );
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.ip.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn no_peer_address_means_no_identity() {
        let mut req = request(PROXY, &[("x-user-id", "u-42")]);
        req.extensions_mut().remove::<ConnectInfo<SocketAddr>>();
        let identity = request_identity(&req, &trusted());
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.ip, None);
    }
}
