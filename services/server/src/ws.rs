//! WebSocket ingress: identity resolution and the upgrade into a session.
//!
//! Identity comes from a `sid` cookie (session record in the KV store) or
//! an `authtoken` cookie (exchanged at the auth endpoint).  Sockets with
//! neither become anonymous sessions.  Banned callers are rejected with a
//! 403 before the upgrade.

use crate::connection::{self, MAX_MESSAGE_SIZE};
use crate::state::AppState;
use crate::user::{User, userid_from_session};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use rc_protocol::SessionUser;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Shape of both the `sid` and `authtoken` cookie values.
static COOKIE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9]{10,64}$").expect("cookie regex"));

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = client_ip(&headers, peer);
    let session = resolve_session(&state, &jar).await;
    let userid = session.as_ref().and_then(userid_from_session);

    if state
        .bans
        .is_userid_ip_banned(&ip, userid.unwrap_or(0))
        .await
    {
        debug!(ip = %ip, "rejecting banned caller");
        return (StatusCode::FORBIDDEN, "Authorization failed").into_response();
    }

    let candidate = match (session, userid) {
        (Some(session), Some(uid)) => {
            let protected = session.features.iter().any(|f| f == "protected");
            state.users.add(&session.username, uid, protected).await;
            state.kv.upsert_recent_ip(uid, &ip).await;
            Some(Arc::new(User::from_session(uid, &session)))
        }
        _ => None,
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| connection::run(socket, state, candidate, ip))
}

/// The session record for this request, when one can be resolved.
async fn resolve_session(state: &AppState, jar: &CookieJar) -> Option<SessionUser> {
    if let Some(sid) = cookie_value(jar, "sid") {
        if let Some(session) = state.kv.session(sid).await {
            return Some(session);
        }
    }
    if let Some(token) = cookie_value(jar, "authtoken") {
        match state.api.user_from_auth_token(token).await {
            Ok(session) => return Some(session),
            Err(e) => debug!(error = %e, "auth token lookup failed"),
        }
    }
    None
}

fn cookie_value<'a>(jar: &'a CookieJar, name: &str) -> Option<&'a str> {
    let value = jar.get(name)?.value();
    COOKIE_SHAPE.is_match(value).then_some(value)
}

/// The client address: a valid `X-Real-Ip` header wins over the peer
/// address, so deployments behind a reverse proxy see real callers.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .map_or_else(|| peer.ip().to_string(), |ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_shape_accepts_lowercase_hex_tokens_only() {
        assert!(COOKIE_SHAPE.is_match("a1b2c3d4e5"));
        assert!(COOKIE_SHAPE.is_match(&"a".repeat(64)));
        assert!(!COOKIE_SHAPE.is_match("short"));
        assert!(!COOKIE_SHAPE.is_match(&"a".repeat(65)));
        assert!(!COOKIE_SHAPE.is_match("UPPERCASE123"));
        assert!(!COOKIE_SHAPE.is_match("spaces not ok"));
    }

    #[test]
    fn real_ip_header_overrides_the_peer_address() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "1.2.3.4".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, peer), "10.0.0.1");

        let mut garbage = HeaderMap::new();
        garbage.insert("x-real-ip", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&garbage, peer), "10.0.0.1");
    }
}
