// rc-test-utils: Shared test utilities for the chat backend suite.
//
// Provides a frame-level WebSocket chat client and an in-process stub of
// the auth / private-message HTTP API for integration testing.

pub mod chat_client;
pub mod mock_api;

pub use chat_client::ChatClient;
pub use mock_api::{MockApiServer, SentPrivmsg};

/// Build the session JSON the auth endpoint and KV store hand out.
pub fn session_json(username: &str, user_id: i32, features: &[&str]) -> String {
    serde_json::to_string(&serde_json::json!({
        "username": username,
        "userId": user_id.to_string(),
        "features": features,
    }))
    .expect("session json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_protocol::SessionUser;

    #[test]
    fn session_json_matches_the_protocol_shape() {
        let json = session_json("alice", 42, &["admin", "flair9"]);
        let session: SessionUser = serde_json::from_str(&json).unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.user_id, "42");
        assert_eq!(session.features, vec!["admin", "flair9"]);
    }

    #[tokio::test]
    async fn mock_api_auth_round_trip() {
        let api = MockApiServer::start().await.unwrap();
        api.register_token("alicetoken0001", &session_json("alice", 1, &[]))
            .await;

        let client = reqwest_like_post(
            &format!("{}/auth", api.base_url()),
            &[("authtoken", "alicetoken0001"), ("privatekey", "k")],
        )
        .await;
        assert!(client.contains("alice"));
    }

    // Minimal form POST without pulling an HTTP client into the crate.
    async fn reqwest_like_post(url: &str, fields: &[(&str, &str)]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let url = url.strip_prefix("http://").unwrap();
        let (host, path) = url.split_once('/').unwrap();
        let body: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let body = body.join("&");
        let request = format!(
            "POST /{path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = tokio::net::TcpStream::connect(host).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
