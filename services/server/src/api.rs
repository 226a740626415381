//! Outbound HTTP adapter for the authentication and private-message
//! endpoints.

use rc_protocol::{SessionUser, Userid};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api request failed: {0}")]
    Request(String),
    #[error("api rejected the request with status {0}")]
    Status(u16),
    #[error("api response undecodable: {0}")]
    Decode(String),
    /// Error identifier returned by the endpoint, forwarded to the client.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    private_key: String,
}

impl ApiClient {
    pub fn new(base_url: &str, private_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            private_key: private_key.to_owned(),
        }
    }

    /// Exchange an `authtoken` cookie for the session record.
    pub async fn user_from_auth_token(&self, token: &str) -> Result<SessionUser, ApiError> {
        let response = self
            .http
            .post(format!("{}/auth", self.base_url))
            .form(&[
                ("authtoken", token),
                ("privatekey", self.private_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "auth token rejected");
            return Err(ApiError::Status(response.status().as_u16()));
        }
        response
            .json::<SessionUser>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Deliver a private message through the messages endpoint.
    ///
    /// A non-204 response with an `{"error": …}` body surfaces that
    /// identifier; anything else undecodable comes back as `unknown`.
    pub async fn send_privmsg(
        &self,
        from: Userid,
        target: Userid,
        message: &str,
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/messages/send", self.base_url))
            .form(&[
                ("privatekey", self.private_key.clone()),
                ("userid", from.to_string()),
                ("targetuserid", target.to_string()),
                ("message", message.to_owned()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if response.status().as_u16() == 204 {
            return Ok(());
        }
        match response.json::<ApiErrorBody>().await {
            Ok(body) => Err(ApiError::Rejected(body.error)),
            Err(_) => Err(ApiError::Rejected(
                rc_protocol::errors::UNKNOWN.to_owned(),
            )),
        }
    }
}
