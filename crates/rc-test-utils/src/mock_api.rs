use axum::extract::{Form, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One private message delivered to the stub messages endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPrivmsg {
    pub userid: String,
    pub targetuserid: String,
    pub message: String,
}

#[derive(Default)]
struct Inner {
    /// authtoken -> session JSON handed back by `/auth`.
    tokens: HashMap<String, String>,
    sent: Vec<SentPrivmsg>,
    /// When set, `/messages/send` answers 400 with this error identifier.
    privmsg_error: Option<String>,
}

/// In-process stub of the external auth and private-message endpoints.
pub struct MockApiServer {
    addr: SocketAddr,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Deserialize)]
struct AuthForm {
    authtoken: String,
    #[allow(dead_code)]
    privatekey: String,
}

#[derive(Deserialize)]
struct PrivmsgForm {
    #[allow(dead_code)]
    privatekey: String,
    userid: String,
    targetuserid: String,
    message: String,
}

impl MockApiServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let router = Router::new()
            .route("/auth", post(auth_handler))
            .route("/messages/send", post(privmsg_handler))
            .with_state(Arc::clone(&inner));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { addr, inner })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Make `/auth` answer `token` with `session_json`.
    pub async fn register_token(&self, token: &str, session_json: &str) {
        self.inner
            .lock()
            .await
            .tokens
            .insert(token.to_owned(), session_json.to_owned());
    }

    /// Force `/messages/send` to reject with `error`, or clear with `None`.
    pub async fn set_privmsg_error(&self, error: Option<&str>) {
        self.inner.lock().await.privmsg_error = error.map(ToOwned::to_owned);
    }

    pub async fn sent_privmsgs(&self) -> Vec<SentPrivmsg> {
        self.inner.lock().await.sent.clone()
    }
}

async fn auth_handler(
    State(inner): State<Arc<Mutex<Inner>>>,
    Form(form): Form<AuthForm>,
) -> Response {
    match inner.lock().await.tokens.get(&form.authtoken) {
        Some(session) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            session.clone(),
        )
            .into_response(),
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn privmsg_handler(
    State(inner): State<Arc<Mutex<Inner>>>,
    Form(form): Form<PrivmsgForm>,
) -> Response {
    let mut inner = inner.lock().await;
    if let Some(error) = &inner.privmsg_error {
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json")],
            format!("{{\"error\":{}}}", serde_json::to_string(error).unwrap_or_default()),
        )
            .into_response();
    }
    inner.sent.push(SentPrivmsg {
        userid: form.userid,
        targetuserid: form.targetuserid,
        message: form.message,
    });
    StatusCode::NO_CONTENT.into_response()
}
