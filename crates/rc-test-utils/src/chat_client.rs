use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Raw WebSocket message type, re-exported for protocol-violation tests.
pub use tokio_tungstenite::tungstenite::protocol::Message as RawMessage;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame-level chat client: speaks `NAME json` text frames and answers
/// WebSocket pings so the server's liveness checks stay green.
pub struct ChatClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl ChatClient {
    /// Connect anonymously.
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect with cookies (e.g. `[("authtoken", "…")]`).
    pub async fn connect_with_cookies(
        url: &str,
        cookies: &[(&str, &str)],
    ) -> Result<Self, Box<dyn std::error::Error>> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let host_header = match uri.port_u16() {
            Some(p) => format!("{}:{}", host, p),
            None => host,
        };
        let cookie_header: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let request = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("Cookie", cookie_header.join("; "))
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send one `NAME json` frame.
    pub async fn send_frame(
        &mut self,
        name: &str,
        payload: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let frame = rc_protocol::pack(name, payload);
        self.write.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    /// Send a raw WebSocket message (for protocol-violation tests).
    pub async fn send_raw(&mut self, msg: Message) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(msg).await?;
        Ok(())
    }

    /// Receive the next text frame as `(name, payload)`.
    ///
    /// Pings are answered, pongs skipped.  Errors on close or timeout.
    pub async fn recv_frame(&mut self) -> Result<(String, String), Box<dyn std::error::Error>> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for a frame")?;
            match next {
                Some(Ok(Message::Text(text))) => {
                    let (name, payload) = rc_protocol::unpack(&text)?;
                    return Ok((name.to_owned(), payload.to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive frames until one named `name` arrives; returns its payload.
    pub async fn expect_event(&mut self, name: &str) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            let (event, payload) = self.recv_frame().await?;
            if event == name {
                return Ok(payload);
            }
        }
    }

    /// Receive frames until an `ERR` arrives; returns its decoded payload
    /// (the identifier string, or the raw JSON for object payloads).
    pub async fn expect_error(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        let payload = self.expect_event("ERR").await?;
        match serde_json::from_str::<String>(&payload) {
            Ok(identifier) => Ok(identifier),
            Err(_) => Ok(payload),
        }
    }

    /// True when the server closes (or drops) the connection without
    /// sending further text frames.
    pub async fn expect_close(&mut self) -> bool {
        loop {
            let next = match tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await {
                Ok(next) => next,
                Err(_) => return false,
            };
            match next {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.write.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
