//! Connection sessions: a reader task and a writer task per socket.
//!
//! The reader owns the socket for reads, parses frames and runs the
//! command handlers inline; the writer owns the socket for writes and
//! selects over the outbound queues and signals.  Either side breaking
//! flips the shared stop flag, so both always terminate together.
//!
//! Liveness: the hub pings every connection on a 10 s ticker and every
//! inbound frame (pongs included) rearms the read deadline by 30 s, so a
//! silent peer is dropped within two missed pongs.  The first frame gets
//! a more generous 60 s.

use crate::bans;
use crate::hub::{ConnectionHandle, SEND_CHANNEL_SIZE};
use crate::mutes;
use crate::state::AppState;
use crate::user::{FloodVerdict, User};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rc_protocol::{BanIn, EventDataIn, EventDataOut, MutedOut, PingOut, PrivmsgIn, Userid, errors};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

pub const MAX_MESSAGE_SIZE: usize = 6144;
pub const MAX_MESSAGE_LEN: usize = 512;
pub const MAX_CONNECTIONS_PER_USER: i32 = 5;
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// Five or more combining marks in a row is almost certainly a zalgo
// pattern; line/paragraph separators and non-breaking spaces are never
// legitimate in chat either.
static INVALID_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\p{M}{5,}|[\p{Zl}\p{Zp}\x{202f}\x{00a0}]").expect("invalid message regex")
});

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound messages encoded by the writer task.
#[derive(Debug)]
enum OutMessage {
    /// A regular event with a fully-assembled payload.
    Event {
        event: &'static str,
        data: EventDataOut,
    },
    /// The shared presence snapshot.
    Names(Arc<String>),
    Err(&'static str),
    /// Arbitrary error identifier forwarded from the message endpoint.
    ErrString(String),
    /// The `muted` error with remaining seconds.
    ErrMuted(i64),
    PrivmsgSent,
    /// Liveness ping with a millisecond timestamp.
    Ping(i64),
    /// Echo of a protocol-level `PING` payload.
    Pong(String),
    /// WebSocket pong answering a client ping control frame.
    WsPong(Bytes),
}

fn encode(message: &OutMessage) -> Option<Message> {
    let frame = match message {
        OutMessage::Event { event, data } => {
            rc_protocol::pack(event, &serde_json::to_string(data).ok()?)
        }
        OutMessage::Names(snapshot) => rc_protocol::pack("NAMES", snapshot),
        OutMessage::Err(identifier) => {
            rc_protocol::pack("ERR", &serde_json::to_string(identifier).ok()?)
        }
        OutMessage::ErrString(identifier) => {
            rc_protocol::pack("ERR", &serde_json::to_string(identifier).ok()?)
        }
        OutMessage::ErrMuted(seconds) => rc_protocol::pack(
            "ERR",
            &serde_json::to_string(&MutedOut::new(*seconds)).ok()?,
        ),
        OutMessage::PrivmsgSent => rc_protocol::pack("PRIVMSGSENT", "{}"),
        OutMessage::Ping(timestamp) => rc_protocol::pack(
            "PING",
            &serde_json::to_string(&PingOut { timestamp: *timestamp }).ok()?,
        ),
        OutMessage::Pong(payload) => {
            rc_protocol::pack("PONG", if payload.is_empty() { "{}" } else { payload })
        }
        OutMessage::WsPong(data) => return Some(Message::Pong(data.clone())),
    };
    Some(Message::Text(frame.into()))
}

/// Run a session to completion.  Invoked as the upgrade callback; the
/// future itself is the reader task.
pub async fn run(socket: WebSocket, state: AppState, candidate: Option<Arc<User>>, ip: String) {
    let (mut sink, stream) = socket.split();

    // Presence first: the connection cap is enforced on the new count.
    let (user, connection_count) = match candidate {
        Some(candidate) => {
            let (user, count) = state.names.add(candidate).await;
            if count > MAX_CONNECTIONS_PER_USER {
                debug!(uid = user.id, count, "connection cap exceeded");
                if let Some(msg) = encode(&OutMessage::Err(errors::TOO_MANY_CONNECTIONS)) {
                    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await;
                }
                let _ = sink.close().await;
                state.names.disconnect(user.id).await;
                return;
            }
            (Some(user), count)
        }
        None => {
            state.names.add_anonymous().await;
            (None, 0)
        }
    };

    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (send_tx, send_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
    let (blocking_tx, blocking_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
    let (preencoded_tx, preencoded_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
    let (banned_tx, banned_rx) = mpsc::channel(1);
    let (refresh_tx, refresh_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (ping_tx, ping_rx) = mpsc::channel(2);
    let stop = Arc::new(stop_tx);

    tokio::spawn(write_pump(
        sink,
        user.clone(),
        Arc::clone(&stop),
        stop.subscribe(),
        ping_rx,
        banned_rx,
        refresh_rx,
        blocking_rx,
        send_rx,
        preencoded_rx,
    ));

    state
        .hub
        .register(ConnectionHandle {
            id,
            user: user.clone(),
            ip,
            preencoded: preencoded_tx,
            banned: banned_tx,
            refresh: refresh_tx,
            ping: ping_tx,
        })
        .await;

    let session = Session {
        state: state.clone(),
        user: user.clone(),
        send: send_tx,
        blocking: blocking_tx,
    };

    // Presence snapshot to the new client, then a JOIN to everyone when
    // this is the user's first connection.
    let snapshot = state.names.snapshot().await;
    let _ = session.send.send(OutMessage::Names(snapshot)).await;
    if let Some(user) = &user {
        if connection_count == 1 {
            session.broadcast("JOIN", user.event_data_out().await).await;
        }
    }

    session.read_pump(stream, stop_rx).await;

    // Teardown: stop the writer, leave the hub, drop presence.
    stop.send_replace(true);
    state.hub.unregister(id).await;
    match &user {
        Some(user) => {
            let remaining = state.names.disconnect(user.id).await;
            if remaining == 0 {
                session.broadcast("QUIT", user.event_data_out().await).await;
            }
        }
        None => state.names.remove_anonymous().await,
    }
    trace!(id, "session ended");
}

struct Session {
    state: AppState,
    user: Option<Arc<User>>,
    send: mpsc::Sender<OutMessage>,
    blocking: mpsc::Sender<OutMessage>,
}

impl Session {
    async fn read_pump(&self, mut stream: SplitStream<WebSocket>, mut stop_rx: watch::Receiver<bool>) {
        let mut deadline = Instant::now() + READ_TIMEOUT;
        loop {
            let message = tokio::select! {
                _ = stop_rx.changed() => break,
                next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                    Err(_) => {
                        debug!("read deadline expired");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(message))) => message,
                },
            };
            // Any inbound frame proves the peer alive.
            deadline = Instant::now() + PONG_TIMEOUT;

            match message {
                Message::Text(text) => match rc_protocol::unpack(&text) {
                    Ok((name, payload)) => self.dispatch(name, payload).await,
                    Err(_) => self.send_error(errors::PROTOCOL_ERROR).await,
                },
                // Binary frames are a protocol violation.
                Message::Binary(_) => break,
                Message::Ping(data) => {
                    let _ = self.blocking.send(OutMessage::WsPong(data)).await;
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
            }
        }
    }

    async fn dispatch(&self, name: &str, payload: &str) {
        match name {
            "MSG" => self.on_msg(payload).await,
            "PRIVMSG" => self.on_privmsg(payload).await,
            "MUTE" => self.on_mute(payload).await,
            "UNMUTE" => self.on_unmute(payload).await,
            "BAN" => self.on_ban(payload).await,
            "UNBAN" => self.on_unban(payload).await,
            "SUBONLY" => self.on_subonly(payload).await,
            "BROADCAST" => self.on_broadcast(payload).await,
            "PING" => self.on_ping(payload).await,
            "PONG" => {}
            _ => trace!(name, "ignoring unknown event"),
        }
    }

    async fn send_error(&self, identifier: &'static str) {
        let _ = self.blocking.send(OutMessage::Err(identifier)).await;
    }

    /// Encode once, fan out through the hub, and log.
    async fn broadcast(&self, event: &'static str, data: EventDataOut) {
        let userid = self.user.as_ref().map_or(0, |u| u.id);
        self.state.broadcast_event(userid, event, &data).await;
    }

    /// Resolve a moderation target: a known, non-self, non-protected nick.
    async fn can_moderate_user(&self, nick: &str) -> Option<Userid> {
        let nick = nick.trim();
        if nick.is_empty() {
            return None;
        }
        let me = self.user.as_ref()?;
        let (uid, protected) = self.state.users.get(nick).await?;
        if uid == 0 || uid == me.id || protected {
            return None;
        }
        Some(uid)
    }

    async fn on_msg(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NEED_LOGIN).await;
        };
        let msg = data.data.trim();
        if !valid_message(msg) {
            return self.send_error(errors::INVALID_MSG).await;
        }
        if mutes::is_user_muted(&self.state.chat_state, Some(user)).await {
            let left = mutes::mute_time_left_secs(&self.state.chat_state, user.id).await;
            let _ = self.blocking.send(OutMessage::ErrMuted(left)).await;
            return;
        }
        if !self.state.can_user_speak(user).await {
            return self.send_error(errors::SUBMODE).await;
        }
        if !user.is_bot().await {
            let settings = &self.state.settings;
            match user
                .flood_check(msg, settings.delay, settings.max_throttle)
                .await
            {
                FloodVerdict::Throttled => return self.send_error(errors::THROTTLED).await,
                FloodVerdict::Duplicate => return self.send_error(errors::DUPLICATE).await,
                FloodVerdict::Accept => {}
            }
        }

        let mut out = user.event_data_out().await;
        out.data = msg.to_owned();
        self.broadcast("MSG", out).await;
    }

    async fn on_broadcast(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NEED_LOGIN).await;
        };
        if !user.is_admin().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let msg = data.data.trim();
        if !valid_message(msg) {
            return self.send_error(errors::INVALID_MSG).await;
        }

        let mut out = user.event_data_out().await;
        out.data = msg.to_owned();
        self.broadcast("BROADCAST", out).await;
    }

    async fn on_privmsg(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<PrivmsgIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NEED_LOGIN).await;
        };
        let msg = data.data.trim();
        if !valid_message(msg) {
            return self.send_error(errors::INVALID_MSG).await;
        }
        let Some((target, _)) = self.state.users.get(data.nick.trim()).await else {
            return self.send_error(errors::NOT_FOUND).await;
        };
        if target == user.id {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        }

        match self.state.api.send_privmsg(user.id, target, msg).await {
            Ok(()) => {
                let _ = self.blocking.send(OutMessage::PrivmsgSent).await;
            }
            Err(crate::api::ApiError::Rejected(identifier)) => {
                let _ = self.blocking.send(OutMessage::ErrString(identifier)).await;
            }
            Err(e) => {
                debug!(error = %e, "privmsg delivery failed");
                self.send_error(errors::UNKNOWN).await;
            }
        }
    }

    async fn on_mute(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if !user.is_moderator().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let Some(target) = self.can_moderate_user(&data.data).await else {
            return self.send_error(errors::NO_PERMISSION).await;
        };

        let duration = if data.duration > 0 {
            Duration::from_nanos(data.duration.unsigned_abs())
        } else {
            mutes::DEFAULT_MUTE_DURATION
        };
        if duration > mutes::MAX_MUTE_DURATION {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        }

        mutes::mute_userid(&self.state.chat_state, target, duration).await;
        let mut out = user.event_data_out().await;
        out.data = data.data.trim().to_owned();
        out.targetuserid = target;
        self.broadcast("MUTE", out).await;
    }

    async fn on_unmute(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let nick = data.data.trim();
        if nick.is_empty() {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        }
        let Some(user) = &self.user else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if !user.is_moderator().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let Some((target, _)) = self.state.users.get(nick).await else {
            return self.send_error(errors::NO_PERMISSION).await;
        };

        mutes::unmute_userid(&self.state.chat_state, target).await;
        let mut out = user.event_data_out().await;
        out.data = nick.to_owned();
        out.targetuserid = target;
        self.broadcast("UNMUTE", out).await;
    }

    async fn on_ban(&self, payload: &str) {
        let Ok(ban) = serde_json::from_str::<BanIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if !user.is_moderator().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let Some(target) = self.can_moderate_user(&ban.nick).await else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if ban.reason.trim().is_empty() {
            return self.send_error(errors::NEED_BAN_REASON).await;
        }

        bans::ban_user(
            &self.state.bans,
            &self.state.hub,
            &self.state.kv,
            &self.state.eventlog,
            user.id,
            target,
            &ban,
        )
        .await;

        let mut out = user.event_data_out().await;
        out.data = ban.nick.trim().to_owned();
        out.targetuserid = target;
        self.broadcast("BAN", out).await;
    }

    async fn on_unban(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if !user.is_moderator().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let nick = data.data.trim();
        let Some((target, _)) = self.state.users.get(nick).await else {
            return self.send_error(errors::NO_PERMISSION).await;
        };

        // Lifting a ban also lifts any mute.
        self.state.bans.unban_userid(target).await;
        self.state.chat_state.unmute(target).await;
        self.state.eventlog.log_unban(target);

        let mut out = user.event_data_out().await;
        out.data = nick.to_owned();
        out.targetuserid = target;
        self.broadcast("UNBAN", out).await;
    }

    async fn on_subonly(&self, payload: &str) {
        let Ok(data) = serde_json::from_str::<EventDataIn>(payload) else {
            return self.send_error(errors::PROTOCOL_ERROR).await;
        };
        let Some(user) = &self.user else {
            return self.send_error(errors::NO_PERMISSION).await;
        };
        if !user.is_moderator().await {
            return self.send_error(errors::NO_PERMISSION).await;
        }
        let enabled = match data.data.as_str() {
            "on" => true,
            "off" => false,
            _ => return self.send_error(errors::PROTOCOL_ERROR).await,
        };

        self.state.chat_state.set_submode(enabled).await;
        let mut out = user.event_data_out().await;
        out.data = data.data;
        self.broadcast("SUBONLY", out).await;
    }

    async fn on_ping(&self, payload: &str) {
        let _ = self
            .blocking
            .send(OutMessage::Pong(payload.to_owned()))
            .await;
    }
}

/// Trimmed message bodies must be 1..=512 characters and free of zalgo
/// stacks and exotic separators.
fn valid_message(msg: &str) -> bool {
    let len = msg.chars().count();
    len >= 1 && len <= MAX_MESSAGE_LEN && !INVALID_MESSAGE.is_match(msg)
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    user: Option<Arc<User>>,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    mut ping_rx: mpsc::Receiver<i64>,
    mut banned_rx: mpsc::Receiver<()>,
    mut refresh_rx: mpsc::Receiver<()>,
    mut blocking_rx: mpsc::Receiver<OutMessage>,
    mut send_rx: mpsc::Receiver<OutMessage>,
    mut preencoded_rx: mpsc::Receiver<Arc<String>>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            Some(()) = banned_rx.recv() => {
                if let Some(msg) = encode(&OutMessage::Err(rc_protocol::errors::BANNED)) {
                    let _ = write(&mut sink, msg).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(()) = refresh_rx.recv() => {
                // Tell the client to reconnect with fresh session data.
                if let Some(user) = &user {
                    let data = user.event_data_out().await;
                    if let Some(msg) = encode(&OutMessage::Event { event: "REFRESH", data }) {
                        let _ = write(&mut sink, msg).await;
                    }
                }
                break;
            }
            Some(timestamp) = ping_rx.recv() => {
                if deliver(&mut sink, &OutMessage::Ping(timestamp)).await.is_err() {
                    break;
                }
            }
            Some(message) = blocking_rx.recv() => {
                if deliver(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            Some(message) = send_rx.recv() => {
                if deliver(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            Some(frame) = preencoded_rx.recv() => {
                if write(&mut sink, Message::Text(frame.as_str().into())).await.is_err() {
                    break;
                }
            }
            else => break,
        }
    }
    stop.send_replace(true);
    let _ = sink.close().await;
}

async fn deliver(sink: &mut SplitSink<WebSocket, Message>, message: &OutMessage) -> Result<(), ()> {
    match encode(message) {
        Some(msg) => write(sink, msg).await,
        None => Ok(()),
    }
}

/// Write one frame under the write deadline.
async fn write(sink: &mut SplitSink<WebSocket, Message>, msg: Message) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "write error");
            Err(())
        }
        Err(_) => {
            debug!("write deadline expired");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_length_bounds_are_inclusive() {
        assert!(!valid_message(""));
        assert!(valid_message("a"));
        assert!(valid_message(&"x".repeat(512)));
        assert!(!valid_message(&"x".repeat(513)));
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 512 three-byte characters are still 512 characters.
        assert!(valid_message(&"\u{20ac}".repeat(512)));
        assert!(!valid_message(&"\u{20ac}".repeat(513)));
    }

    #[test]
    fn zalgo_stacks_are_rejected() {
        let four = format!("a{}", "\u{0301}".repeat(4));
        let five = format!("a{}", "\u{0301}".repeat(5));
        assert!(valid_message(&four));
        assert!(!valid_message(&five));
    }

    #[test]
    fn exotic_separators_are_rejected() {
        assert!(!valid_message("sneaky\u{00a0}space"));
        assert!(!valid_message("narrow\u{202f}space"));
        assert!(!valid_message("line\u{2028}separator"));
        assert!(!valid_message("para\u{2029}separator"));
        assert!(valid_message("plain old text"));
    }

    #[test]
    fn error_frames_carry_bare_identifiers() {
        let msg = encode(&OutMessage::Err(errors::THROTTLED)).unwrap();
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), "ERR \"throttled\""),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn muted_error_frames_carry_the_time_left() {
        let msg = encode(&OutMessage::ErrMuted(90)).unwrap();
        match msg {
            Message::Text(text) => {
                let (name, payload) = rc_protocol::unpack(text.as_str()).unwrap();
                assert_eq!(name, "ERR");
                let muted: MutedOut = serde_json::from_str(payload).unwrap();
                assert_eq!(muted.mute_time_left, 90);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn liveness_pings_carry_the_timestamp() {
        let msg = encode(&OutMessage::Ping(1234)).unwrap();
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), "PING {\"data\":1234}"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn ping_echo_defaults_to_an_empty_object() {
        let msg = encode(&OutMessage::Pong(String::new())).unwrap();
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), "PONG {}"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}
