// rc-protocol: Chat wire protocol frame codec and payload types.
//
// Frames are UTF-8 text WebSocket messages of the form `NAME json`, where
// `NAME` is an upper-case event name and the rest of the frame (after a
// single separating space) is the raw JSON payload.  The same codec is
// used in both directions; the two sides differ only in which event names
// they accept.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Failure to split a frame into event name and payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame has no space separator, so no payload can be extracted.
    #[error("frame has no event/payload separator")]
    MissingSeparator,
}

/// Assemble a frame from an event name and an already-encoded JSON payload.
pub fn pack(name: &str, payload: &str) -> String {
    let mut frame = String::with_capacity(name.len() + 1 + payload.len());
    frame.push_str(name);
    frame.push(' ');
    frame.push_str(payload);
    frame
}

/// Split a frame at the first space into `(name, payload)`.
///
/// The payload is returned verbatim; JSON validation is left to the
/// per-event deserialization step.
pub fn unpack(frame: &str) -> Result<(&str, &str), FrameError> {
    frame.split_once(' ').ok_or(FrameError::MissingSeparator)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Account identifier. `0` is the system/anonymous sentinel.
pub type Userid = i32;

/// The serialization projection of a user: nick plus resolved feature names.
///
/// Shared verbatim between `NAMES` entries and the sender block of every
/// broadcast event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifiedUser {
    pub nick: String,
    pub features: Vec<String>,
}

/// The session record fetched from the KV store or the auth endpoint.
///
/// `user_id` is a decimal string in the session JSON, not a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub features: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client -> server payloads
// ---------------------------------------------------------------------------

/// Generic inbound event payload.
///
/// `data` carries the message body for `MSG`/`BROADCAST`, the target nick
/// for `MUTE`/`UNMUTE`/`UNBAN`, and `"on"`/`"off"` for `SUBONLY`.
/// `duration` is in nanoseconds (zero means "use the default").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDataIn {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub extradata: String,
    #[serde(default)]
    pub duration: i64,
}

/// `BAN` payload. `duration` is in nanoseconds; `ispermanent` overrides it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanIn {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub banip: bool,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub ispermanent: bool,
    #[serde(default)]
    pub reason: String,
}

/// `PRIVMSG` payload: target nick plus message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivmsgIn {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub data: String,
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

/// Generic outbound event payload.
///
/// The sender projection is flattened into the object so clients see
/// `{"nick":…,"features":[…],"timestamp":…,"data":…}`; system-originated
/// events (pub/sub broadcasts) omit the sender block entirely.
/// `targetuserid` never crosses the wire; it exists for the event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDataOut {
    #[serde(flatten)]
    pub sender: Option<SimplifiedUser>,
    #[serde(skip)]
    pub targetuserid: Userid,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extradata: String,
}

/// The `NAMES` snapshot: every user with at least one live connection,
/// plus the total socket count (anonymous sockets included).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamesOut {
    pub users: Vec<SimplifiedUser>,
    pub connectioncount: u32,
}

/// Payload of server-initiated `PING` frames: a millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingOut {
    #[serde(rename = "data")]
    pub timestamp: i64,
}

/// The `muted` error payload.  The only `ERR` payload that is an object
/// rather than a bare identifier string: it carries the remaining mute
/// duration so clients can display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutedOut {
    pub description: String,
    #[serde(rename = "muteTimeLeft")]
    pub mute_time_left: i64,
}

impl MutedOut {
    pub fn new(time_left_secs: i64) -> Self {
        Self {
            description: errors::MUTED.to_owned(),
            mute_time_left: time_left_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Client-visible error identifiers
// ---------------------------------------------------------------------------

/// Identifiers carried as the JSON-string payload of `ERR` frames.
///
/// The private-message endpoint may additionally surface arbitrary strings,
/// forwarded to the sender verbatim.
pub mod errors {
    pub const PROTOCOL_ERROR: &str = "protocolerror";
    pub const NEED_LOGIN: &str = "needlogin";
    pub const NO_PERMISSION: &str = "nopermission";
    pub const NOT_FOUND: &str = "notfound";
    pub const INVALID_MSG: &str = "invalidmsg";
    pub const MUTED: &str = "muted";
    pub const SUBMODE: &str = "submode";
    pub const THROTTLED: &str = "throttled";
    pub const DUPLICATE: &str = "duplicate";
    pub const TOO_MANY_CONNECTIONS: &str = "toomanyconnections";
    pub const NEED_BAN_REASON: &str = "needbanreason";
    pub const BANNED: &str = "banned";
    pub const UNKNOWN: &str = "unknown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_round_trips() {
        let payload = r#"{"data":"hello world"}"#;
        let frame = pack("MSG", payload);
        assert_eq!(frame, format!("MSG {payload}"));
        let (name, data) = unpack(&frame).unwrap();
        assert_eq!(name, "MSG");
        assert_eq!(data, payload);
    }

    #[test]
    fn unpack_splits_only_at_the_first_space() {
        let (name, data) = unpack("ERR \"too many spaces here\"").unwrap();
        assert_eq!(name, "ERR");
        assert_eq!(data, "\"too many spaces here\"");
    }

    #[test]
    fn unpack_without_separator_is_a_frame_error() {
        assert_eq!(unpack("PING"), Err(FrameError::MissingSeparator));
        assert_eq!(unpack(""), Err(FrameError::MissingSeparator));
    }

    #[test]
    fn unpack_allows_empty_payload_after_separator() {
        let (name, data) = unpack("PING ").unwrap();
        assert_eq!(name, "PING");
        assert_eq!(data, "");
    }

    #[test]
    fn event_data_out_omits_empty_fields() {
        let out = EventDataOut {
            sender: Some(SimplifiedUser {
                nick: "alice".to_owned(),
                features: vec!["moderator".to_owned()],
            }),
            targetuserid: 7,
            timestamp: 1_700_000_000_000,
            data: String::new(),
            extradata: String::new(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["nick"], "alice");
        assert_eq!(json["features"][0], "moderator");
        assert!(json.get("data").is_none());
        assert!(json.get("extradata").is_none());
        assert!(json.get("targetuserid").is_none());
    }

    #[test]
    fn event_data_out_without_sender_has_no_user_block() {
        let out = EventDataOut {
            sender: None,
            targetuserid: 0,
            timestamp: 1,
            data: "system notice".to_owned(),
            extradata: String::new(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("nick").is_none());
        assert_eq!(json["data"], "system notice");
    }

    #[test]
    fn session_user_decodes_the_auth_json_shape() {
        let su: SessionUser = serde_json::from_str(
            r#"{"username":"alice","userId":"123","features":["admin","flair9"]}"#,
        )
        .unwrap();
        assert_eq!(su.username, "alice");
        assert_eq!(su.user_id, "123");
        assert_eq!(su.features, vec!["admin", "flair9"]);
    }

    #[test]
    fn muted_payload_serializes_time_left() {
        let json = serde_json::to_value(MutedOut::new(42)).unwrap();
        assert_eq!(json["description"], "muted");
        assert_eq!(json["muteTimeLeft"], 42);
    }
}
