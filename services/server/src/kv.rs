//! KV store adapter: session lookups, the recent-IP cache, the chat-log
//! ring, and the cross-instance pub/sub subscriber.
//!
//! The connection is established lazily and every operation treats a
//! failure as transient: the serving path logs and carries on, and the
//! subscriber sleeps briefly and re-subscribes, reloading moderation
//! state after each (re)connect.

use crate::config::RedisConfig;
use crate::state::AppState;
use crate::user::Features;
use futures_util::StreamExt;
use rc_protocol::{EventDataIn, EventDataOut, SessionUser, Userid};
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Kept IPs per user in the recent-IP cache.
const RECENT_IP_CAP: usize = 3;
/// Lines retained in the chat-log ring.
const CHAT_LOG_CAP: usize = 150;
const CHAT_LOG_KEY: &str = "CHAT:chatlog";
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Append to the ring, then pop from the head until the cap holds.
const CHAT_LOG_SCRIPT: &str = r"
local key, value, maxlength = KEYS[1], ARGV[1], tonumber(ARGV[2])
if not maxlength then
    return redis.error_reply('INVALID ARGUMENTS')
end
redis.call('RPUSH', key, value)
while redis.call('LLEN', key) > maxlength do
    redis.call('LPOP', key)
end
return redis.call('LLEN', key)
";

/// Upsert an IP into the user's recency set: an existing member is
/// promoted to the newest score, otherwise the oldest entry is evicted
/// once the set is at capacity and the IP appended.
const RECENT_IP_SCRIPT: &str = r"
local key, ip, cap, score = KEYS[1], ARGV[1], tonumber(ARGV[2]), tonumber(ARGV[3])
if redis.call('ZSCORE', key, ip) then
    redis.call('ZADD', key, score, ip)
    return 0
end
if redis.call('ZCARD', key) >= cap then
    redis.call('ZREMRANGEBYRANK', key, 0, 0)
end
redis.call('ZADD', key, score, ip)
return 1
";

pub struct Kv {
    pub(crate) client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    db: i64,
    chat_log: Script,
    recent_ip: Script,
}

impl Kv {
    /// Build the handle without touching the network.
    pub fn new(cfg: &RedisConfig) -> Result<Self, RedisError> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.address, cfg.database)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.address, cfg.database)
        };
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
            db: cfg.database,
            chat_log: Script::new(CHAT_LOG_SCRIPT),
            recent_ip: Script::new(RECENT_IP_SCRIPT),
        })
    }

    /// Pub/sub channels are suffixed with the database index so multiple
    /// deployments can share one broker.
    pub fn channel(&self, name: &str) -> String {
        format!("{name}-{}", self.db)
    }

    async fn conn(&self) -> RedisResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    /// Startup probe; the process aborts when this fails.
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await
    }

    /// Resolve a `sid` cookie into its session record.
    pub async fn session(&self, sid: &str) -> Option<SessionUser> {
        let mut conn = self.conn().await.ok()?;
        let value = redis::cmd("GET")
            .arg(format!("CHAT:session-{sid}"))
            .query_async::<Option<String>>(&mut conn)
            .await
            .ok()??;
        match serde_json::from_str(&value) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "unable to decode session record");
                None
            }
        }
    }

    /// Remember `ip` as a recent address of `uid`.
    pub async fn upsert_recent_ip(&self, uid: Userid, ip: &str) {
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "recent-ip upsert skipped, kv unavailable");
                return;
            }
        };
        let result = self
            .recent_ip
            .key(format!("CHAT:userips-{uid}"))
            .arg(ip)
            .arg(RECENT_IP_CAP)
            .arg(crate::unix_milli_time())
            .invoke_async::<i64>(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(uid, error = %e, "unable to upsert recent ip");
        }
    }

    /// The last known IPs of `uid`, oldest first.
    pub async fn recent_ips(&self, uid: Userid) -> Vec<String> {
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(_) => return Vec::new(),
        };
        redis::cmd("ZRANGE")
            .arg(format!("CHAT:userips-{uid}"))
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut conn)
            .await
            .unwrap_or_default()
    }

    /// Append a packed frame to the fixed-length scrollback ring.
    pub async fn append_chat_log(&self, frame: &str) {
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "chat-log append skipped, kv unavailable");
                return;
            }
        };
        let result = self
            .chat_log
            .key(CHAT_LOG_KEY)
            .arg(frame)
            .arg(CHAT_LOG_CAP)
            .invoke_async::<i64>(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "unable to append to chat log ring");
        }
    }
}

// ---------------------------------------------------------------------------
// Pub/sub subscriber
// ---------------------------------------------------------------------------

/// Subscribe to the coordination channels and dispatch until the process
/// exits.  Any failure tears the subscription down, waits briefly and
/// starts over; the ban registry is reloaded after every (re)connect so a
/// missed `refreshbans` cannot leave stale state behind.
pub async fn run_pubsub(state: AppState) {
    let refreshbans = state.kv.channel("refreshbans");
    let refreshuser = state.kv.channel("refreshuser");
    let broadcast = state.kv.channel("broadcast");
    let unbanuserid = state.kv.channel("unbanuserid");

    loop {
        let mut pubsub = match state.kv.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                debug!(error = %e, "pub/sub connect failed, retrying");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
        };
        let mut subscribed = true;
        for channel in [&refreshbans, &refreshuser, &broadcast, &unbanuserid] {
            if let Err(e) = pubsub.subscribe(channel).await {
                warn!(channel = %channel, error = %e, "pub/sub subscribe failed, retrying");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            continue;
        }
        info!("subscribed to coordination channels");
        state.bans.load_active(&state.pool).await;

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_owned();
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "undecodable pub/sub payload");
                    continue;
                }
            };
            if channel == refreshbans {
                debug!("refreshing bans");
                state.bans.load_active(&state.pool).await;
            } else if channel == refreshuser {
                handle_refresh_user(&state, &payload).await;
            } else if channel == broadcast {
                handle_broadcast(&state, &payload).await;
            } else if channel == unbanuserid {
                handle_unban(&state, &payload).await;
            }
        }

        warn!("pub/sub stream closed, resubscribing");
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn handle_refresh_user(state: &AppState, payload: &str) {
    let session: SessionUser = match serde_json::from_str(payload) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "undecodable refreshuser session");
            return;
        }
    };
    let Some(uid) = crate::user::userid_from_session(&session) else {
        return;
    };
    let features = Features::from_names(&session.features);
    let protected = session.features.iter().any(|f| f == "protected");

    state.users.add(&session.username, uid, protected).await;
    state.names.refresh(uid, &session.username, features).await;
    state.hub.refresh_user(uid).await;
    debug!(uid, nick = %session.username, "refreshed user");
}

async fn handle_broadcast(state: &AppState, payload: &str) {
    let data: EventDataIn = match serde_json::from_str(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "undecodable broadcast payload");
            return;
        }
    };
    let out = EventDataOut {
        sender: None,
        targetuserid: 0,
        timestamp: crate::unix_milli_time(),
        data: data.data,
        extradata: String::new(),
    };
    state.broadcast_event(0, "BROADCAST", &out).await;
}

async fn handle_unban(state: &AppState, payload: &str) {
    let Ok(uid) = payload.trim().parse::<Userid>() else {
        warn!(payload, "undecodable unbanuserid payload");
        return;
    };
    state.bans.unban_userid(uid).await;
    state.chat_state.unmute(uid).await;
    debug!(uid, "unbanned userid via pub/sub");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kv() -> Kv {
        Kv::new(&RedisConfig {
            address: "127.0.0.1:1".to_owned(),
            database: 3,
            password: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn channels_carry_the_database_suffix() {
        let kv = test_kv();
        assert_eq!(kv.channel("refreshbans"), "refreshbans-3");
        assert_eq!(kv.channel("broadcast"), "broadcast-3");
    }

    #[tokio::test]
    async fn operations_degrade_when_kv_is_unreachable() {
        let kv = test_kv();
        assert!(kv.session("a1b2c3d4e5f6").await.is_none());
        assert!(kv.recent_ips(1).await.is_empty());
        // Must not hang or panic.
        kv.upsert_recent_ip(1, "10.0.0.1").await;
        kv.append_chat_log("MSG {}").await;
    }
}
