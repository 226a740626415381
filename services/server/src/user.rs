//! Users: identity, the packed feature bitset, flood-control state, and
//! the nick -> userid lookup actor.
//!
//! A `User` is shared by reference between the hub, the names cache and
//! every connection belonging to it.  Nick, features and the serialized
//! projection sit behind one RW lock; the live-connection count is an
//! atomic read without the lock; anti-flood state has its own small mutex
//! because up to five reader tasks of the same account may race on it.

use md5::{Digest, Md5};
use rc_protocol::{EventDataOut, SessionUser, SimplifiedUser, Userid};
use std::collections::HashMap;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Feature bitset
// ---------------------------------------------------------------------------

pub const ISADMIN: u32 = 1 << 0;
pub const ISMODERATOR: u32 = 1 << 1;
pub const ISVIP: u32 = 1 << 2;
pub const ISPROTECTED: u32 = 1 << 3;
pub const ISSUBSCRIBER: u32 = 1 << 4;
pub const ISBOT: u32 = 1 << 5;

/// Offset of the first cosmetic flair bit; `flairN` maps to bit `FLAIR_BASE + N`.
const FLAIR_BASE: u32 = 6;

/// Packed 32-bit capability set: six named features plus cosmetic flairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u32);

impl Features {
    /// True when any bit of `mask` is set.
    pub fn get(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    pub fn set(&mut self, mask: u32) {
        self.0 |= mask;
    }

    /// Build the bitset from the feature names of a session record.
    /// Unknown names are accepted only in the `flairN` form.
    pub fn from_names(names: &[String]) -> Self {
        let mut f = Features(0);
        for name in names {
            match name.as_str() {
                "admin" => f.set(ISADMIN),
                "moderator" => f.set(ISMODERATOR),
                "vip" => f.set(ISVIP),
                "protected" => f.set(ISPROTECTED),
                "subscriber" => f.set(ISSUBSCRIBER),
                "bot" => f.set(ISBOT),
                other => {
                    let Some(n) = other.strip_prefix("flair").and_then(|s| s.parse::<u32>().ok())
                    else {
                        debug!(feature = other, "could not parse unknown feature");
                        continue;
                    };
                    if FLAIR_BASE + n < 32 {
                        f.set(1 << (FLAIR_BASE + n));
                    }
                }
            }
        }
        f
    }
}

// Feature-name lists are memoized per bitset value: the same handful of
// feature combinations repeats across thousands of users.
static FEATURE_NAMES: LazyLock<std::sync::RwLock<HashMap<u32, Arc<Vec<String>>>>> =
    LazyLock::new(|| std::sync::RwLock::new(HashMap::new()));

/// Resolve a bitset back into its serialized feature-name list.
pub fn feature_names(features: Features) -> Arc<Vec<String>> {
    if let Some(names) = FEATURE_NAMES.read().unwrap().get(&features.0) {
        return Arc::clone(names);
    }

    let mut names = Vec::new();
    if features.get(ISPROTECTED) {
        names.push("protected".to_owned());
    }
    if features.get(ISSUBSCRIBER) {
        names.push("subscriber".to_owned());
    }
    if features.get(ISVIP) {
        names.push("vip".to_owned());
    }
    if features.get(ISMODERATOR) {
        names.push("moderator".to_owned());
    }
    if features.get(ISADMIN) {
        names.push("admin".to_owned());
    }
    if features.get(ISBOT) {
        names.push("bot".to_owned());
    }
    for bit in FLAIR_BASE..32 {
        if features.get(1 << bit) {
            names.push(format!("flair{}", bit - FLAIR_BASE));
        }
    }

    let names = Arc::new(names);
    FEATURE_NAMES
        .write()
        .unwrap()
        .insert(features.0, Arc::clone(&names));
    names
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Nick, features and the pre-assembled projection, guarded together so a
/// refresh can never tear the serialized fields.
#[derive(Debug)]
pub struct UserShared {
    pub nick: String,
    pub features: Features,
    pub simplified: SimplifiedUser,
}

/// Per-sender flood-control state, written only by reader tasks.
#[derive(Debug)]
pub struct FloodState {
    /// MD5 of the previous message body (after stripping a leading `/me `).
    pub lastmessage: Option<[u8; 16]>,
    pub lastmessagetime: Option<Instant>,
    /// Multiplier applied to the base inter-message delay; >= 1.
    pub delayscale: u32,
}

impl Default for FloodState {
    fn default() -> Self {
        Self {
            lastmessage: None,
            lastmessagetime: None,
            delayscale: 1,
        }
    }
}

/// Outcome of the per-message flood check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Accept,
    Throttled,
    Duplicate,
}

#[derive(Debug)]
pub struct User {
    pub id: Userid,
    shared: RwLock<UserShared>,
    /// Live connection count; kept by the names cache actor.
    pub connections: AtomicI32,
    flood: Mutex<FloodState>,
}

impl User {
    pub fn new(id: Userid, nick: &str, features: Features) -> Self {
        let simplified = SimplifiedUser {
            nick: nick.to_owned(),
            features: feature_names(features).as_ref().clone(),
        };
        Self {
            id,
            shared: RwLock::new(UserShared {
                nick: nick.to_owned(),
                features,
                simplified,
            }),
            connections: AtomicI32::new(0),
            flood: Mutex::new(FloodState::default()),
        }
    }

    pub fn from_session(id: Userid, session: &SessionUser) -> Self {
        Self::new(id, &session.username, Features::from_names(&session.features))
    }

    /// Snapshot of the serialized projection, taken under the read lock.
    pub async fn simplified(&self) -> SimplifiedUser {
        self.shared.read().await.simplified.clone()
    }

    /// Replace nick and features; reassembles the projection in the same
    /// write-lock scope.
    pub async fn refresh(&self, nick: &str, features: Features) {
        let mut shared = self.shared.write().await;
        shared.nick = nick.to_owned();
        shared.features = features;
        shared.simplified = SimplifiedUser {
            nick: nick.to_owned(),
            features: feature_names(features).as_ref().clone(),
        };
    }

    /// Moderation commands: moderators, admins and bots.
    pub async fn is_moderator(&self) -> bool {
        self.shared
            .read()
            .await
            .features
            .get(ISMODERATOR | ISADMIN | ISBOT)
    }

    /// Speaking while sub-only mode is on: subscribers and privileged tiers.
    /// Bots are deliberately not included.
    pub async fn is_subscriber(&self) -> bool {
        self.shared
            .read()
            .await
            .features
            .get(ISSUBSCRIBER | ISADMIN | ISMODERATOR | ISVIP)
    }

    /// Bots are exempt from flood control.
    pub async fn is_bot(&self) -> bool {
        self.shared.read().await.features.get(ISBOT)
    }

    pub async fn is_admin(&self) -> bool {
        self.shared.read().await.features.get(ISADMIN)
    }

    /// Sender block for an outbound event, stamped with the current time.
    pub async fn event_data_out(&self) -> EventDataOut {
        EventDataOut {
            sender: Some(self.simplified().await),
            targetuserid: 0,
            timestamp: crate::unix_milli_time(),
            data: String::new(),
            extradata: String::new(),
        }
    }

    /// Run the flood heuristics for one message body and update the
    /// sender's state.
    ///
    /// A sender who keeps spamming sees the required gap between messages
    /// double each time; the scale resets after `max_throttle` of quiet.
    /// A body identical to the previous one (after stripping a leading
    /// `/me `) is rejected as a duplicate and bumps the scale by one.
    pub async fn flood_check(&self, body: &str, delay: Duration, max_throttle: Duration) -> FloodVerdict {
        let now = Instant::now();
        let mut flood = self.flood.lock().await;

        if let Some(last) = flood.lastmessagetime {
            let difference = now.duration_since(last);
            if difference <= delay {
                flood.delayscale = flood.delayscale.saturating_mul(2);
            } else if difference > max_throttle {
                flood.delayscale = 1;
            }
            let sendtime = last + delay * flood.delayscale;
            if sendtime > now {
                return FloodVerdict::Throttled;
            }
        }
        flood.lastmessagetime = Some(now);

        let digest = message_digest(body);
        if flood.lastmessage == Some(digest) {
            flood.delayscale += 1;
            return FloodVerdict::Duplicate;
        }
        flood.lastmessage = Some(digest);
        FloodVerdict::Accept
    }

    #[cfg(test)]
    pub async fn delayscale(&self) -> u32 {
        self.flood.lock().await.delayscale
    }
}

/// MD5 of the message body with a leading `/me ` action marker stripped,
/// so an action and its plain-text twin dedup together.
fn message_digest(body: &str) -> [u8; 16] {
    let stripped = body.strip_prefix("/me ").unwrap_or(body);
    Md5::digest(stripped.as_bytes()).into()
}

/// Parse the decimal userid carried in session JSON.
pub fn userid_from_session(session: &SessionUser) -> Option<Userid> {
    session.user_id.parse::<Userid>().ok().filter(|id| *id > 0)
}

// ---------------------------------------------------------------------------
// Nick lookup actor
// ---------------------------------------------------------------------------

enum LookupMsg {
    Add {
        nick: String,
        id: Userid,
        protected: bool,
    },
    Get {
        nick: String,
        reply: oneshot::Sender<Option<(Userid, bool)>>,
    },
}

/// Handle to the nick -> (userid, protected) lookup task.
///
/// Nicks are normalized to lowercase so the case used in moderation
/// commands does not matter.
#[derive(Clone)]
pub struct UserLookup {
    tx: mpsc::Sender<LookupMsg>,
}

impl UserLookup {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<LookupMsg>(256);
        tokio::spawn(async move {
            let mut nicks: HashMap<String, (Userid, bool)> = HashMap::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    LookupMsg::Add { nick, id, protected } => {
                        nicks.insert(nick, (id, protected));
                    }
                    LookupMsg::Get { nick, reply } => {
                        let _ = reply.send(nicks.get(&nick).copied());
                    }
                }
            }
        });
        Self { tx }
    }

    pub async fn add(&self, nick: &str, id: Userid, protected: bool) {
        let _ = self
            .tx
            .send(LookupMsg::Add {
                nick: nick.to_lowercase(),
                id,
                protected,
            })
            .await;
    }

    pub async fn get(&self, nick: &str) -> Option<(Userid, bool)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LookupMsg::Get {
                nick: nick.to_lowercase(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_features_map_to_their_bits() {
        let f = Features::from_names(&[
            "admin".to_owned(),
            "moderator".to_owned(),
            "vip".to_owned(),
            "protected".to_owned(),
            "subscriber".to_owned(),
            "bot".to_owned(),
        ]);
        for mask in [ISADMIN, ISMODERATOR, ISVIP, ISPROTECTED, ISSUBSCRIBER, ISBOT] {
            assert!(f.get(mask));
        }
        for bit in FLAIR_BASE..32 {
            assert!(!f.get(1 << bit), "flair bit {bit} should not be set");
        }
    }

    #[test]
    fn flair_features_round_trip_through_the_bitset() {
        let f = Features::from_names(&["flair3".to_owned(), "flair9".to_owned()]);
        let names = feature_names(f);
        assert_eq!(names.as_ref(), &vec!["flair3".to_owned(), "flair9".to_owned()]);
    }

    #[test]
    fn unknown_features_are_ignored() {
        let f = Features::from_names(&["wizard".to_owned(), "flairx".to_owned()]);
        assert_eq!(f, Features(0));
    }

    #[test]
    fn feature_name_list_uses_the_fixed_order() {
        let f = Features::from_names(&[
            "bot".to_owned(),
            "admin".to_owned(),
            "subscriber".to_owned(),
        ]);
        let names = feature_names(f);
        assert_eq!(
            names.as_ref(),
            &vec!["subscriber".to_owned(), "admin".to_owned(), "bot".to_owned()]
        );
    }

    #[tokio::test]
    async fn role_checks_follow_the_bitset() {
        let moderator = User::new(1, "mod", Features::from_names(&["moderator".to_owned()]));
        assert!(moderator.is_moderator().await);
        assert!(moderator.is_subscriber().await);
        assert!(!moderator.is_admin().await);

        let bot = User::new(2, "bot", Features::from_names(&["bot".to_owned()]));
        assert!(bot.is_moderator().await);
        assert!(bot.is_bot().await);
        // Bots do not get to speak through sub-only mode.
        assert!(!bot.is_subscriber().await);

        let pleb = User::new(3, "pleb", Features::default());
        assert!(!pleb.is_moderator().await);
        assert!(!pleb.is_subscriber().await);
    }

    #[tokio::test]
    async fn refresh_replaces_nick_features_and_projection() {
        let user = User::new(1, "oldnick", Features::from_names(&["subscriber".to_owned()]));
        user.refresh("NEWNICK", Features::from_names(&["protected".to_owned()]))
            .await;
        let simplified = user.simplified().await;
        assert_eq!(simplified.nick, "NEWNICK");
        assert_eq!(simplified.features, vec!["protected"]);
        assert!(!user.is_subscriber().await);
    }

    #[tokio::test]
    async fn flood_check_doubles_delayscale_on_rapid_messages() {
        let user = User::new(1, "spammer", Features::default());
        let delay = Duration::from_millis(300);
        let max = Duration::from_secs(300);

        assert_eq!(user.flood_check("m0", delay, max).await, FloodVerdict::Accept);
        // Five rapid-fire attempts double the scale each time: 2^5 = 32.
        for i in 1..=5 {
            assert_eq!(
                user.flood_check(&format!("m{i}"), delay, max).await,
                FloodVerdict::Throttled
            );
        }
        assert_eq!(user.delayscale().await, 32);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_check_rejects_duplicates_and_bumps_the_scale() {
        let user = User::new(1, "echo", Features::default());
        let delay = Duration::from_millis(300);
        let max = Duration::from_secs(300);

        assert_eq!(user.flood_check("hi", delay, max).await, FloodVerdict::Accept);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            user.flood_check("hi", delay, max).await,
            FloodVerdict::Duplicate
        );
        assert_eq!(user.delayscale().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_check_dedups_me_actions_against_plain_bodies() {
        let user = User::new(1, "actor", Features::default());
        let delay = Duration::from_millis(300);
        let max = Duration::from_secs(300);

        assert_eq!(
            user.flood_check("waves", delay, max).await,
            FloodVerdict::Accept
        );
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            user.flood_check("/me waves", delay, max).await,
            FloodVerdict::Duplicate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flood_check_resets_the_scale_after_the_throttle_horizon() {
        let user = User::new(1, "patient", Features::default());
        let delay = Duration::from_millis(300);
        let max = Duration::from_secs(300);

        assert_eq!(user.flood_check("a", delay, max).await, FloodVerdict::Accept);
        assert_eq!(user.flood_check("b", delay, max).await, FloodVerdict::Throttled);
        assert_eq!(user.delayscale().await, 2);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(user.flood_check("c", delay, max).await, FloodVerdict::Accept);
        assert_eq!(user.delayscale().await, 1);
    }

    #[test]
    fn session_userid_parses_decimal_strings_only() {
        let mut su = SessionUser {
            username: "alice".to_owned(),
            user_id: "123".to_owned(),
            features: vec![],
        };
        assert_eq!(userid_from_session(&su), Some(123));
        su.user_id = "abc".to_owned();
        assert_eq!(userid_from_session(&su), None);
        su.user_id = "0".to_owned();
        assert_eq!(userid_from_session(&su), None);
    }

    #[tokio::test]
    async fn nick_lookup_is_case_insensitive() {
        let lookup = UserLookup::spawn();
        lookup.add("TestNick", 7, true).await;
        assert_eq!(lookup.get("testnick").await, Some((7, true)));
        assert_eq!(lookup.get("TESTNICK").await, Some((7, true)));
        assert_eq!(lookup.get("other").await, None);
    }
}
