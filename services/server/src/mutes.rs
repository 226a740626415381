//! Mute policy on top of the persisted state store.

use crate::persist::ChatState;
use crate::user::User;
use chrono::Utc;
use rc_protocol::Userid;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MUTE_DURATION: Duration = Duration::from_secs(10 * 60);
pub const MAX_MUTE_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Mute `uid` for `duration` from now, persisting the change.
pub async fn mute_userid(state: &ChatState, uid: Userid, duration: Duration) {
    let until = Utc::now()
        + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(7));
    state.mute(uid, until).await;
    debug!(uid, ?duration, "muted userid");
}

pub async fn unmute_userid(state: &ChatState, uid: Userid) {
    state.unmute(uid).await;
    debug!(uid, "unmuted userid");
}

/// Anonymous connections are always muted; authenticated users are muted
/// while an unexpired entry exists for them.
pub async fn is_user_muted(state: &ChatState, user: Option<&Arc<User>>) -> bool {
    match user {
        None => true,
        Some(user) => state.is_muted(user.id).await,
    }
}

/// Seconds left on an active mute, for the `muted` error payload.
pub async fn mute_time_left_secs(state: &ChatState, uid: Userid) -> i64 {
    state
        .mute_time_left(uid)
        .await
        .map_or(0, |left| left.num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Features;

    #[tokio::test]
    async fn anonymous_is_always_muted() {
        let dir = tempfile::tempdir().unwrap();
        let state = ChatState::load(&dir.path().join("state.bin")).unwrap();
        assert!(is_user_muted(&state, None).await);
    }

    #[tokio::test]
    async fn mute_applies_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let state = ChatState::load(&dir.path().join("state.bin")).unwrap();
        let user = Arc::new(User::new(1, "alice", Features::default()));

        assert!(!is_user_muted(&state, Some(&user)).await);
        mute_userid(&state, 1, DEFAULT_MUTE_DURATION).await;
        assert!(is_user_muted(&state, Some(&user)).await);
        assert!(mute_time_left_secs(&state, 1).await > 0);

        unmute_userid(&state, 1).await;
        assert!(!is_user_muted(&state, Some(&user)).await);
        assert_eq!(mute_time_left_secs(&state, 1).await, 0);
    }
}
