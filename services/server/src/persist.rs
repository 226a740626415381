//! Process-wide persisted state: the mute map and the sub-only flag.
//!
//! Every mutation rewrites the whole snapshot.  The rewrite goes through a
//! temp file in the same directory followed by a rename, so a crash
//! mid-write can never leave a truncated state file behind.

use chrono::{DateTime, TimeZone, Utc};
use rc_protocol::Userid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// On-disk form of the snapshot; expiries as unix milliseconds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    mutes: Vec<(Userid, i64)>,
    submode: bool,
}

#[derive(Debug, Default)]
struct StateInner {
    mutes: HashMap<Userid, DateTime<Utc>>,
    submode: bool,
}

/// The `{mutes, submode}` record, guarded by one RW lock and saved on
/// every change.
#[derive(Debug)]
pub struct ChatState {
    inner: RwLock<StateInner>,
    path: PathBuf,
}

impl ChatState {
    /// Load the snapshot from `path`; a missing file starts empty.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let inner = match std::fs::read(path) {
            Ok(bytes) => match bincode::deserialize::<Snapshot>(&bytes) {
                Ok(snapshot) => StateInner {
                    mutes: snapshot
                        .mutes
                        .into_iter()
                        .filter_map(|(uid, ms)| {
                            Utc.timestamp_millis_opt(ms).single().map(|t| (uid, t))
                        })
                        .collect(),
                    submode: snapshot.submode,
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file unreadable, starting empty");
                    StateInner::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateInner::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            inner: RwLock::new(inner),
            path: path.to_owned(),
        })
    }

    fn save(&self, inner: &StateInner) {
        let snapshot = Snapshot {
            mutes: inner
                .mutes
                .iter()
                .map(|(uid, t)| (*uid, t.timestamp_millis()))
                .collect(),
            submode: inner.submode,
        };
        let bytes = match bincode::serialize(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "unable to encode state snapshot");
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "unable to save state snapshot");
        }
    }

    pub async fn mute(&self, uid: Userid, until: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        inner.mutes.insert(uid, until);
        self.save(&inner);
    }

    pub async fn unmute(&self, uid: Userid) {
        let mut inner = self.inner.write().await;
        inner.mutes.remove(&uid);
        self.save(&inner);
    }

    /// Remaining mute duration for `uid`, when one is active.
    pub async fn mute_time_left(&self, uid: Userid) -> Option<chrono::Duration> {
        let inner = self.inner.read().await;
        let until = inner.mutes.get(&uid)?;
        let left = *until - Utc::now();
        (left > chrono::Duration::zero()).then_some(left)
    }

    pub async fn is_muted(&self, uid: Userid) -> bool {
        let inner = self.inner.read().await;
        inner.mutes.get(&uid).is_some_and(|until| *until > Utc::now())
    }

    /// Drop expired mutes and persist the result.
    pub async fn clean(&self) {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let before = inner.mutes.len();
        inner.mutes.retain(|_, until| *until > now);
        let removed = before - inner.mutes.len();
        if removed > 0 {
            debug!(removed, "cleaned expired mutes");
        }
        self.save(&inner);
    }

    pub async fn submode(&self) -> bool {
        self.inner.read().await.submode
    }

    pub async fn set_submode(&self, enabled: bool) {
        let mut inner = self.inner.write().await;
        inner.submode = enabled;
        self.save(&inner);
    }

    #[cfg(test)]
    pub async fn mute_count(&self) -> usize {
        self.inner.read().await.mutes.len()
    }
}
