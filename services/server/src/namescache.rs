//! Presence: the master userid -> user map, the memoized `NAMES`
//! snapshot, and the global connection counter.
//!
//! Owned by a single actor; every membership change re-serializes the
//! snapshot once, and all connections send those same bytes verbatim.
//! Disconnecting down to zero keeps the entry (flood-control state
//! survives reconnects) but removes the user from the snapshot.

use crate::user::{Features, User};
use rc_protocol::{NamesOut, Userid};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

enum NamesMsg {
    Add {
        user: Arc<User>,
        reply: oneshot::Sender<(Arc<User>, i32)>,
    },
    Disconnect {
        userid: Userid,
        reply: oneshot::Sender<i32>,
    },
    Refresh {
        userid: Userid,
        nick: String,
        features: Features,
        reply: oneshot::Sender<Option<Arc<User>>>,
    },
    AddAnonymous,
    RemoveAnonymous,
    Snapshot {
        reply: oneshot::Sender<Arc<String>>,
    },
}

struct NamesCache {
    users: HashMap<Userid, Arc<User>>,
    snapshot: Arc<String>,
    connectioncount: u32,
}

#[derive(Clone)]
pub struct NamesHandle {
    tx: mpsc::Sender<NamesMsg>,
}

impl NamesHandle {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        let cache = NamesCache {
            users: HashMap::new(),
            snapshot: Arc::new(String::new()),
            connectioncount: 0,
        };
        tokio::spawn(cache.run(rx));
        Self { tx }
    }

    /// Register one more connection for `user`.
    ///
    /// Returns the canonical shared record (an earlier connection may have
    /// created it) and the user's new connection count.
    pub async fn add(&self, user: Arc<User>) -> (Arc<User>, i32) {
        let (reply, rx) = oneshot::channel();
        let fallback = Arc::clone(&user);
        if self.tx.send(NamesMsg::Add { user, reply }).await.is_err() {
            return (fallback, 1);
        }
        rx.await.unwrap_or((fallback, 1))
    }

    /// Drop one connection of `userid`; returns the remaining count.
    pub async fn disconnect(&self, userid: Userid) -> i32 {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(NamesMsg::Disconnect { userid, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Apply refreshed identity data to the canonical record, when present.
    pub async fn refresh(&self, userid: Userid, nick: &str, features: Features) -> Option<Arc<User>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NamesMsg::Refresh {
                userid,
                nick: nick.to_owned(),
                features,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn add_anonymous(&self) {
        let _ = self.tx.send(NamesMsg::AddAnonymous).await;
    }

    pub async fn remove_anonymous(&self) {
        let _ = self.tx.send(NamesMsg::RemoveAnonymous).await;
    }

    /// The serialized `NAMES` payload, shared by every connection.
    pub async fn snapshot(&self) -> Arc<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(NamesMsg::Snapshot { reply }).await.is_err() {
            return Arc::new(String::new());
        }
        rx.await.unwrap_or_else(|_| Arc::new(String::new()))
    }
}

impl NamesCache {
    async fn run(mut self, mut rx: mpsc::Receiver<NamesMsg>) {
        self.marshal().await;
        while let Some(msg) = rx.recv().await {
            match msg {
                NamesMsg::Add { user, reply } => {
                    self.connectioncount += 1;
                    let canonical = Arc::clone(self.users.entry(user.id).or_insert(user));
                    let count = canonical.connections.fetch_add(1, Ordering::Relaxed) + 1;
                    self.marshal().await;
                    let _ = reply.send((canonical, count));
                }
                NamesMsg::Disconnect { userid, reply } => {
                    self.connectioncount = self.connectioncount.saturating_sub(1);
                    // The entry stays; only the counter drops.  A user at
                    // zero disappears from the snapshot.
                    let count = match self.users.get(&userid) {
                        Some(user) => user.connections.fetch_sub(1, Ordering::Relaxed) - 1,
                        None => {
                            warn!(userid, "disconnect for unknown user");
                            0
                        }
                    };
                    self.marshal().await;
                    let _ = reply.send(count);
                }
                NamesMsg::Refresh {
                    userid,
                    nick,
                    features,
                    reply,
                } => {
                    let user = self.users.get(&userid).cloned();
                    if let Some(user) = &user {
                        user.refresh(&nick, features).await;
                        self.marshal().await;
                    }
                    let _ = reply.send(user);
                }
                NamesMsg::AddAnonymous => {
                    self.connectioncount += 1;
                    self.marshal().await;
                }
                NamesMsg::RemoveAnonymous => {
                    self.connectioncount = self.connectioncount.saturating_sub(1);
                    self.marshal().await;
                }
                NamesMsg::Snapshot { reply } => {
                    let _ = reply.send(Arc::clone(&self.snapshot));
                }
            }
        }
    }

    async fn marshal(&mut self) {
        let mut users = Vec::new();
        for user in self.users.values() {
            if user.connections.load(Ordering::Relaxed) > 0 {
                users.push(user.simplified().await);
            }
        }
        let names = NamesOut {
            users,
            connectioncount: self.connectioncount,
        };
        match serde_json::to_string(&names) {
            Ok(json) => self.snapshot = Arc::new(json),
            Err(e) => warn!(error = %e, "unable to serialize names snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(snapshot: &str) -> NamesOut {
        serde_json::from_str(snapshot).unwrap()
    }

    #[tokio::test]
    async fn snapshot_lists_each_user_once_across_multiple_connections() {
        let names = NamesHandle::spawn();
        let alice = Arc::new(User::new(
            1,
            "alice",
            Features::from_names(&["subscriber".to_owned()]),
        ));

        let (canonical, count) = names.add(Arc::clone(&alice)).await;
        assert_eq!(count, 1);
        // A second connection for the same account reuses the record.
        let (second, count) = names.add(Arc::new(User::new(1, "alice", Features::default()))).await;
        assert_eq!(count, 2);
        assert!(Arc::ptr_eq(&canonical, &second));

        let snapshot = parse(&names.snapshot().await);
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.users[0].nick, "alice");
        assert_eq!(snapshot.users[0].features, vec!["subscriber"]);
        assert_eq!(snapshot.connectioncount, 2);

        // Dropping one of two connections keeps the entry unchanged.
        assert_eq!(names.disconnect(1).await, 1);
        let snapshot = parse(&names.snapshot().await);
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.users[0].features, vec!["subscriber"]);
        assert_eq!(snapshot.connectioncount, 1);

        // Dropping the last one removes the user from the snapshot.
        assert_eq!(names.disconnect(1).await, 0);
        let snapshot = parse(&names.snapshot().await);
        assert!(snapshot.users.is_empty());
        assert_eq!(snapshot.connectioncount, 0);
    }

    #[tokio::test]
    async fn flood_state_survives_a_full_disconnect() {
        let names = NamesHandle::spawn();
        let alice = Arc::new(User::new(1, "alice", Features::default()));
        let (first, _) = names.add(alice).await;
        names.disconnect(1).await;

        let (again, count) = names.add(Arc::new(User::new(1, "alice", Features::default()))).await;
        assert_eq!(count, 1);
        assert!(Arc::ptr_eq(&first, &again), "record must be retained at zero");
    }

    #[tokio::test]
    async fn anonymous_connections_only_move_the_counter() {
        let names = NamesHandle::spawn();
        names.add_anonymous().await;
        names.add_anonymous().await;
        let snapshot = parse(&names.snapshot().await);
        assert!(snapshot.users.is_empty());
        assert_eq!(snapshot.connectioncount, 2);

        names.remove_anonymous().await;
        let snapshot = parse(&names.snapshot().await);
        assert_eq!(snapshot.connectioncount, 1);
    }

    #[tokio::test]
    async fn refresh_updates_the_snapshot_in_place() {
        let names = NamesHandle::spawn();
        names
            .add(Arc::new(User::new(
                1,
                "oldnick",
                Features::from_names(&["subscriber".to_owned()]),
            )))
            .await;

        let refreshed = names
            .refresh(1, "NEWNICK", Features::from_names(&["protected".to_owned()]))
            .await;
        assert!(refreshed.is_some());

        let snapshot = parse(&names.snapshot().await);
        assert_eq!(snapshot.users[0].nick, "NEWNICK");
        assert_eq!(snapshot.users[0].features, vec!["protected"]);

        assert!(names.refresh(42, "ghost", Features::default()).await.is_none());
    }
}
