//! The hub: one long-running event loop owning the canonical set of live
//! connections.
//!
//! All state changes are serialized through the loop, so broadcast order
//! between any two enqueued messages is preserved.  Fan-out never blocks:
//! a connection whose outbound queue is full loses that message and the
//! loop moves on.

use crate::bans::mask_ip;
use crate::user::User;
use rc_protocol::Userid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
pub const BROADCAST_CHANNEL_SIZE: usize = 256;
/// Bound of each connection's outbound queues.
pub const SEND_CHANNEL_SIZE: usize = 16;

/// A connection as the hub sees it: identity plus the signal and queue
/// senders owned by its writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub user: Option<Arc<User>>,
    pub ip: String,
    /// Pre-encoded frames; overflow drops the frame for this target only.
    pub preencoded: mpsc::Sender<Arc<String>>,
    /// One-shot "you are banned" signal.
    pub banned: mpsc::Sender<()>,
    /// One-shot "send REFRESH and stop" signal.
    pub refresh: mpsc::Sender<()>,
    /// Liveness pings (millisecond timestamps).
    pub ping: mpsc::Sender<i64>,
}

struct GetIps {
    userid: Userid,
    reply: oneshot::Sender<Vec<String>>,
}

struct Hub {
    connections: HashMap<u64, ConnectionHandle>,
    register: mpsc::Receiver<ConnectionHandle>,
    unregister: mpsc::Receiver<u64>,
    broadcast: mpsc::Receiver<Arc<String>>,
    bans: mpsc::Receiver<Userid>,
    ipbans: mpsc::Receiver<String>,
    getips: mpsc::Receiver<GetIps>,
    refreshuser: mpsc::Receiver<Userid>,
}

/// Cloneable producer side of the hub's channels.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register: mpsc::Sender<ConnectionHandle>,
    unregister: mpsc::Sender<u64>,
    broadcast: mpsc::Sender<Arc<String>>,
    bans: mpsc::Sender<Userid>,
    ipbans: mpsc::Sender<String>,
    getips: mpsc::Sender<GetIps>,
    refreshuser: mpsc::Sender<Userid>,
}

impl std::fmt::Debug for GetIps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetIps").field("userid", &self.userid).finish()
    }
}

impl HubHandle {
    /// Spawn the hub loop and return its handle.
    pub fn spawn() -> Self {
        let (register_tx, register) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (unregister_tx, unregister) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (broadcast_tx, broadcast) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (bans_tx, bans) = mpsc::channel(4);
        let (ipbans_tx, ipbans) = mpsc::channel(4);
        let (getips_tx, getips) = mpsc::channel(4);
        let (refreshuser_tx, refreshuser) = mpsc::channel(4);

        let hub = Hub {
            connections: HashMap::new(),
            register,
            unregister,
            broadcast,
            bans,
            ipbans,
            getips,
            refreshuser,
        };
        tokio::spawn(hub.run());

        Self {
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            bans: bans_tx,
            ipbans: ipbans_tx,
            getips: getips_tx,
            refreshuser: refreshuser_tx,
        }
    }

    pub async fn register(&self, handle: ConnectionHandle) {
        let _ = self.register.send(handle).await;
    }

    pub async fn unregister(&self, id: u64) {
        let _ = self.unregister.send(id).await;
    }

    /// Enqueue an already-encoded frame for delivery to every connection.
    pub async fn broadcast(&self, frame: Arc<String>) {
        let _ = self.broadcast.send(frame).await;
    }

    /// Signal every connection of `userid` that it has been banned.
    pub async fn ban(&self, userid: Userid) {
        let _ = self.bans.send(userid).await;
    }

    /// Signal every connection from `ip` (IPv6 compared at /64).
    pub async fn ipban(&self, ip: String) {
        let _ = self.ipbans.send(ip).await;
    }

    /// All live IPs of `userid`'s connections, for the offline-IP-ban path.
    pub async fn get_ips(&self, userid: Userid) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.getips.send(GetIps { userid, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tell every connection of `userid` to send a `REFRESH` and stop.
    pub async fn refresh_user(&self, userid: Userid) {
        let _ = self.refreshuser.send(userid).await;
    }
}

impl Hub {
    async fn run(mut self) {
        let mut pinger = tokio::time::interval(PING_INTERVAL);
        pinger.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Biased: membership changes drain before fan-out, so a frame
            // enqueued after a register can never overtake it.
            tokio::select! {
                biased;

                Some(handle) = self.register.recv() => {
                    trace!(id = handle.id, "connection registered");
                    self.connections.insert(handle.id, handle);
                }
                Some(id) = self.unregister.recv() => {
                    trace!(id, "connection unregistered");
                    self.connections.remove(&id);
                }
                Some(userid) = self.bans.recv() => {
                    for conn in self.connections.values() {
                        if conn.user.as_ref().is_some_and(|u| u.id == userid) {
                            let _ = conn.banned.try_send(());
                        }
                    }
                }
                Some(ip) = self.ipbans.recv() => {
                    let masked = mask_ip(&ip);
                    for conn in self.connections.values() {
                        if mask_ip(&conn.ip) == masked {
                            let _ = conn.banned.try_send(());
                        }
                    }
                }
                Some(req) = self.getips.recv() => {
                    let ips = self
                        .connections
                        .values()
                        .filter(|c| c.user.as_ref().is_some_and(|u| u.id == req.userid))
                        .map(|c| c.ip.clone())
                        .collect();
                    let _ = req.reply.send(ips);
                }
                Some(userid) = self.refreshuser.recv() => {
                    debug!(userid, "refreshing user connections");
                    for conn in self.connections.values() {
                        if conn.user.as_ref().is_some_and(|u| u.id == userid) {
                            let _ = conn.refresh.try_send(());
                        }
                    }
                }
                Some(frame) = self.broadcast.recv() => {
                    for conn in self.connections.values() {
                        // A slow consumer loses the message, never stalls the hub.
                        let _ = conn.preencoded.try_send(Arc::clone(&frame));
                    }
                }
                _ = pinger.tick() => {
                    let now = crate::unix_milli_time();
                    for conn in self.connections.values() {
                        let _ = conn.ping.try_send(now);
                    }
                }
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Features;

    struct TestConn {
        handle: ConnectionHandle,
        preencoded: mpsc::Receiver<Arc<String>>,
        banned: mpsc::Receiver<()>,
        refresh: mpsc::Receiver<()>,
        _ping: mpsc::Receiver<i64>,
    }

    fn test_conn(id: u64, user: Option<Arc<User>>, ip: &str) -> TestConn {
        let (preencoded_tx, preencoded) = mpsc::channel(SEND_CHANNEL_SIZE);
        let (banned_tx, banned) = mpsc::channel(1);
        let (refresh_tx, refresh) = mpsc::channel(1);
        let (ping_tx, ping) = mpsc::channel(2);
        TestConn {
            handle: ConnectionHandle {
                id,
                user,
                ip: ip.to_owned(),
                preencoded: preencoded_tx,
                banned: banned_tx,
                refresh: refresh_tx,
                ping: ping_tx,
            },
            preencoded,
            banned,
            refresh,
            _ping: ping,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_connection() {
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, None, "10.0.0.1");
        let mut b = test_conn(2, None, "10.0.0.2");
        hub.register(a.handle.clone()).await;
        hub.register(b.handle.clone()).await;

        hub.broadcast(Arc::new("MSG {\"data\":\"hi\"}".to_owned())).await;
        assert_eq!(*a.preencoded.recv().await.unwrap(), "MSG {\"data\":\"hi\"}");
        assert_eq!(*b.preencoded.recv().await.unwrap(), "MSG {\"data\":\"hi\"}");
    }

    #[tokio::test]
    async fn unregistered_connections_stop_receiving() {
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, None, "10.0.0.1");
        hub.register(a.handle.clone()).await;
        hub.unregister(1).await;
        hub.broadcast(Arc::new("MSG {}".to_owned())).await;

        // The sender side is still held by `a.handle`; after a beat no
        // frame must have arrived.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.preencoded.try_recv().is_err());
    }

    #[tokio::test]
    async fn ban_signals_only_the_matching_user() {
        let alice = Arc::new(User::new(1, "alice", Features::default()));
        let bob = Arc::new(User::new(2, "bob", Features::default()));
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, Some(alice), "10.0.0.1");
        let mut b = test_conn(2, Some(bob), "10.0.0.2");
        hub.register(a.handle.clone()).await;
        hub.register(b.handle.clone()).await;

        hub.ban(1).await;
        a.banned.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.banned.try_recv().is_err());
    }

    #[tokio::test]
    async fn ipban_matches_ipv6_at_slash_64() {
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, None, "2001:db8:1:2:aaaa::1");
        let mut b = test_conn(2, None, "2001:db8:9:9::1");
        hub.register(a.handle.clone()).await;
        hub.register(b.handle.clone()).await;

        hub.ipban("2001:db8:1:2:ffff::ffff".to_owned()).await;
        a.banned.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.banned.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_ips_returns_the_live_ips_of_a_user() {
        let alice = Arc::new(User::new(1, "alice", Features::default()));
        let hub = HubHandle::spawn();
        let a = test_conn(1, Some(Arc::clone(&alice)), "10.0.0.1");
        let b = test_conn(2, Some(alice), "10.0.0.2");
        let c = test_conn(3, None, "10.0.0.3");
        hub.register(a.handle.clone()).await;
        hub.register(b.handle.clone()).await;
        hub.register(c.handle.clone()).await;

        let mut ips = hub.get_ips(1).await;
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned()]);
        assert!(hub.get_ips(42).await.is_empty());
    }

    #[tokio::test]
    async fn refresh_signals_every_connection_of_the_user() {
        let alice = Arc::new(User::new(1, "alice", Features::default()));
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, Some(Arc::clone(&alice)), "10.0.0.1");
        let mut b = test_conn(2, Some(alice), "10.0.0.2");
        hub.register(a.handle.clone()).await;
        hub.register(b.handle.clone()).await;

        hub.refresh_user(1).await;
        a.refresh.recv().await.unwrap();
        b.refresh.recv().await.unwrap();
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_instead_of_blocking() {
        let hub = HubHandle::spawn();
        let mut a = test_conn(1, None, "10.0.0.1");
        hub.register(a.handle.clone()).await;

        // Overfill the queue; the hub must stay responsive throughout.
        for i in 0..SEND_CHANNEL_SIZE + 8 {
            hub.broadcast(Arc::new(format!("MSG {i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ips = hub.get_ips(99).await; // round-trips through the loop
        assert!(ips.is_empty());

        let mut received = 0;
        while a.preencoded.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SEND_CHANNEL_SIZE);
    }
}
