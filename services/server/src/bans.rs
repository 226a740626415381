//! Ban registry: expiring user and IP bans with a reverse user -> IPs
//! index.
//!
//! The registry is read on every message accept and written only by
//! moderation commands and pub/sub refreshes, so each map sits behind its
//! own RW lock instead of an actor.  IPv6 addresses are masked to their
//! /64 network before insertion and lookup; IPv4 addresses are used
//! literally.

use crate::eventlog::EventLog;
use crate::hub::HubHandle;
use crate::kv::Kv;
use chrono::{DateTime, Utc};
use rc_protocol::{BanIn, Userid};
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60 * 60);
/// Permanent bans are stored as a far-future expiry.
pub const PERMANENT_BAN_DAYS: i64 = 3650;

#[derive(Debug, Default)]
pub struct Bans {
    users: RwLock<HashMap<Userid, DateTime<Utc>>>,
    ips: RwLock<HashMap<String, DateTime<Utc>>>,
    userips: RwLock<HashMap<Userid, Vec<String>>>,
}

/// Mask an IPv6 address to its /64 network; IPv4 and unparseable strings
/// pass through unchanged.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => {
            let masked = u128::from(v6) & !((1u128 << 64) - 1);
            IpAddr::V6(masked.into()).to_string()
        }
        _ => ip.to_owned(),
    }
}

impl Bans {
    pub async fn is_userid_banned(&self, uid: Userid) -> bool {
        if uid == 0 {
            return false;
        }
        self.users
            .read()
            .await
            .get(&uid)
            .is_some_and(|until| *until > Utc::now())
    }

    pub async fn is_ip_banned(&self, ip: &str) -> bool {
        self.ips
            .read()
            .await
            .get(&mask_ip(ip))
            .is_some_and(|until| *until > Utc::now())
    }

    /// The pre-upgrade check: either the caller's IP or (when known) the
    /// account is banned.
    pub async fn is_userid_ip_banned(&self, ip: &str, uid: Userid) -> bool {
        self.is_ip_banned(ip).await || self.is_userid_banned(uid).await
    }

    pub async fn ban_userid(&self, uid: Userid, until: DateTime<Utc>) {
        self.users.write().await.insert(uid, until);
    }

    /// Record an IP ban attributed to `uid` so an unban by userid can
    /// lift it again.
    pub async fn ban_ip(&self, uid: Userid, ip: &str, until: DateTime<Utc>) {
        let masked = mask_ip(ip);
        self.ips.write().await.insert(masked.clone(), until);
        let mut userips = self.userips.write().await;
        let ips = userips.entry(uid).or_default();
        if !ips.contains(&masked) {
            ips.push(masked);
        }
    }

    /// Remove the user ban and every IP ban attributed to the user.
    pub async fn unban_userid(&self, uid: Userid) {
        self.users.write().await.remove(&uid);
        let attributed = self.userips.write().await.remove(&uid).unwrap_or_default();
        if !attributed.is_empty() {
            let mut ips = self.ips.write().await;
            for ip in &attributed {
                ips.remove(ip);
                debug!(uid, ip = %ip, "unbanned attributed ip");
            }
        }
    }

    /// Sweep expired entries from all three maps.
    pub async fn clean(&self) {
        let now = Utc::now();
        let expired_users: Vec<Userid> = {
            let mut users = self.users.write().await;
            let expired = users
                .iter()
                .filter(|(_, until)| **until <= now)
                .map(|(uid, _)| *uid)
                .collect::<Vec<_>>();
            for uid in &expired {
                users.remove(uid);
            }
            expired
        };
        if !expired_users.is_empty() {
            let mut userips = self.userips.write().await;
            for uid in &expired_users {
                userips.remove(uid);
            }
            debug!(expired = expired_users.len(), "cleaned expired user bans");
        }

        let mut ips = self.ips.write().await;
        let before = ips.len();
        ips.retain(|_, until| *until > now);
        let removed = before - ips.len();
        if removed > 0 {
            debug!(expired = removed, "cleaned expired ip bans");
        }
    }

    /// Replace the whole in-memory state with the active rows from SQL.
    /// Used at startup and on `refreshbans` pub/sub messages.
    pub async fn load_active(&self, pool: &PgPool) {
        let rows = match crate::repo::bans::load_active(pool).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "unable to load active bans");
                return;
            }
        };

        let mut users = HashMap::new();
        let mut ips = HashMap::new();
        let mut userips: HashMap<Userid, Vec<String>> = HashMap::new();
        for row in rows {
            let until = row
                .endtimestamp
                .unwrap_or_else(|| Utc::now() + chrono::Duration::days(PERMANENT_BAN_DAYS));
            match row.ipaddress {
                Some(ip) => {
                    let masked = mask_ip(&ip);
                    ips.insert(masked.clone(), until);
                    userips.entry(row.targetuserid).or_default().push(masked);
                }
                None => {
                    users.insert(row.targetuserid, until);
                }
            }
        }

        let count = users.len() + ips.len();
        *self.users.write().await = users;
        *self.ips.write().await = ips;
        *self.userips.write().await = userips;
        info!(count, "loaded active bans");
    }

    #[cfg(test)]
    pub async fn counts(&self) -> (usize, usize, usize) {
        (
            self.users.read().await.len(),
            self.ips.read().await.len(),
            self.userips.read().await.len(),
        )
    }
}

/// Expiry for a ban request: permanent bans get the far-future horizon.
pub fn ban_expiry(ban: &BanIn, now: DateTime<Utc>) -> DateTime<Utc> {
    if ban.ispermanent {
        now + chrono::Duration::days(PERMANENT_BAN_DAYS)
    } else {
        let duration = if ban.duration > 0 {
            chrono::Duration::nanoseconds(ban.duration)
        } else {
            chrono::Duration::from_std(DEFAULT_BAN_DURATION)
                .unwrap_or_else(|_| chrono::Duration::hours(1))
        };
        now + duration
    }
}

/// Apply a moderation ban: registry entry, ban-log row, and when `banip`
/// is set an IP ban for every live and recently-cached address of the
/// target, each fanned out to the hub so open sessions drop immediately.
pub async fn ban_user(
    bans: &Bans,
    hub: &HubHandle,
    kv: &Kv,
    eventlog: &EventLog,
    issuer: Userid,
    target: Userid,
    ban: &BanIn,
) {
    let now = Utc::now();
    let until = ban_expiry(ban, now);
    let end = (!ban.ispermanent).then_some(until);

    bans.ban_userid(target, until).await;
    eventlog.log_ban(issuer, target, None, &ban.reason, now, end);

    if ban.banip {
        let mut ips = hub.get_ips(target).await;
        for cached in kv.recent_ips(target).await {
            if !ips.contains(&cached) {
                ips.push(cached);
            }
        }
        for ip in ips {
            bans.ban_ip(target, &ip, until).await;
            hub.ipban(ip.clone()).await;
            eventlog.log_ban(issuer, target, Some(&ip), &ban.reason, now, end);
            debug!(target, ip = %ip, "ip-banned user");
        }
    }

    hub.ban(target).await;
    info!(issuer, target, permanent = ban.ispermanent, "banned user");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    fn past() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn userid_ban_expires_with_its_entry() {
        let bans = Bans::default();
        bans.ban_userid(1, future()).await;
        assert!(bans.is_userid_banned(1).await);

        bans.ban_userid(1, past()).await;
        assert!(!bans.is_userid_banned(1).await);
    }

    #[tokio::test]
    async fn ip_ban_expires_with_its_entry() {
        let bans = Bans::default();
        bans.ban_ip(1, "10.1.2.3", future()).await;
        assert!(bans.is_ip_banned("10.1.2.3").await);

        bans.ban_ip(1, "10.1.2.3", past()).await;
        assert!(!bans.is_ip_banned("10.1.2.3").await);
    }

    #[tokio::test]
    async fn ipv6_bans_cover_the_whole_slash_64() {
        let bans = Bans::default();
        bans.ban_ip(1, "2001:db8:1:2:aaaa:bbbb:cccc:dddd", future()).await;
        assert!(bans.is_ip_banned("2001:db8:1:2:1:2:3:4").await);
        assert!(!bans.is_ip_banned("2001:db8:1:3::1").await);
    }

    #[test]
    fn ipv4_and_garbage_are_not_masked() {
        assert_eq!(mask_ip("1.2.3.4"), "1.2.3.4");
        assert_eq!(mask_ip("not-an-ip"), "not-an-ip");
        assert_eq!(mask_ip("2001:db8:1:2:aaaa::1"), "2001:db8:1:2::");
    }

    #[tokio::test]
    async fn anonymous_userid_is_never_banned() {
        let bans = Bans::default();
        bans.ban_userid(0, future()).await;
        assert!(!bans.is_userid_banned(0).await);
    }

    #[tokio::test]
    async fn clean_sweeps_every_expired_entry() {
        let bans = Bans::default();
        bans.ban_userid(1, past()).await;
        bans.ban_userid(2, future()).await;
        bans.ban_ip(1, "10.0.0.1", past()).await;
        bans.ban_ip(2, "10.0.0.2", future()).await;

        bans.clean().await;
        let (users, ips, _) = bans.counts().await;
        assert_eq!(users, 1);
        assert_eq!(ips, 1);
        assert!(bans.is_userid_banned(2).await);
        assert!(bans.is_ip_banned("10.0.0.2").await);
    }

    #[tokio::test]
    async fn unban_restores_the_pre_ban_state() {
        let bans = Bans::default();
        bans.ban_userid(1, future()).await;
        bans.ban_ip(1, "10.0.0.1", future()).await;
        bans.ban_ip(1, "10.0.0.2", future()).await;

        bans.unban_userid(1).await;
        assert!(!bans.is_userid_banned(1).await);
        assert!(!bans.is_ip_banned("10.0.0.1").await);
        assert!(!bans.is_ip_banned("10.0.0.2").await);
        let (users, ips, userips) = bans.counts().await;
        assert_eq!((users, ips, userips), (0, 0, 0));
    }

    #[test]
    fn ban_expiry_honors_duration_default_and_permanent() {
        let now = Utc::now();

        let default = ban_expiry(&BanIn::default(), now);
        assert_eq!(default - now, chrono::Duration::hours(1));

        let timed = ban_expiry(
            &BanIn {
                duration: chrono::Duration::minutes(30).num_nanoseconds().unwrap(),
                ..BanIn::default()
            },
            now,
        );
        assert_eq!(timed - now, chrono::Duration::minutes(30));

        let permanent = ban_expiry(
            &BanIn {
                ispermanent: true,
                duration: 1,
                ..BanIn::default()
            },
            now,
        );
        assert_eq!(permanent - now, chrono::Duration::days(PERMANENT_BAN_DAYS));
    }
}
