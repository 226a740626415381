//! SQL writer actors for the chat and ban logs.
//!
//! One dedicated task per statement class consumes a bounded queue with a
//! bounded retry, so a database backlog can never stall the serving path:
//! producers use `try_send` and a full queue drops the entry with a
//! warning.

use chrono::{DateTime, TimeZone, Utc};
use rc_protocol::{EventDataOut, Userid};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const QUEUE_SIZE: usize = 256;
const WRITE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct ChatlogEntry {
    userid: Userid,
    targetuserid: Option<Userid>,
    event: String,
    data: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
enum BanlogOp {
    Ban {
        userid: Userid,
        targetuserid: Userid,
        ipaddress: Option<String>,
        reason: String,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
    Unban {
        targetuserid: Userid,
    },
}

/// Producer handle for both writer actors.
#[derive(Clone)]
pub struct EventLog {
    chatlog: mpsc::Sender<ChatlogEntry>,
    banlog: mpsc::Sender<BanlogOp>,
}

impl EventLog {
    pub fn spawn(pool: PgPool) -> Self {
        let (chatlog_tx, mut chatlog_rx) = mpsc::channel::<ChatlogEntry>(QUEUE_SIZE);
        let (banlog_tx, mut banlog_rx) = mpsc::channel::<BanlogOp>(QUEUE_SIZE);

        let chatlog_pool = pool.clone();
        tokio::spawn(async move {
            while let Some(entry) = chatlog_rx.recv().await {
                retry(WRITE_ATTEMPTS, || {
                    crate::repo::chatlog::insert_event(
                        &chatlog_pool,
                        entry.userid,
                        entry.targetuserid,
                        &entry.event,
                        entry.data.as_deref(),
                        entry.timestamp,
                    )
                })
                .await;
            }
        });

        tokio::spawn(async move {
            while let Some(op) = banlog_rx.recv().await {
                match &op {
                    BanlogOp::Ban {
                        userid,
                        targetuserid,
                        ipaddress,
                        reason,
                        start,
                        end,
                    } => {
                        retry(WRITE_ATTEMPTS, || {
                            crate::repo::bans::insert_ban(
                                &pool,
                                *userid,
                                *targetuserid,
                                ipaddress.as_deref(),
                                reason,
                                *start,
                                *end,
                            )
                        })
                        .await;
                    }
                    BanlogOp::Unban { targetuserid } => {
                        retry(WRITE_ATTEMPTS, || {
                            crate::repo::bans::close_bans(&pool, *targetuserid)
                        })
                        .await;
                    }
                }
            }
        });

        Self {
            chatlog: chatlog_tx,
            banlog: banlog_tx,
        }
    }

    /// Queue a broadcast event for the chat log.  Non-blocking.
    pub fn log_event(&self, userid: Userid, event: &str, data: &EventDataOut) {
        let entry = ChatlogEntry {
            userid,
            targetuserid: (data.targetuserid != 0).then_some(data.targetuserid),
            event: event.to_owned(),
            data: (!data.data.is_empty()).then(|| data.data.clone()),
            timestamp: Utc
                .timestamp_millis_opt(data.timestamp)
                .single()
                .unwrap_or_else(Utc::now),
        };
        if self.chatlog.try_send(entry).is_err() {
            warn!(event, "chat log queue full, dropping entry");
        }
    }

    /// Queue a ban row.  Non-blocking.
    pub fn log_ban(
        &self,
        userid: Userid,
        targetuserid: Userid,
        ipaddress: Option<&str>,
        reason: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) {
        let op = BanlogOp::Ban {
            userid,
            targetuserid,
            ipaddress: ipaddress.map(ToOwned::to_owned),
            reason: reason.to_owned(),
            start,
            end,
        };
        if self.banlog.try_send(op).is_err() {
            warn!(targetuserid, "ban log queue full, dropping entry");
        }
    }

    /// Queue closing the target's open ban rows.  Non-blocking.
    pub fn log_unban(&self, targetuserid: Userid) {
        if self.banlog.try_send(BanlogOp::Unban { targetuserid }).is_err() {
            warn!(targetuserid, "ban log queue full, dropping unban");
        }
    }
}

async fn retry<F, Fut>(attempts: u32, mut op: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), sqlx::Error>>,
{
    for attempt in 1..=attempts {
        match op().await {
            Ok(()) => return,
            Err(e) if attempt == attempts => {
                warn!(error = %e, attempts, "dropping log write after retries");
            }
            Err(_) => tokio::time::sleep(RETRY_DELAY).await,
        }
    }
}
