use chrono::{DateTime, Utc};
use rc_protocol::Userid;
use sqlx::{PgPool, Row};

/// One active ban row; `ipaddress` is set for IP bans, otherwise the row
/// bans the account itself.  A null `endtimestamp` means permanent.
#[derive(Debug)]
pub struct BanRow {
    pub targetuserid: Userid,
    pub ipaddress: Option<String>,
    pub endtimestamp: Option<DateTime<Utc>>,
}

/// All unexpired ban rows, for (re)building the in-memory registry.
pub async fn load_active(pool: &PgPool) -> Result<Vec<BanRow>, sqlx::Error> {
    let rows = sqlx::query(
        r"SELECT DISTINCT targetuserid, ipaddress, endtimestamp
          FROM bans
          WHERE endtimestamp IS NULL OR endtimestamp > now()",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(BanRow {
                targetuserid: row.try_get("targetuserid")?,
                ipaddress: row.try_get("ipaddress")?,
                endtimestamp: row.try_get("endtimestamp")?,
            })
        })
        .collect()
}

pub async fn insert_ban(
    pool: &PgPool,
    userid: Userid,
    targetuserid: Userid,
    ipaddress: Option<&str>,
    reason: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"INSERT INTO bans (userid, targetuserid, ipaddress, reason, starttimestamp, endtimestamp)
          VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(userid)
    .bind(targetuserid)
    .bind(ipaddress)
    .bind(reason)
    .bind(start)
    .bind(end)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close every open ban row of the target.
pub async fn close_bans(pool: &PgPool, targetuserid: Userid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"UPDATE bans
          SET endtimestamp = now()
          WHERE targetuserid = $1
            AND (endtimestamp IS NULL OR endtimestamp > now())",
    )
    .bind(targetuserid)
    .execute(pool)
    .await?;
    Ok(())
}
