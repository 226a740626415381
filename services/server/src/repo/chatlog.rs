use chrono::{DateTime, Utc};
use rc_protocol::Userid;
use sqlx::PgPool;

pub async fn insert_event(
    pool: &PgPool,
    userid: Userid,
    targetuserid: Option<Userid>,
    event: &str,
    data: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"INSERT INTO chatlog (userid, targetuserid, event, data, timestamp)
          VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(userid)
    .bind(targetuserid)
    .bind(event)
    .bind(data)
    .bind(timestamp)
    .execute(pool)
    .await?;
    Ok(())
}
