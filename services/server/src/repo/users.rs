use rc_protocol::Userid;
use sqlx::{PgPool, Row};

/// Preload of the nick lookup table: `(userid, username, protected)` for
/// every known account, with the protected flag resolved through the
/// features table.
pub async fn load_nicks(pool: &PgPool) -> Result<Vec<(Userid, String, bool)>, sqlx::Error> {
    let rows = sqlx::query(
        r"SELECT DISTINCT u.userid, u.username, (f.userid IS NOT NULL) AS protected
          FROM users AS u
          LEFT JOIN users_features AS f ON f.userid = u.userid
            AND f.featureid = (SELECT featureid FROM features WHERE featurename = 'protected')",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok((
                row.try_get("userid")?,
                row.try_get("username")?,
                row.try_get("protected")?,
            ))
        })
        .collect()
}
