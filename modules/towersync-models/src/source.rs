use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub uid: Option<String>,
    pub tenant_id: i64,
    pub refresh_state: Option<String>,
    pub refresh_started_at: Option<DateTime<Utc>>,
    pub refresh_finished_at: Option<DateTime<Utc>>,
    pub last_successful_refresh_at: Option<DateTime<Utc>>,
    pub bytes_received: Option<i64>,
}

/// Look a source up by id. The persister never creates sources.
pub async fn find_source(pool: &PgPool, id: i64) -> Result<Option<Source>> {
    let row = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// lock_not_available: another transaction already holds the row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Claim the source row for the duration of the ingest transaction.
///
/// At most one refresh per source may run at a time; a second claimer fails
/// immediately instead of queueing. The lock and the refresh-state write both
/// live inside the caller's transaction, so a rollback releases everything.
pub async fn claim_for_refresh(conn: &mut PgConnection, source_id: i64) -> Result<()> {
    let locked = sqlx::query("SELECT id FROM sources WHERE id = $1 FOR UPDATE NOWAIT")
        .bind(source_id)
        .fetch_optional(&mut *conn)
        .await;

    match locked {
        Ok(Some(_)) => {}
        Ok(None) => return Err(ModelError::Database(sqlx::Error::RowNotFound)),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            return Err(ModelError::RefreshActive(source_id));
        }
        Err(e) => return Err(e.into()),
    }

    sqlx::query(
        "UPDATE sources
         SET refresh_state = 'active', refresh_started_at = now(), updated_at = now()
         WHERE id = $1",
    )
    .bind(source_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a completed refresh on the success path, just before commit.
pub async fn finish_refresh(
    conn: &mut PgConnection,
    source_id: i64,
    bytes_received: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE sources
         SET refresh_state = 'idle',
             refresh_finished_at = now(),
             last_successful_refresh_at = now(),
             bytes_received = $2,
             updated_at = now()
         WHERE id = $1",
    )
    .bind(source_id)
    .bind(bytes_received)
    .execute(conn)
    .await?;
    Ok(())
}
