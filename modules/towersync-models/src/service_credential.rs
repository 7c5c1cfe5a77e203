use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{attr_ref, attr_str, attr_time, require_attrs, Attrs, RepoStats, SourceScope};
use crate::error::Result;

/// A credential from the upstream controller. The credential-type foreign key
/// stays null until the link phase resolves `credential_type_source_ref`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceCredential {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub source_ref: String,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub name: String,
    pub type_name: String,
    pub description: String,
    pub tenant_id: i64,
    pub source_id: i64,
    pub service_credential_type_id: Option<i64>,
}

/// Upsert result carrying the staging ref for the deferred link map.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: i64,
    pub source_ref: String,
    pub credential_type_source_ref: String,
}

const REQUIRED: &[&str] = &[
    "created",
    "modified",
    "name",
    "id",
    "description",
    "credential_type",
];

#[derive(Debug)]
struct NewCredential {
    source_ref: String,
    name: String,
    description: String,
    credential_type_source_ref: String,
    source_created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

fn project(attrs: &Attrs) -> Result<NewCredential> {
    require_attrs(attrs, REQUIRED)?;
    Ok(NewCredential {
        source_ref: attr_ref(attrs, "id")?,
        name: attr_str(attrs, "name")?.to_string(),
        description: attr_str(attrs, "description")?.to_string(),
        credential_type_source_ref: attr_ref(attrs, "credential_type")?,
        source_created_at: attr_time(attrs, "created")?,
        source_updated_at: attr_time(attrs, "modified")?,
    })
}

#[derive(Debug, Default)]
pub struct CredentialRepository {
    stats: RepoStats,
}

impl CredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update a credential. Updates are gated on the upstream
    /// `modified` timestamp: an unchanged credential is left alone.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
    ) -> Result<CredentialRecord> {
        let new = project(attrs)?;

        let existing: Option<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, source_updated_at FROM service_credentials
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&new.source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %new.source_ref, "Creating credential");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_credentials
                         (source_ref, source_created_at, source_updated_at, last_seen_at,
                          name, description, tenant_id, source_id)
                     VALUES ($1, $2, $3, now(), $4, $5, $6, $7)
                     RETURNING id",
                )
                .bind(&new.source_ref)
                .bind(new.source_created_at)
                .bind(new.source_updated_at)
                .bind(&new.name)
                .bind(&new.description)
                .bind(scope.tenant_id)
                .bind(scope.source_id)
                .fetch_one(conn)
                .await?;
                self.stats.adds += 1;
                id
            }
            Some((id, stored_updated_at)) => {
                if stored_updated_at == Some(new.source_updated_at) {
                    debug!(source_ref = %new.source_ref, "Credential is in sync");
                } else {
                    debug!(source_ref = %new.source_ref, id, "Updating credential");
                    sqlx::query(
                        "UPDATE service_credentials
                         SET name = $2, description = $3, source_updated_at = $4,
                             last_seen_at = now(), updated_at = now()
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(&new.name)
                    .bind(&new.description)
                    .bind(new.source_updated_at)
                    .execute(conn)
                    .await?;
                    self.stats.updates += 1;
                }
                id
            }
        };

        Ok(CredentialRecord {
            id,
            source_ref: new.source_ref,
            credential_type_source_ref: new.credential_type_source_ref,
        })
    }

    pub async fn archive_missing(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        keep_refs: &[String],
    ) -> Result<()> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, source_ref FROM service_credentials
             WHERE source_id = $1 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .fetch_all(&mut *conn)
        .await?;

        let keep: HashSet<&str> = keep_refs.iter().map(String::as_str).collect();
        for (id, source_ref) in rows {
            if keep.contains(source_ref.as_str()) {
                continue;
            }
            info!(source_ref = %source_ref, id, "Archiving credential missing from snapshot");
            sqlx::query(
                "UPDATE service_credentials SET archived_at = now(), updated_at = now()
                 WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *conn)
            .await?;
            self.stats.deletes += 1;
        }
        Ok(())
    }
}
