use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{attr_ref, attr_str, attr_time, require_attrs, Attrs, RepoStats, SourceScope};
use crate::error::Result;

/// A credential type from the upstream controller.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceCredentialType {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub source_ref: String,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub name: String,
    pub description: String,
    pub kind: String,
    pub namespace: String,
    pub tenant_id: i64,
    pub source_id: i64,
}

#[derive(Debug, Clone)]
pub struct CredentialTypeRecord {
    pub id: i64,
    pub source_ref: String,
}

const REQUIRED: &[&str] = &[
    "kind",
    "namespace",
    "created",
    "modified",
    "name",
    "id",
    "description",
];

#[derive(Debug)]
struct NewCredentialType {
    source_ref: String,
    name: String,
    description: String,
    kind: String,
    namespace: String,
    source_created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

fn project(attrs: &Attrs) -> Result<NewCredentialType> {
    require_attrs(attrs, REQUIRED)?;
    Ok(NewCredentialType {
        source_ref: attr_ref(attrs, "id")?,
        name: attr_str(attrs, "name")?.to_string(),
        description: attr_str(attrs, "description")?.to_string(),
        kind: attr_str(attrs, "kind")?.to_string(),
        namespace: attr_str(attrs, "namespace")?.to_string(),
        source_created_at: attr_time(attrs, "created")?,
        source_updated_at: attr_time(attrs, "modified")?,
    })
}

#[derive(Debug, Default)]
pub struct CredentialTypeRepository {
    stats: RepoStats,
}

impl CredentialTypeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update a credential type. Existing rows are always rewritten.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
    ) -> Result<CredentialTypeRecord> {
        let new = project(attrs)?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM service_credential_types
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&new.source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %new.source_ref, "Creating credential type");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_credential_types
                         (source_ref, source_created_at, source_updated_at, last_seen_at,
                          name, description, kind, namespace, tenant_id, source_id)
                     VALUES ($1, $2, $3, now(), $4, $5, $6, $7, $8, $9)
                     RETURNING id",
                )
                .bind(&new.source_ref)
                .bind(new.source_created_at)
                .bind(new.source_updated_at)
                .bind(&new.name)
                .bind(&new.description)
                .bind(&new.kind)
                .bind(&new.namespace)
                .bind(scope.tenant_id)
                .bind(scope.source_id)
                .fetch_one(conn)
                .await?;
                self.stats.adds += 1;
                id
            }
            Some((id,)) => {
                debug!(source_ref = %new.source_ref, id, "Updating credential type");
                sqlx::query(
                    "UPDATE service_credential_types
                     SET name = $2, description = $3, kind = $4, namespace = $5,
                         source_updated_at = $6, last_seen_at = now(), updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&new.name)
                .bind(&new.description)
                .bind(&new.kind)
                .bind(&new.namespace)
                .bind(new.source_updated_at)
                .execute(conn)
                .await?;
                self.stats.updates += 1;
                id
            }
        };

        Ok(CredentialTypeRecord {
            id,
            source_ref: new.source_ref,
        })
    }

    pub async fn archive_missing(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        keep_refs: &[String],
    ) -> Result<()> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, source_ref FROM service_credential_types
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
            info!(source_ref = %source_ref, id, "Archiving credential type missing from snapshot");
            sqlx::query(
                "UPDATE service_credential_types SET archived_at = now(), updated_at = now()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projects_kind_and_namespace() {
        let attrs = json!({
            "id": 14,
            "name": "Amazon Web Services",
            "description": "",
            "kind": "cloud",
            "namespace": "aws",
            "created": "2020-01-08T10:22:59Z",
            "modified": "2020-01-08T10:22:59Z"
        });
        let new = project(attrs.as_object().unwrap()).unwrap();
        assert_eq!(new.source_ref, "14");
        assert_eq!(new.kind, "cloud");
        assert_eq!(new.namespace, "aws");
    }

    #[test]
    fn missing_namespace_is_reported() {
        let attrs = json!({
            "id": 14, "name": "n", "description": "", "kind": "cloud",
            "created": "2020-01-08T10:22:59Z", "modified": "2020-01-08T10:22:59Z"
        });
        let err = project(attrs.as_object().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "Missing Required Attribute namespace");
    }
}
