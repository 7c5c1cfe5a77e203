use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{
    attr_ref, attr_str, attr_time, require_attrs, Attrs, RepoStats, SourceScope,
};
use crate::error::Result;

/// A workflow node tying a workflow offering to the offerings it runs.
/// Both offering foreign keys stay null until the link phase.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceOfferingNode {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub source_ref: String,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub extra: Option<Value>,
    pub tenant_id: i64,
    pub source_id: i64,
    pub service_inventory_id: Option<i64>,
    pub service_offering_id: Option<i64>,
    pub root_service_offering_id: Option<i64>,
}

/// Upsert result carrying the staging refs for the node link pass.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: i64,
    pub source_ref: String,
    pub offering_source_ref: String,
    pub root_offering_source_ref: String,
    pub unified_job_type: String,
}

const REQUIRED: &[&str] = &[
    "id",
    "created",
    "modified",
    "workflow_job_template",
    "unified_job_template",
    "unified_job_type",
];

// The only node job types that map onto catalog offerings.
const SUPPORTED_JOB_TYPES: &[&str] = &["job", "workflow_job"];

#[derive(Debug)]
struct NewNode {
    source_ref: String,
    offering_source_ref: String,
    root_offering_source_ref: String,
    unified_job_type: String,
    extra: Value,
    source_created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

/// Project the page object, or `None` when the node's job type is one this
/// catalog does not model.
fn project(attrs: &Attrs) -> Result<Option<NewNode>> {
    require_attrs(attrs, REQUIRED)?;

    let unified_job_type = attr_str(attrs, "unified_job_type")?.to_string();
    if !SUPPORTED_JOB_TYPES.contains(&unified_job_type.as_str()) {
        return Ok(None);
    }

    Ok(Some(NewNode {
        source_ref: attr_ref(attrs, "id")?,
        offering_source_ref: attr_ref(attrs, "unified_job_template")?,
        root_offering_source_ref: attr_ref(attrs, "workflow_job_template")?,
        extra: json!({ "unified_job_type": unified_job_type }),
        unified_job_type,
        source_created_at: attr_time(attrs, "created")?,
        source_updated_at: attr_time(attrs, "modified")?,
    }))
}

#[derive(Debug, Default)]
pub struct NodeRepository {
    stats: RepoStats,
}

impl NodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update a workflow node. Returns `None` for nodes whose
    /// `unified_job_type` is outside the supported set; the caller skips
    /// those without error.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
    ) -> Result<Option<NodeRecord>> {
        let Some(new) = project(attrs)? else {
            return Ok(None);
        };

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM service_offering_nodes
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&new.source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %new.source_ref, "Creating workflow node");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_offering_nodes
                         (source_ref, source_created_at, source_updated_at, last_seen_at,
                          extra, tenant_id, source_id)
                     VALUES ($1, $2, $3, now(), $4, $5, $6)
                     RETURNING id",
                )
                .bind(&new.source_ref)
                .bind(new.source_created_at)
                .bind(new.source_updated_at)
                .bind(&new.extra)
                .bind(scope.tenant_id)
                .bind(scope.source_id)
                .fetch_one(conn)
                .await?;
                self.stats.adds += 1;
                id
            }
            Some((id,)) => {
                debug!(source_ref = %new.source_ref, id, "Updating workflow node");
                sqlx::query(
                    "UPDATE service_offering_nodes
                     SET extra = $2, source_updated_at = $3, last_seen_at = now(),
                         updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&new.extra)
                .bind(new.source_updated_at)
                .execute(conn)
                .await?;
                self.stats.updates += 1;
                id
            }
        };

        Ok(Some(NodeRecord {
            id,
            source_ref: new.source_ref,
            offering_source_ref: new.offering_source_ref,
            root_offering_source_ref: new.root_offering_source_ref,
            unified_job_type: new.unified_job_type,
        }))
    }

    pub async fn archive_missing(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        keep_refs: &[String],
    ) -> Result<()> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, source_ref FROM service_offering_nodes
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
            info!(source_ref = %source_ref, id, "Archiving workflow node missing from snapshot");
            sqlx::query(
                "UPDATE service_offering_nodes SET archived_at = now(), updated_at = now()
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
