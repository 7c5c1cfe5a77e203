use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{attr_ref, attr_str, require_attrs, Attrs, RepoStats, SourceScope};
use crate::error::Result;

/// Seam for the survey-spec conversion. The ingest pipeline supplies the
/// implementation; the repository only cares that raw survey bytes become a
/// stored form-schema document.
pub trait SurveyConverter: Send + Sync {
    fn convert(&self, spec: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// The stored form schema of an offering's survey. Shares its `source_ref`
/// with the owning offering; the foreign key is set in the link phase.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServicePlan {
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
    pub create_json_schema: Option<Value>,
    pub update_json_schema: Option<Value>,
    pub tenant_id: i64,
    pub source_id: i64,
    pub service_offering_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub id: i64,
    pub source_ref: String,
}

const REQUIRED: &[&str] = &["name", "description"];

#[derive(Debug, Default)]
pub struct PlanRepository {
    stats: RepoStats,
}

impl PlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update a plan from a survey-spec entry. The raw body is
    /// converted to the form-schema document before anything is written.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
        converter: &dyn SurveyConverter,
        body: &[u8],
    ) -> Result<PlanRecord> {
        require_attrs(attrs, REQUIRED)?;
        let source_ref = attr_ref(attrs, "id")?;
        let name = attr_str(attrs, "name")?.to_string();
        let description = attr_str(attrs, "description")?.to_string();

        let schema = converter.convert(body)?;
        let schema: Value = serde_json::from_slice(&schema)
            .map_err(|e| anyhow::anyhow!("Converted survey schema is not valid JSON: {e}"))?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM service_plans
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %source_ref, "Creating survey plan");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_plans
                         (source_ref, last_seen_at, name, description, create_json_schema,
                          tenant_id, source_id)
                     VALUES ($1, now(), $2, $3, $4, $5, $6)
                     RETURNING id",
                )
                .bind(&source_ref)
                .bind(&name)
                .bind(&description)
                .bind(&schema)
                .bind(scope.tenant_id)
                .bind(scope.source_id)
                .fetch_one(conn)
                .await?;
                self.stats.adds += 1;
                id
            }
            Some((id,)) => {
                debug!(source_ref = %source_ref, id, "Updating survey plan");
                sqlx::query(
                    "UPDATE service_plans
                     SET name = $2, description = $3, create_json_schema = $4,
                         last_seen_at = now(), updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&name)
                .bind(&description)
                .bind(&schema)
                .execute(conn)
                .await?;
                self.stats.updates += 1;
                id
            }
        };

        Ok(PlanRecord { id, source_ref })
    }

    /// Archive the plan with the given natural key, if one is live. Used by
    /// the offering repository when a survey is disabled or its offering is
    /// archived. A missing plan is not an error.
    pub async fn archive(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        source_ref: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE service_plans SET archived_at = now(), updated_at = now()
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(source_ref)
        .execute(conn)
        .await?;

        if result.rows_affected() > 0 {
            info!(source_ref = %source_ref, "Archived survey plan");
            self.stats.deletes += 1;
        } else {
            debug!(source_ref = %source_ref, "No live survey plan to archive");
        }
        Ok(())
    }
}
