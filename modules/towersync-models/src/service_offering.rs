use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{
    attr_bool, attr_ref, attr_str, attr_time, inventory_source_ref, require_attrs, Attrs,
    RepoStats, SourceScope,
};
use crate::error::Result;
use crate::service_plan::PlanRepository;

/// A job template or workflow job template from the upstream controller.
/// The inventory foreign key stays null until the link phase resolves the
/// staging `inventory_source_ref`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceOffering {
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
    pub extra: Option<Value>,
    pub tenant_id: i64,
    pub source_id: i64,
    pub service_inventory_id: Option<i64>,
    pub service_offering_icon_id: Option<i64>,
}

/// Upsert result carrying the staging refs for the deferred link maps.
#[derive(Debug, Clone)]
pub struct OfferingRecord {
    pub id: i64,
    pub source_ref: String,
    pub survey_enabled: bool,
    pub inventory_source_ref: Option<String>,
}

const REQUIRED: &[&str] = &[
    "name",
    "ask_inventory_on_launch",
    "ask_variables_on_launch",
    "survey_enabled",
    "type",
    "created",
    "modified",
    "id",
    "description",
];

// Optional launch flags carried verbatim into the extra column.
const OPTIONAL_FLAGS: &[&str] = &[
    "ask_credential_on_launch",
    "ask_tags_on_launch",
    "ask_diff_mode_on_launch",
    "ask_skip_tags_on_launch",
    "ask_job_type_on_launch",
    "ask_limit_on_launch",
    "ask_verbosity_on_launch",
];

#[derive(Debug)]
struct NewOffering {
    source_ref: String,
    name: String,
    description: String,
    extra: Value,
    survey_enabled: bool,
    inventory_source_ref: Option<String>,
    source_created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

fn project(attrs: &Attrs) -> Result<NewOffering> {
    require_attrs(attrs, REQUIRED)?;

    let survey_enabled = attr_bool(attrs, "survey_enabled")?;

    let mut extra = serde_json::Map::new();
    for flag in OPTIONAL_FLAGS {
        if let Some(value) = attrs.get(*flag) {
            extra.insert(flag.to_string(), value.clone());
        }
    }
    extra.insert(
        "ask_inventory_on_launch".into(),
        Value::Bool(attr_bool(attrs, "ask_inventory_on_launch")?),
    );
    extra.insert("survey_enabled".into(), Value::Bool(survey_enabled));
    extra.insert(
        "ask_variables_on_launch".into(),
        Value::Bool(attr_bool(attrs, "ask_variables_on_launch")?),
    );
    extra.insert(
        "type".into(),
        Value::String(attr_str(attrs, "type")?.to_string()),
    );

    Ok(NewOffering {
        source_ref: attr_ref(attrs, "id")?,
        name: attr_str(attrs, "name")?.to_string(),
        description: attr_str(attrs, "description")?.to_string(),
        extra: Value::Object(extra),
        survey_enabled,
        inventory_source_ref: inventory_source_ref(attrs),
        source_created_at: attr_time(attrs, "created")?,
        source_updated_at: attr_time(attrs, "modified")?,
    })
}

fn stored_survey_enabled(extra: &Value) -> bool {
    extra
        .get("survey_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[derive(Debug, Default)]
pub struct OfferingRepository {
    stats: RepoStats,
}

impl OfferingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update an offering. An existing row is rewritten only when
    /// the (name, description, linked inventory ref, survey_enabled) tuple
    /// changed. A survey_enabled true→false transition archives the
    /// associated plan before the offering row is saved, so "a plan exists
    /// only while its offering declares a survey" holds at commit.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
        plans: &mut PlanRepository,
    ) -> Result<OfferingRecord> {
        let new = project(attrs)?;

        let existing: Option<(i64, String, String, Value, Option<String>)> = sqlx::query_as(
            "SELECT o.id, o.name, o.description, COALESCE(o.extra, '{}'::jsonb), i.source_ref
             FROM service_offerings o
             LEFT JOIN service_inventories i
                 ON i.id = o.service_inventory_id AND i.archived_at IS NULL
             WHERE o.source_id = $1 AND o.source_ref = $2 AND o.archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&new.source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %new.source_ref, "Creating offering");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_offerings
                         (source_ref, source_created_at, source_updated_at, last_seen_at,
                          name, description, extra, tenant_id, source_id)
                     VALUES ($1, $2, $3, now(), $4, $5, $6, $7, $8)
                     RETURNING id",
                )
                .bind(&new.source_ref)
                .bind(new.source_created_at)
                .bind(new.source_updated_at)
                .bind(&new.name)
                .bind(&new.description)
                .bind(&new.extra)
                .bind(scope.tenant_id)
                .bind(scope.source_id)
                .fetch_one(conn)
                .await?;
                self.stats.adds += 1;
                id
            }
            Some((id, name, description, extra, linked_inventory_ref)) => {
                let stored_survey = stored_survey_enabled(&extra);
                let unchanged = name == new.name
                    && description == new.description
                    && linked_inventory_ref == new.inventory_source_ref
                    && stored_survey == new.survey_enabled;

                if unchanged {
                    debug!(source_ref = %new.source_ref, "Offering is in sync");
                } else {
                    if stored_survey && !new.survey_enabled {
                        info!(source_ref = %new.source_ref, "Survey disabled, archiving its plan");
                        plans.archive(&mut *conn, scope, &new.source_ref).await?;
                    }
                    debug!(source_ref = %new.source_ref, id, "Updating offering");
                    sqlx::query(
                        "UPDATE service_offerings
                         SET name = $2, description = $3, extra = $4,
                             source_updated_at = $5, last_seen_at = now(), updated_at = now()
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(&new.name)
                    .bind(&new.description)
                    .bind(&new.extra)
                    .bind(new.source_updated_at)
                    .execute(&mut *conn)
                    .await?;
                    self.stats.updates += 1;
                }
                id
            }
        };

        Ok(OfferingRecord {
            id,
            source_ref: new.source_ref,
            survey_enabled: new.survey_enabled,
            inventory_source_ref: new.inventory_source_ref,
        })
    }

    /// Archive every live offering of this source whose ref was not seen in
    /// the snapshot. Archiving an offering whose stored extra declares a
    /// survey also archives the plan sharing its source_ref.
    pub async fn archive_missing(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        keep_refs: &[String],
        plans: &mut PlanRepository,
    ) -> Result<()> {
        let rows: Vec<(i64, String, Value)> = sqlx::query_as(
            "SELECT id, source_ref, COALESCE(extra, '{}'::jsonb) FROM service_offerings
             WHERE source_id = $1 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .fetch_all(&mut *conn)
        .await?;

        let keep: HashSet<&str> = keep_refs.iter().map(String::as_str).collect();
        for (id, source_ref, extra) in rows {
            if keep.contains(source_ref.as_str()) {
                continue;
            }
            info!(source_ref = %source_ref, id, "Archiving offering missing from snapshot");
            sqlx::query(
                "UPDATE service_offerings SET archived_at = now(), updated_at = now()
                 WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *conn)
            .await?;
            self.stats.deletes += 1;

            if stored_survey_enabled(&extra) {
                plans.archive(&mut *conn, scope, &source_ref).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_attrs() -> Attrs {
        json!({
            "id": 73,
            "type": "job_template",
            "name": "Demo Template",
            "description": "d",
            "inventory": "/api/v2/inventories/1/",
            "ask_inventory_on_launch": true,
            "ask_variables_on_launch": false,
            "survey_enabled": true,
            "ask_limit_on_launch": false,
            "created": "2020-01-08T10:22:59Z",
            "modified": "2020-01-09T10:22:59Z"
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn projects_extra_and_staging_refs() {
        let new = project(&valid_attrs()).unwrap();
        assert_eq!(new.source_ref, "73");
        assert!(new.survey_enabled);
        assert_eq!(new.inventory_source_ref.as_deref(), Some("1"));
        assert_eq!(new.extra["type"], json!("job_template"));
        assert_eq!(new.extra["ask_inventory_on_launch"], json!(true));
        assert_eq!(new.extra["survey_enabled"], json!(true));
        // optional flag carried, absent ones left out
        assert_eq!(new.extra["ask_limit_on_launch"], json!(false));
        assert!(new.extra.get("ask_tags_on_launch").is_none());
    }

    #[test]
    fn missing_inventory_attribute_is_not_required() {
        let mut attrs = valid_attrs();
        attrs.remove("inventory");
        let new = project(&attrs).unwrap();
        assert_eq!(new.inventory_source_ref, None);
    }

    #[test]
    fn each_required_attribute_is_enforced() {
        for missing in REQUIRED {
            let mut attrs = valid_attrs();
            attrs.remove(*missing);
            let err = project(&attrs).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Missing Required Attribute {missing}")
            );
        }
    }

    #[test]
    fn stored_survey_flag_defaults_to_false() {
        assert!(!stored_survey_enabled(&json!({})));
        assert!(!stored_survey_enabled(&json!({"survey_enabled": null})));
        assert!(stored_survey_enabled(&json!({"survey_enabled": true})));
    }
}
