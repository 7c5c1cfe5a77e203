use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::base::{
    attr_bool, attr_i64, attr_ref, attr_str, attr_time, require_attrs, Attrs, RepoStats,
    SourceScope,
};
use crate::error::Result;

/// An inventory from the upstream controller.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceInventory {
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
}

/// What the dispatcher needs back from an inventory upsert.
#[derive(Debug, Clone)]
pub struct InventoryRecord {
    pub id: i64,
    pub source_ref: String,
}

const REQUIRED: &[&str] = &[
    "kind",
    "type",
    "variables",
    "host_filter",
    "pending_deletion",
    "organization",
    "inventory_sources_with_failures",
    "created",
    "modified",
    "name",
    "id",
    "description",
];

#[derive(Debug)]
struct NewInventory {
    source_ref: String,
    name: String,
    description: String,
    extra: Value,
    source_created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

fn project(attrs: &Attrs) -> Result<NewInventory> {
    require_attrs(attrs, REQUIRED)?;

    let mut extra = serde_json::Map::new();
    extra.insert("kind".into(), json!(attr_str(attrs, "kind")?));
    extra.insert("type".into(), json!(attr_str(attrs, "type")?));
    extra.insert("variables".into(), json!(attr_str(attrs, "variables")?));
    // host_filter is stored only when the upstream sent a string
    if let Some(Value::String(filter)) = attrs.get("host_filter") {
        extra.insert("host_filter".into(), json!(filter));
    }
    extra.insert(
        "pending_deletion".into(),
        json!(attr_bool(attrs, "pending_deletion")?),
    );
    extra.insert(
        "organization_id".into(),
        json!(attr_i64(attrs, "organization")?),
    );
    extra.insert(
        "inventory_sources_with_failures".into(),
        json!(attr_i64(attrs, "inventory_sources_with_failures")?),
    );

    Ok(NewInventory {
        source_ref: attr_ref(attrs, "id")?,
        name: attr_str(attrs, "name")?.to_string(),
        description: attr_str(attrs, "description")?.to_string(),
        extra: Value::Object(extra),
        source_created_at: attr_time(attrs, "created")?,
        source_updated_at: attr_time(attrs, "modified")?,
    })
}

#[derive(Debug, Default)]
pub struct InventoryRepository {
    stats: RepoStats,
}

impl InventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RepoStats {
        self.stats
    }

    /// Create or update an inventory from an upstream page object.
    /// Inventories carry no change gate: an existing row is always rewritten.
    pub async fn upsert_from_attributes(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        attrs: &Attrs,
    ) -> Result<InventoryRecord> {
        let new = project(attrs)?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM service_inventories
             WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
        )
        .bind(scope.source_id)
        .bind(&new.source_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let id = match existing {
            None => {
                debug!(source_ref = %new.source_ref, "Creating inventory");
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO service_inventories
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
            Some((id,)) => {
                debug!(source_ref = %new.source_ref, id, "Updating inventory");
                sqlx::query(
                    "UPDATE service_inventories
                     SET name = $2, description = $3, extra = $4,
                         source_updated_at = $5, last_seen_at = now(), updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&new.name)
                .bind(&new.description)
                .bind(&new.extra)
                .bind(new.source_updated_at)
                .execute(conn)
                .await?;
                self.stats.updates += 1;
                id
            }
        };

        Ok(InventoryRecord {
            id,
            source_ref: new.source_ref,
        })
    }

    /// Archive every live inventory of this source whose ref was not seen in
    /// the snapshot.
    pub async fn archive_missing(
        &mut self,
        conn: &mut PgConnection,
        scope: SourceScope,
        keep_refs: &[String],
    ) -> Result<()> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, source_ref FROM service_inventories
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
            info!(source_ref = %source_ref, id, "Archiving inventory missing from snapshot");
            sqlx::query(
                "UPDATE service_inventories SET archived_at = now(), updated_at = now()
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
