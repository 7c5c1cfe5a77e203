// The link phase: after every page has been upserted, populate the foreign
// keys recorded as deferred source-ref maps. Archive entry order is not
// topologically sorted, so references are resolved only once everything is
// in the database. Runs inside the ingest transaction.

use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::dispatcher::PageDispatcher;
use crate::error::{IngestError, Result};

impl PageDispatcher {
    /// Resolve all deferred cross-entity references. Any missing referent is
    /// fatal for the job, except the known upstream inconsistency where an
    /// offering reports a survey but the snapshot carried no spec page.
    pub async fn resolve_links(&self, conn: &mut PgConnection) -> Result<()> {
        self.link_inventories(conn).await?;
        self.link_credential_types(conn).await?;
        self.link_surveys(conn).await?;
        self.link_nodes(conn).await
    }

    async fn link_inventories(&self, conn: &mut PgConnection) -> Result<()> {
        for (inventory_ref, offering_ids) in &self.links.inventory_offerings {
            let inventory_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_inventories
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    inventory_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "inventory",
                    entity: "service inventory",
                    source_ref: inventory_ref.clone(),
                })?;

            for offering_id in offering_ids {
                debug!(offering_id, inventory_id, "Linking offering to inventory");
                let updated = sqlx::query(
                    "UPDATE service_offerings
                     SET service_inventory_id = $2, updated_at = now()
                     WHERE id = $1",
                )
                .bind(offering_id)
                .bind(inventory_id)
                .execute(&mut *conn)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(IngestError::MissingReferent {
                        step: "inventory",
                        entity: "service offering",
                        source_ref: offering_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn link_credential_types(&self, conn: &mut PgConnection) -> Result<()> {
        for (type_ref, credential_ids) in &self.links.credential_type_credentials {
            let type_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_credential_types
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    type_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "credential type",
                    entity: "service credential type",
                    source_ref: type_ref.clone(),
                })?;

            for credential_id in credential_ids {
                debug!(credential_id, type_id, "Linking credential to its type");
                let updated = sqlx::query(
                    "UPDATE service_credentials
                     SET service_credential_type_id = $2, updated_at = now()
                     WHERE id = $1",
                )
                .bind(credential_id)
                .bind(type_id)
                .execute(&mut *conn)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(IngestError::MissingReferent {
                        step: "credential type",
                        entity: "service credential",
                        source_ref: credential_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// An offering and its survey plan share a source_ref by upstream
    /// convention.
    async fn link_surveys(&self, conn: &mut PgConnection) -> Result<()> {
        let refs = self
            .links
            .job_template_surveys
            .iter()
            .chain(&self.links.workflow_job_template_surveys);

        for source_ref in refs {
            let plan_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_plans
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    source_ref,
                )
                .await?;

            // The upstream keeps survey_enabled set even after its survey is
            // deleted, so the spec page may simply not exist. Leave things be.
            let Some(plan_id) = plan_id else {
                warn!(
                    source_ref = %source_ref,
                    "Offering declares a survey but the snapshot has no spec page, skipping"
                );
                continue;
            };

            let offering_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_offerings
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    source_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "survey",
                    entity: "service offering",
                    source_ref: source_ref.clone(),
                })?;

            debug!(plan_id, offering_id, "Linking survey plan to its offering");
            sqlx::query(
                "UPDATE service_plans SET service_offering_id = $2, updated_at = now()
                 WHERE id = $1",
            )
            .bind(plan_id)
            .bind(offering_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn link_nodes(&self, conn: &mut PgConnection) -> Result<()> {
        for node in &self.links.workflow_nodes {
            let node_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_offering_nodes
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    &node.source_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "node",
                    entity: "service offering node",
                    source_ref: node.source_ref.clone(),
                })?;

            let offering_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_offerings
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    &node.offering_source_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "node",
                    entity: "service offering",
                    source_ref: node.offering_source_ref.clone(),
                })?;

            let root_offering_id = self
                .find_id(
                    conn,
                    "SELECT id FROM service_offerings
                     WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
                    &node.root_offering_source_ref,
                )
                .await?
                .ok_or_else(|| IngestError::MissingReferent {
                    step: "node",
                    entity: "root service offering",
                    source_ref: node.root_offering_source_ref.clone(),
                })?;

            debug!(node_id, offering_id, root_offering_id, "Linking workflow node");
            sqlx::query(
                "UPDATE service_offering_nodes
                 SET service_offering_id = $2, root_service_offering_id = $3,
                     updated_at = now()
                 WHERE id = $1",
            )
            .bind(node_id)
            .bind(offering_id)
            .bind(root_offering_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn find_id(
        &self,
        conn: &mut PgConnection,
        query: &str,
        source_ref: &str,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(query)
            .bind(self.scope.source_id)
            .bind(source_ref)
            .fetch_optional(conn)
            .await?;
        Ok(row.map(|(id,)| id))
    }
}
