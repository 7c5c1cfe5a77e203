// The differential-delete phase: rows whose source_ref was not seen in this
// snapshot are archived. Offerings go first so the survey cascade onto plans
// runs while the set of live offerings is still authoritative.

use sqlx::PgConnection;
use tracing::debug;

use crate::dispatcher::PageDispatcher;
use crate::error::Result;

impl PageDispatcher {
    /// Archive everything the snapshot no longer mentions, one kind at a
    /// time. Kinds whose kept-ref set is empty are left untouched.
    pub async fn archive_missing(&mut self, conn: &mut PgConnection) -> Result<()> {
        if !self.kept.offerings.is_empty() {
            debug!(kept = self.kept.offerings.len(), "Archiving stale offerings");
            self.repos
                .offerings
                .archive_missing(conn, self.scope, &self.kept.offerings, &mut self.repos.plans)
                .await?;
        }

        if !self.kept.nodes.is_empty() {
            debug!(kept = self.kept.nodes.len(), "Archiving stale workflow nodes");
            self.repos
                .nodes
                .archive_missing(conn, self.scope, &self.kept.nodes)
                .await?;
        }

        if !self.kept.inventories.is_empty() {
            debug!(kept = self.kept.inventories.len(), "Archiving stale inventories");
            self.repos
                .inventories
                .archive_missing(conn, self.scope, &self.kept.inventories)
                .await?;
        }

        if !self.kept.credentials.is_empty() {
            debug!(kept = self.kept.credentials.len(), "Archiving stale credentials");
            self.repos
                .credentials
                .archive_missing(conn, self.scope, &self.kept.credentials)
                .await?;
        }

        if !self.kept.credential_types.is_empty() {
            debug!(
                kept = self.kept.credential_types.len(),
                "Archiving stale credential types"
            );
            self.repos
                .credential_types
                .archive_missing(conn, self.scope, &self.kept.credential_types)
                .await?;
        }

        Ok(())
    }
}
