pub mod base;
pub mod error;
pub mod service_credential;
pub mod service_credential_type;
pub mod service_inventory;
pub mod service_offering;
pub mod service_offering_node;
pub mod service_plan;
pub mod source;
pub mod tenant;

pub use base::{tower_time, Attrs, RepoStats, SourceScope};
pub use error::{ModelError, Result};
pub use service_credential::{CredentialRecord, CredentialRepository, ServiceCredential};
pub use service_credential_type::{
    CredentialTypeRecord, CredentialTypeRepository, ServiceCredentialType,
};
pub use service_inventory::{InventoryRecord, InventoryRepository, ServiceInventory};
pub use service_offering::{OfferingRecord, OfferingRepository, ServiceOffering};
pub use service_offering_node::{NodeRecord, NodeRepository, ServiceOfferingNode};
pub use service_plan::{PlanRecord, PlanRepository, ServicePlan, SurveyConverter};
pub use source::{claim_for_refresh, find_source, finish_refresh, Source};
pub use tenant::{find_tenant, Tenant};

/// Run the embedded SQL migrations.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| ModelError::Database(e.into()))?;
    Ok(())
}
