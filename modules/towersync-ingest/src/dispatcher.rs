// Routes one snapshot entry at a time: classify the page, upsert each object
// through the matching repository, and accumulate the deferred link data and
// kept-ref sets consumed after the whole archive has been read.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Number, Value};
use sqlx::PgConnection;
use tracing::{debug, info, warn};

use towersync_models::{
    Attrs, CredentialRepository, CredentialTypeRepository, InventoryRepository, NodeRecord,
    NodeRepository, OfferingRepository, PlanRepository, RepoStats, SourceScope,
};

use crate::error::{IngestError, Result};
use crate::spec_to_ddf::DdfConverter;

// api/v2/job_templates/10/survey_spec/page1.json, group 2 is the offering id
static SURVEY_SPEC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"api/v2/(job_templates|workflow_job_templates)/(.*)/survey_spec/page1\.json")
        .unwrap()
});

// First path segment after api/v2/ names the page's entity kind.
static PAGE_KIND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"api/v2/([^/]+)/").unwrap());

/// One job's repositories. Counters inside are owned by this job alone.
#[derive(Default)]
pub struct CatalogRepos {
    pub inventories: InventoryRepository,
    pub credentials: CredentialRepository,
    pub credential_types: CredentialTypeRepository,
    pub offerings: OfferingRepository,
    pub plans: PlanRepository,
    pub nodes: NodeRepository,
}

/// Cross-entity references resolved after the archive is fully consumed.
#[derive(Debug, Default)]
pub(crate) struct DeferredLinks {
    /// inventory source_ref → offerings (surrogate ids) that referenced it
    pub inventory_offerings: BTreeMap<String, Vec<i64>>,
    /// credential-type source_ref → credentials (surrogate ids)
    pub credential_type_credentials: BTreeMap<String, Vec<i64>>,
    /// offerings that declared a survey, split by offering type
    pub job_template_surveys: Vec<String>,
    pub workflow_job_template_surveys: Vec<String>,
    /// nodes whose offering links are pending
    pub workflow_nodes: Vec<NodeRecord>,
}

/// Ordered per-kind sets of every source_ref seen in this snapshot; drives
/// differential deletion.
#[derive(Debug, Default)]
pub(crate) struct KeptRefs {
    pub offerings: Vec<String>,
    pub inventories: Vec<String>,
    pub credentials: Vec<String>,
    pub credential_types: Vec<String>,
    pub nodes: Vec<String>,
}

impl KeptRefs {
    /// Append `id` to the set for `kind`. Returns false when the kind names
    /// no tracked set.
    fn record(&mut self, kind: &str, id: &str) -> bool {
        let set = match kind {
            "job_template" | "job_templates" | "workflow_job_template"
            | "workflow_job_templates" => &mut self.offerings,
            "inventory" | "inventories" => &mut self.inventories,
            "credential" | "credentials" => &mut self.credentials,
            "credential_type" | "credential_types" => &mut self.credential_types,
            "workflow_job_template_node" | "workflow_job_template_nodes" => &mut self.nodes,
            "survey_spec" => return true,
            _ => return false,
        };
        if !set.iter().any(|r| r == id) {
            set.push(id.to_string());
        }
        true
    }
}

pub struct PageDispatcher {
    pub(crate) scope: SourceScope,
    pub(crate) repos: CatalogRepos,
    pub(crate) links: DeferredLinks,
    pub(crate) kept: KeptRefs,
    converter: DdfConverter,
}

impl PageDispatcher {
    pub fn new(scope: SourceScope) -> Self {
        Self {
            scope,
            repos: CatalogRepos::default(),
            links: DeferredLinks::default(),
            kept: KeptRefs::default(),
            converter: DdfConverter,
        }
    }

    /// Handle one archive entry: its name (the originating upstream URL path)
    /// and its raw bytes.
    pub async fn process_page(
        &mut self,
        conn: &mut PgConnection,
        name: &str,
        body: &[u8],
    ) -> Result<()> {
        let kind = page_kind(name)?;

        // Survey specs have a different shape, carry no id of their own and
        // are never returned as a list; the raw body goes to the converter.
        if kind == "survey_spec" {
            return self.add_survey_spec(conn, name, body).await;
        }

        let page: Value = serde_json::from_slice(body).map_err(|e| IngestError::PageDecode {
            name: name.to_string(),
            source: e,
        })?;
        let Value::Object(page) = page else {
            return Err(IngestError::PageShape(name.to_string()));
        };

        if is_list(&page) {
            let id_index = name.contains("/id");
            if let Some(count) = page.get("count") {
                debug!(page = %name, count = %count, id_index, "Received object list");
            }
            let Some(Value::Array(results)) = page.get("results") else {
                return Ok(());
            };
            for obj in results {
                let Value::Object(obj) = obj else { continue };
                if id_index {
                    self.add_id(obj, &kind)?;
                } else {
                    self.add_object(conn, obj, name, &kind).await?;
                }
            }
            Ok(())
        } else {
            self.add_object(conn, &page, name, &kind).await
        }
    }

    /// Cumulative statistics keyed by entity kind, for the status callback.
    pub fn stats(&self) -> BTreeMap<&'static str, RepoStats> {
        BTreeMap::from([
            ("service_credentials", self.repos.credentials.stats()),
            (
                "service_credential_types",
                self.repos.credential_types.stats(),
            ),
            ("service_inventories", self.repos.inventories.stats()),
            ("service_offerings", self.repos.offerings.stats()),
            ("service_offering_nodes", self.repos.nodes.stats()),
            ("service_plans", self.repos.plans.stats()),
        ])
    }

    /// Log the per-entity counters after a completed job.
    pub fn log_report(&self) {
        for (kind, stats) in self.stats() {
            info!(
                kind,
                adds = stats.adds,
                updates = stats.updates,
                deletes = stats.deletes,
                "Snapshot changes"
            );
        }
    }

    async fn add_survey_spec(
        &mut self,
        conn: &mut PgConnection,
        name: &str,
        body: &[u8],
    ) -> Result<()> {
        let Some(offering_ref) = survey_offering_ref(name) else {
            return Err(IngestError::MissingObjectType(name.to_string()));
        };
        debug!(page = %name, offering_ref = %offering_ref, "Received survey spec");

        // The spec page has no id field; it borrows the owning offering's.
        let mut attrs = Attrs::new();
        attrs.insert("id".into(), ref_value(&offering_ref));
        attrs.insert("type".into(), Value::String("survey_spec".into()));
        attrs.insert("name".into(), Value::String(String::new()));
        attrs.insert("description".into(), Value::String(String::new()));

        self.repos
            .plans
            .upsert_from_attributes(conn, self.scope, &attrs, &self.converter, body)
            .await?;
        Ok(())
    }

    /// Record an id-only index entry. Unknown kinds are a hard error here:
    /// they mean the page name parse went wrong.
    fn add_id(&mut self, obj: &Attrs, kind: &str) -> Result<()> {
        let id = object_ref(obj, kind)?;
        if !self.kept.record(kind, &id) {
            return Err(IngestError::InvalidObjectType(kind.to_string()));
        }
        Ok(())
    }

    async fn add_object(
        &mut self,
        conn: &mut PgConnection,
        obj: &Attrs,
        page_name: &str,
        page_kind: &str,
    ) -> Result<()> {
        let Some(obj_type) = obj.get("type").and_then(Value::as_str).map(str::to_string)
        else {
            return Err(IngestError::MissingObjectType(page_name.to_string()));
        };
        let source_ref = object_ref(obj, &obj_type)?;
        debug!(object_type = %obj_type, source_ref = %source_ref, "Processing object");

        match obj_type.as_str() {
            "job_template" | "workflow_job_template" => {
                let record = self
                    .repos
                    .offerings
                    .upsert_from_attributes(conn, self.scope, obj, &mut self.repos.plans)
                    .await?;

                if record.survey_enabled {
                    debug!(source_ref = %record.source_ref, "Offering has a survey");
                    if obj_type == "job_template" {
                        self.links.job_template_surveys.push(record.source_ref.clone());
                    } else {
                        self.links
                            .workflow_job_template_surveys
                            .push(record.source_ref.clone());
                    }
                }

                if let Some(inventory_ref) = &record.inventory_source_ref {
                    self.links
                        .inventory_offerings
                        .entry(inventory_ref.clone())
                        .or_default()
                        .push(record.id);
                }
            }
            "inventory" => {
                self.repos
                    .inventories
                    .upsert_from_attributes(conn, self.scope, obj)
                    .await?;
            }
            "workflow_job_template_node" => {
                let Some(record) = self
                    .repos
                    .nodes
                    .upsert_from_attributes(conn, self.scope, obj)
                    .await?
                else {
                    debug!(source_ref = %source_ref, "Ignoring node with unsupported job type");
                    return Ok(());
                };
                self.links.workflow_nodes.push(record);
            }
            "credential" => {
                let record = self
                    .repos
                    .credentials
                    .upsert_from_attributes(conn, self.scope, obj)
                    .await?;
                if !record.credential_type_source_ref.is_empty() {
                    self.links
                        .credential_type_credentials
                        .entry(record.credential_type_source_ref.clone())
                        .or_default()
                        .push(record.id);
                }
            }
            "credential_type" => {
                self.repos
                    .credential_types
                    .upsert_from_attributes(conn, self.scope, obj)
                    .await?;
            }
            other => {
                // Not a catalog entity. Keep its id if the page tracks one of
                // the kept sets so deletion still sees the full snapshot.
                warn!(object_type = %other, source_ref = %source_ref, "Skipping unknown object type");
                self.kept.record(page_kind, &source_ref);
                return Ok(());
            }
        }

        self.kept.record(&obj_type, &source_ref);
        Ok(())
    }
}

/// The entity kind a page describes, from its path within the archive.
pub(crate) fn page_kind(name: &str) -> Result<String> {
    if name.ends_with("survey_spec/page1.json") {
        return Ok("survey_spec".to_string());
    }
    PAGE_KIND_RE
        .captures(name)
        .map(|c| c[1].to_string())
        .ok_or_else(|| IngestError::UnknownPageKind(name.to_string()))
}

/// The owning offering's id from a survey-spec page path.
pub(crate) fn survey_offering_ref(name: &str) -> Option<String> {
    SURVEY_SPEC_RE.captures(name).map(|c| c[2].to_string())
}

/// A page is a list iff it has all four pagination keys.
pub(crate) fn is_list(page: &Attrs) -> bool {
    ["results", "count", "next", "previous"]
        .iter()
        .all(|k| page.contains_key(*k))
}

fn object_ref(obj: &Attrs, obj_type: &str) -> Result<String> {
    match obj.get("id") {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(IngestError::MissingObjectId(obj_type.to_string())),
    }
}

fn ref_value(source_ref: &str) -> Value {
    match source_ref.parse::<Number>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::String(source_ref.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_kind_is_first_segment_after_api_v2() {
        assert_eq!(page_kind("api/v2/job_templates/page1.json").unwrap(), "job_templates");
        assert_eq!(page_kind("api/v2/job_templates/id/page1.json").unwrap(), "job_templates");
        assert_eq!(
            page_kind("api/v2/workflow_job_template_nodes/page1.json").unwrap(),
            "workflow_job_template_nodes"
        );
        assert_eq!(
            page_kind("api/v2/job_templates/73/survey_spec/page1.json").unwrap(),
            "survey_spec"
        );
        assert!(matches!(
            page_kind("not/a/tower/page.json"),
            Err(IngestError::UnknownPageKind(_))
        ));
    }

    #[test]
    fn survey_path_yields_owning_offering() {
        assert_eq!(
            survey_offering_ref("api/v2/job_templates/73/survey_spec/page1.json").as_deref(),
            Some("73")
        );
        assert_eq!(
            survey_offering_ref("api/v2/workflow_job_templates/96/survey_spec/page1.json")
                .as_deref(),
            Some("96")
        );
        assert_eq!(survey_offering_ref("api/v2/job_templates/page1.json"), None);
    }

    #[test]
    fn list_requires_all_four_pagination_keys() {
        let full = json!({"results": [], "count": 0, "next": null, "previous": null});
        assert!(is_list(full.as_object().unwrap()));

        let partial = json!({"results": [], "count": 0});
        assert!(!is_list(partial.as_object().unwrap()));
    }

    #[test]
    fn kept_refs_deduplicate_and_unify_offering_kinds() {
        let mut kept = KeptRefs::default();
        assert!(kept.record("job_template", "1"));
        assert!(kept.record("job_templates", "1"));
        assert!(kept.record("workflow_job_template", "2"));
        assert_eq!(kept.offerings, vec!["1", "2"]);

        assert!(kept.record("inventories", "5"));
        assert!(kept.record("inventory", "5"));
        assert_eq!(kept.inventories, vec!["5"]);

        assert!(kept.record("survey_spec", "9"));
        assert!(!kept.record("job", "9"));
    }

    #[test]
    fn id_index_with_invalid_kind_is_fatal() {
        let scope = SourceScope {
            tenant_id: 1,
            source_id: 1,
        };
        let mut dispatcher = PageDispatcher::new(scope);
        let obj = json!({"id": 5});
        let err = dispatcher
            .add_id(obj.as_object().unwrap(), "mystery_kind")
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid object type found mystery_kind");
    }

    #[test]
    fn object_refs_keep_precision() {
        let obj: Attrs =
            serde_json::from_str(r#"{"id": 88888888888888888888888}"#).unwrap();
        assert_eq!(object_ref(&obj, "credential").unwrap(), "88888888888888888888888");
    }
}
