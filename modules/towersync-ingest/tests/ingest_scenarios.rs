//! End-to-end ingest scenarios: fabricated gzip-tar snapshots served over
//! HTTP, run against a real catalog database inside one transaction each.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are
//! skipped.

use std::collections::BTreeMap;

use axum::routing::get;
use axum::Router;
use prometheus::IntCounter;
use serde_json::{json, Value};
use sqlx::PgPool;

use towersync_ingest::{ingest_snapshot, IngestError, PageDispatcher};
use towersync_models::{
    RepoStats, ServiceCredential, ServiceOffering, ServiceOfferingNode, ServicePlan, SourceScope,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestDb {
    pool: PgPool,
    scope: SourceScope,
}

/// Connect and carve out a fresh tenant/source pair. Natural keys are scoped
/// by source, so concurrent tests stay isolated.
async fn setup() -> Option<TestDb> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    towersync_models::run_migrations(&pool).await.unwrap();

    let (tenant_id,): (i64,) = sqlx::query_as(
        "INSERT INTO tenants (name, external_tenant) VALUES ('test-tenant', '12345') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let (source_id,): (i64,) =
        sqlx::query_as("INSERT INTO sources (tenant_id, uid) VALUES ($1, 'test-uid') RETURNING id")
            .bind(tenant_id)
            .fetch_one(&pool)
            .await
            .unwrap();

    Some(TestDb {
        pool,
        scope: SourceScope {
            tenant_id,
            source_id,
        },
    })
}

/// Build a gzip-compressed tar with one regular file per entry.
fn snapshot(entries: &[(&str, Value)]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, page) in entries {
        let data = page.to_string().into_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Serve the archive bytes on an ephemeral port; returns the snapshot URL.
async fn serve_snapshot(bytes: Vec<u8>) -> String {
    let router = Router::new().route(
        "/snapshot.tar.gz",
        get(move || {
            let bytes = bytes.clone();
            async move { bytes }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/snapshot.tar.gz")
}

fn pages_counter() -> IntCounter {
    IntCounter::new("pages_processed_total", "entries dispatched").unwrap()
}

/// One full job: stream the archive, resolve links, archive the missing,
/// commit on success and roll back on error.
async fn run_ingest(
    db: &TestDb,
    archive: Vec<u8>,
) -> Result<BTreeMap<&'static str, RepoStats>, IngestError> {
    let url = serve_snapshot(archive).await;
    let client = reqwest::Client::new();
    let mut tx = db.pool.begin().await.unwrap();
    let mut dispatcher = PageDispatcher::new(db.scope);
    let pages = pages_counter();
    match ingest_snapshot(&client, &url, &mut tx, &mut dispatcher, &pages).await {
        Ok(()) => {
            let stats = dispatcher.stats();
            tx.commit().await.unwrap();
            Ok(stats)
        }
        Err(e) => {
            tx.rollback().await.unwrap();
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn list_page(results: Vec<Value>) -> Value {
    json!({
        "count": results.len(),
        "next": null,
        "previous": null,
        "results": results,
    })
}

fn inventory(id: u64, name: &str) -> Value {
    json!({
        "id": id,
        "type": "inventory",
        "name": name,
        "description": "d",
        "kind": "",
        "variables": "",
        "host_filter": "h",
        "pending_deletion": false,
        "organization": 1,
        "inventory_sources_with_failures": 0,
        "created": "2020-01-08T10:22:59Z",
        "modified": "2020-01-08T10:22:59Z",
    })
}

fn job_template(id: u64, name: &str, survey_enabled: bool, inventory_id: u64) -> Value {
    json!({
        "id": id,
        "type": "job_template",
        "name": name,
        "description": "d",
        "inventory": format!("/api/v2/inventories/{inventory_id}/"),
        "ask_inventory_on_launch": true,
        "ask_variables_on_launch": false,
        "survey_enabled": survey_enabled,
        "created": "2020-01-08T10:22:59Z",
        "modified": "2020-01-08T10:22:59Z",
    })
}

fn workflow_job_template(id: u64, name: &str) -> Value {
    json!({
        "id": id,
        "type": "workflow_job_template",
        "name": name,
        "description": "d",
        "ask_inventory_on_launch": false,
        "ask_variables_on_launch": false,
        "survey_enabled": false,
        "created": "2020-01-08T10:22:59Z",
        "modified": "2020-01-08T10:22:59Z",
    })
}

fn credential_type(id: u64) -> Value {
    json!({
        "id": id,
        "type": "credential_type",
        "name": "Machine",
        "description": "",
        "kind": "ssh",
        "namespace": "ssh",
        "created": "2020-01-08T10:22:59Z",
        "modified": "2020-01-08T10:22:59Z",
    })
}

fn credential(id: u64, type_id: u64, modified: &str) -> Value {
    json!({
        "id": id,
        "type": "credential",
        "name": "Demo Credential",
        "description": "",
        "credential_type": type_id,
        "created": "2020-01-08T10:22:59Z",
        "modified": modified,
    })
}

fn workflow_node(id: u64, root_id: u64, template_id: u64, job_type: &str) -> Value {
    json!({
        "id": id,
        "type": "workflow_job_template_node",
        "workflow_job_template": root_id,
        "unified_job_template": template_id,
        "unified_job_type": job_type,
        "created": "2020-01-08T10:22:59Z",
        "modified": "2020-01-08T10:22:59Z",
    })
}

fn survey_spec_page(extra_field: Option<Value>) -> Value {
    let mut fields = vec![json!({
        "question_name": "Age",
        "question_description": "Enter your age",
        "required": true,
        "type": "integer",
        "variable": "age",
        "min": 0,
        "max": 100,
        "default": 34,
        "choices": "",
    })];
    if let Some(field) = extra_field {
        fields.push(field);
    }
    json!({"name": "Survey", "description": "", "spec": fields})
}

// ---------------------------------------------------------------------------
// Row lookups
// ---------------------------------------------------------------------------

async fn live_offering(db: &TestDb, source_ref: &str) -> Option<ServiceOffering> {
    sqlx::query_as(
        "SELECT * FROM service_offerings
         WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
    )
    .bind(db.scope.source_id)
    .bind(source_ref)
    .fetch_optional(&db.pool)
    .await
    .unwrap()
}

async fn live_plan(db: &TestDb, source_ref: &str) -> Option<ServicePlan> {
    sqlx::query_as(
        "SELECT * FROM service_plans
         WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL",
    )
    .bind(db.scope.source_id)
    .bind(source_ref)
    .fetch_optional(&db.pool)
    .await
    .unwrap()
}

async fn live_row_id(db: &TestDb, table: &str, source_ref: &str) -> Option<i64> {
    let query = format!(
        "SELECT id FROM {table}
         WHERE source_id = $1 AND source_ref = $2 AND archived_at IS NULL"
    );
    sqlx::query_as::<_, (i64,)>(&query)
        .bind(db.scope.source_id)
        .bind(source_ref)
        .fetch_optional(&db.pool)
        .await
        .unwrap()
        .map(|(id,)| id)
}

async fn archived_count(db: &TestDb, table: &str) -> i64 {
    let query = format!(
        "SELECT count(*) FROM {table} WHERE source_id = $1 AND archived_at IS NOT NULL"
    );
    sqlx::query_as::<_, (i64,)>(&query)
        .bind(db.scope.source_id)
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .0
}

fn assert_stats(stats: &BTreeMap<&'static str, RepoStats>, kind: &str, expect: (u64, u64, u64)) {
    let got = stats
        .get(kind)
        .unwrap_or_else(|| panic!("no stats for {kind}"));
    assert_eq!(
        (got.adds, got.updates, got.deletes),
        expect,
        "stats for {kind}"
    );
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_snapshot_creates_everything() {
    let Some(db) = setup().await else { return };

    let archive = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", false, 1)]),
        ),
    ]);
    let stats = run_ingest(&db, archive).await.unwrap();

    assert_stats(&stats, "service_inventories", (1, 0, 0));
    assert_stats(&stats, "service_offerings", (1, 0, 0));

    let inventory_id = live_row_id(&db, "service_inventories", "1").await.unwrap();
    let offering = live_offering(&db, "73").await.unwrap();
    assert_eq!(offering.service_inventory_id, Some(inventory_id));
    assert_eq!(offering.name, "jt");
    let extra = offering.extra.unwrap();
    assert_eq!(extra["type"], json!("job_template"));
    assert_eq!(extra["survey_enabled"], json!(false));
}

#[tokio::test]
async fn second_identical_snapshot_is_idempotent() {
    let Some(db) = setup().await else { return };

    let entries = [
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", false, 1)]),
        ),
    ];
    run_ingest(&db, snapshot(&entries)).await.unwrap();
    let stats = run_ingest(&db, snapshot(&entries)).await.unwrap();

    // Inventories rewrite whenever present; the offering tuple is unchanged.
    assert_stats(&stats, "service_inventories", (0, 1, 0));
    assert_stats(&stats, "service_offerings", (0, 0, 0));

    // Natural-key uniqueness: still exactly one live row per ref.
    let (count,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM service_offerings WHERE source_id = $1 AND archived_at IS NULL",
    )
    .bind(db.scope.source_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(archived_count(&db, "service_offerings").await, 0);
    assert_eq!(archived_count(&db, "service_inventories").await, 0);
}

#[tokio::test]
async fn offering_dropping_its_survey_archives_the_plan() {
    let Some(db) = setup().await else { return };

    let first = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", true, 1)]),
        ),
        (
            "api/v2/job_templates/73/survey_spec/page1.json",
            survey_spec_page(None),
        ),
    ]);
    let stats = run_ingest(&db, first).await.unwrap();
    assert_stats(&stats, "service_plans", (1, 0, 0));

    // The plan is linked to its offering while the survey is declared.
    let offering_id = live_offering(&db, "73").await.unwrap().id;
    let plan = live_plan(&db, "73").await.unwrap();
    assert_eq!(plan.service_offering_id, Some(offering_id));
    let schema = plan.create_json_schema.unwrap();
    assert_eq!(schema["schemaType"], json!("default"));
    assert_eq!(schema["schema"]["fields"][0]["name"], json!("age"));

    let second = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", false, 1)]),
        ),
    ]);
    let stats = run_ingest(&db, second).await.unwrap();

    assert_stats(&stats, "service_offerings", (0, 1, 0));
    assert_stats(&stats, "service_plans", (0, 0, 1));
    assert!(live_plan(&db, "73").await.is_none());
    assert_eq!(archived_count(&db, "service_plans").await, 1);
}

#[tokio::test]
async fn absent_inventory_is_archived() {
    let Some(db) = setup().await else { return };

    let first = snapshot(&[(
        "api/v2/inventories/page1.json",
        list_page(vec![inventory(1, "one"), inventory(2, "two")]),
    )]);
    run_ingest(&db, first).await.unwrap();

    let second = snapshot(&[(
        "api/v2/inventories/page1.json",
        list_page(vec![inventory(1, "one")]),
    )]);
    let stats = run_ingest(&db, second).await.unwrap();

    assert_stats(&stats, "service_inventories", (0, 1, 1));
    assert!(live_row_id(&db, "service_inventories", "1").await.is_some());
    assert!(live_row_id(&db, "service_inventories", "2").await.is_none());
    assert_eq!(archived_count(&db, "service_inventories").await, 1);
}

#[tokio::test]
async fn node_with_unsupported_job_type_is_ignored() {
    let Some(db) = setup().await else { return };

    let archive = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/workflow_job_template_nodes/page1.json",
            list_page(vec![workflow_node(136, 96, 73, "inventory_update")]),
        ),
    ]);
    let stats = run_ingest(&db, archive).await.unwrap();

    assert_stats(&stats, "service_offering_nodes", (0, 0, 0));
    assert_stats(&stats, "service_inventories", (1, 0, 0));
    assert!(live_row_id(&db, "service_offering_nodes", "136").await.is_none());
}

#[tokio::test]
async fn survey_conversion_error_rolls_everything_back() {
    let Some(db) = setup().await else { return };

    let mystery = json!({
        "question_name": "Cost Factor",
        "required": true,
        "type": "mystery",
        "variable": "cost_factor",
        "min": null,
        "max": null,
        "default": "",
        "choices": "",
    });
    let archive = snapshot(&[
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", true, 1)]),
        ),
        (
            "api/v2/job_templates/73/survey_spec/page1.json",
            survey_spec_page(Some(mystery)),
        ),
    ]);

    let err = run_ingest(&db, archive).await.unwrap_err();
    assert!(
        err.to_string().contains("Unsupported field type mystery"),
        "{err}"
    );
    // Atomicity: the offering upserted before the failure is gone.
    assert!(live_offering(&db, "73").await.is_none());
}

#[tokio::test]
async fn deferred_links_resolve_in_any_order() {
    let Some(db) = setup().await else { return };

    // Referencing pages deliberately precede their referents.
    let archive = snapshot(&[
        (
            "api/v2/workflow_job_template_nodes/page1.json",
            list_page(vec![workflow_node(136, 96, 73, "job")]),
        ),
        (
            "api/v2/credentials/page1.json",
            list_page(vec![credential(37, 14, "2020-01-08T10:22:59Z")]),
        ),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", false, 1)]),
        ),
        (
            "api/v2/workflow_job_templates/page1.json",
            list_page(vec![workflow_job_template(96, "wf")]),
        ),
        (
            "api/v2/credential_types/page1.json",
            list_page(vec![credential_type(14)]),
        ),
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
    ]);
    let stats = run_ingest(&db, archive).await.unwrap();

    assert_stats(&stats, "service_offerings", (2, 0, 0));
    assert_stats(&stats, "service_credentials", (1, 0, 0));
    assert_stats(&stats, "service_credential_types", (1, 0, 0));
    assert_stats(&stats, "service_offering_nodes", (1, 0, 0));

    let type_id = live_row_id(&db, "service_credential_types", "14").await.unwrap();
    let credential: ServiceCredential = sqlx::query_as(
        "SELECT * FROM service_credentials
         WHERE source_id = $1 AND source_ref = '37' AND archived_at IS NULL",
    )
    .bind(db.scope.source_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(credential.service_credential_type_id, Some(type_id));

    let offering_id = live_offering(&db, "73").await.unwrap().id;
    let root_id = live_offering(&db, "96").await.unwrap().id;
    let node: ServiceOfferingNode = sqlx::query_as(
        "SELECT * FROM service_offering_nodes
         WHERE source_id = $1 AND source_ref = '136' AND archived_at IS NULL",
    )
    .bind(db.scope.source_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(node.service_offering_id, Some(offering_id));
    assert_eq!(node.root_service_offering_id, Some(root_id));
}

#[tokio::test]
async fn credential_updates_are_gated_on_modified_timestamp() {
    let Some(db) = setup().await else { return };

    // The referenced credential type rides along for the link phase.
    let archive = |modified: &str| {
        snapshot(&[
            (
                "api/v2/credential_types/page1.json",
                list_page(vec![credential_type(14)]),
            ),
            (
                "api/v2/credentials/page1.json",
                list_page(vec![credential(37, 14, modified)]),
            ),
        ])
    };

    run_ingest(&db, archive("2020-01-08T10:22:59Z")).await.unwrap();

    let unchanged = run_ingest(&db, archive("2020-01-08T10:22:59Z")).await.unwrap();
    assert_stats(&unchanged, "service_credentials", (0, 0, 0));

    let touched = run_ingest(&db, archive("2020-02-01T00:00:00Z")).await.unwrap();
    assert_stats(&touched, "service_credentials", (0, 1, 0));
}

#[tokio::test]
async fn id_only_index_pages_protect_rows_from_deletion() {
    let Some(db) = setup().await else { return };

    let first = snapshot(&[(
        "api/v2/inventories/page1.json",
        list_page(vec![inventory(1, "one"), inventory(2, "two")]),
    )]);
    run_ingest(&db, first).await.unwrap();

    // The second snapshot carries inventory 1 as a full object and inventory 2
    // only through the id index; both must survive deletion.
    let second = snapshot(&[
        (
            "api/v2/inventories/page1.json",
            list_page(vec![inventory(1, "one")]),
        ),
        (
            "api/v2/inventories/id/page1.json",
            list_page(vec![json!({"id": 2})]),
        ),
    ]);
    let stats = run_ingest(&db, second).await.unwrap();

    assert_stats(&stats, "service_inventories", (0, 1, 0));
    assert!(live_row_id(&db, "service_inventories", "2").await.is_some());
}

#[tokio::test]
async fn unknown_object_types_are_skipped_without_error() {
    let Some(db) = setup().await else { return };

    let archive = snapshot(&[(
        "api/v2/jobs/page1.json",
        list_page(vec![json!({
            "id": 500,
            "type": "job",
            "name": "a run",
        })]),
    )]);
    let stats = run_ingest(&db, archive).await.unwrap();
    for (_, s) in &stats {
        assert_eq!((s.adds, s.updates, s.deletes), (0, 0, 0));
    }
}

#[tokio::test]
async fn survey_flag_without_spec_page_is_logged_not_fatal() {
    let Some(db) = setup().await else { return };

    // The upstream can report survey_enabled=true yet ship no spec page.
    let archive = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", true, 1)]),
        ),
    ]);

    let stats = run_ingest(&db, archive).await.unwrap();
    assert_stats(&stats, "service_offerings", (1, 0, 0));
    assert_stats(&stats, "service_plans", (0, 0, 0));
    assert!(live_plan(&db, "73").await.is_none());
}

#[tokio::test]
async fn missing_link_referent_fails_the_job() {
    let Some(db) = setup().await else { return };

    // Offering references inventory 9 which the snapshot never delivers.
    let archive = snapshot(&[(
        "api/v2/job_templates/page1.json",
        list_page(vec![job_template(73, "jt", false, 9)]),
    )]);

    let err = run_ingest(&db, archive).await.unwrap_err();
    assert!(
        matches!(err, IngestError::MissingReferent { .. }),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains('9'));
    assert!(live_offering(&db, "73").await.is_none());
}

#[tokio::test]
async fn non_200_download_is_fatal_with_the_status() {
    let Some(db) = setup().await else { return };

    let url = serve_snapshot(Vec::new()).await.replace("snapshot.tar.gz", "missing");
    let client = reqwest::Client::new();
    let mut tx = db.pool.begin().await.unwrap();
    let mut dispatcher = PageDispatcher::new(db.scope);
    let pages = pages_counter();
    let err = ingest_snapshot(&client, &url, &mut tx, &mut dispatcher, &pages)
        .await
        .unwrap_err();
    tx.rollback().await.unwrap();

    assert_eq!(err.to_string(), "Download failed, HTTP status code 404 Not Found");
    assert_eq!(pages.get(), 0);
}

#[tokio::test]
async fn pages_counter_ticks_once_per_dispatched_entry() {
    let Some(db) = setup().await else { return };

    let archive = snapshot(&[
        ("api/v2/inventories/page1.json", list_page(vec![inventory(1, "inv")])),
        (
            "api/v2/job_templates/page1.json",
            list_page(vec![job_template(73, "jt", false, 1)]),
        ),
    ]);
    let url = serve_snapshot(archive).await;
    let client = reqwest::Client::new();
    let mut tx = db.pool.begin().await.unwrap();
    let mut dispatcher = PageDispatcher::new(db.scope);
    let pages = pages_counter();
    ingest_snapshot(&client, &url, &mut tx, &mut dispatcher, &pages)
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(pages.get(), 2);
}
