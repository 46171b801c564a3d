//! End-to-end dataset method flows through a full instance.

use std::sync::Arc;

use almanac_auth::KeyPair;
use almanac_core::clock::Clock;
use almanac_core::config::Config;
use almanac_core::instance::Instance;
use almanac_core::methods::RawBytes;
use almanac_core::registry::SimRegistry;
use almanac_core::remote::SimRemote;
use chrono::TimeZone;
use serde_json::{json, Value};

fn fixture() -> (Instance, Arc<SimRegistry>, Arc<SimRemote>) {
    let mut config = Config::default();
    config.registry.location = Some("sim://registry".into());
    let registry = SimRegistry::new("sim://registry");
    let remote = SimRemote::new();
    let start = chrono::Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    let instance = Instance::builder(config)
        .with_keypair(KeyPair::test_fixture())
        .with_clock(Clock::ticking(start, 60))
        .with_registry(registry.clone())
        .with_remote(remote.clone())
        .open()
        .unwrap();
    (instance, registry, remote)
}

fn cities_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "array",
            "items": [
                {"title": "city", "type": "string"},
                {"title": "pop", "type": "integer"},
            ],
        },
    })
}

async fn save_rows(instance: &Instance, refstr: &str, rows: Value) -> Value {
    instance
        .dispatch(
            "dataset.save",
            json!({
                "ref": refstr,
                "dataset": {
                    "structure": {"format": "json", "schema": cities_schema()},
                    "body": rows,
                },
            }),
        )
        .await
        .unwrap()
        .value
}

#[tokio::test]
async fn save_assigns_a_version_path_and_commit() {
    let (instance, _, _) = fixture();
    let saved = save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;
    assert_eq!(saved["username"], "peer");
    assert_eq!(saved["name"], "test_cities");
    assert!(saved["path"].as_str().unwrap().starts_with("/store/"));
    assert_eq!(saved["commit"]["title"], "created dataset");

    let again = save_rows(
        &instance,
        "me/test_cities",
        json!([["toronto", 4000], ["osaka", 19000]]),
    )
    .await;
    assert_eq!(again["commit"]["title"], "updated dataset");
    assert_ne!(again["path"], saved["path"]);
}

#[tokio::test]
async fn saving_identical_content_twice_needs_force() {
    let (instance, _, _) = fixture();
    save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;

    let err = instance
        .dispatch(
            "dataset.save",
            json!({
                "ref": "me/test_cities",
                "dataset": {
                    "structure": {"format": "json", "schema": cities_schema()},
                    "body": [["toronto", 4000]],
                },
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no changes to save");

    // force allows the empty commit.
    instance
        .dispatch(
            "dataset.save",
            json!({
                "ref": "me/test_cities",
                "force": true,
                "dataset": {
                    "structure": {"format": "json", "schema": cities_schema()},
                    "body": [["toronto", 4000]],
                },
            }),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn private_save_keeps_its_error_string() {
    let (instance, _, _) = fixture();
    let err = instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/test_cities", "private": true}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "private datasets are not yet implemented");
}

#[tokio::test]
async fn apply_without_transform_is_rejected() {
    let (instance, _, _) = fixture();
    let err = instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/test_cities", "apply": true, "dataset": {"body": [[1]]}}),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot apply while saving without a transform"
    );
}

#[tokio::test]
async fn get_body_pagination() {
    let (instance, _, _) = fixture();
    let rows: Vec<Value> = (0..30).map(|i| json!([format!("city_{i}"), i])).collect();
    save_rows(&instance, "me/test_cities", Value::Array(rows.clone())).await;

    // Rows 11..=15.
    let page = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/test_cities", "selector": "body", "limit": 5, "offset": 10}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(page.as_array().unwrap().len(), 5);
    assert_eq!(page[0], rows[10]);
    assert_eq!(page[4], rows[14]);

    // all=true overrides invalid limit/offset.
    let all = instance
        .dispatch(
            "dataset.get",
            json!({
                "ref": "me/test_cities", "selector": "body",
                "limit": -5, "offset": -100, "all": true,
            }),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(all.as_array().unwrap().len(), 30);

    // Negatives without all are an error.
    let err = instance
        .dispatch(
            "dataset.get",
            json!({
                "ref": "me/test_cities", "selector": "body",
                "limit": -5, "offset": -100,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid limit / offset settings");
}

#[tokio::test]
async fn body_size_guard_limits_get_all() {
    let mut config = Config::default();
    config.limits.max_body_size_to_get_all = 160;
    let instance = Instance::builder(config)
        .with_keypair(KeyPair::test_fixture())
        .open()
        .unwrap();

    // `[["a…a"]]` with 211 a's serialises to exactly 217 bytes.
    let big = "a".repeat(211);
    instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/big", "dataset": {"body": [[big]]}}),
        )
        .await
        .unwrap();

    let err = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/big", "selector": "body", "all": true}),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "body is too large to get all: 217 larger than 160"
    );

    // Small bodies still work.
    instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/small", "dataset": {"body": [[1, 2]]}}),
        )
        .await
        .unwrap();
    let all = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/small", "selector": "body", "all": true}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(all, json!([[1, 2]]));
}

#[tokio::test]
async fn get_selector_navigates_the_tree() {
    let (instance, _, _) = fixture();
    instance
        .dispatch(
            "dataset.save",
            json!({
                "ref": "me/test_cities",
                "dataset": {"meta": {"title": "city data"}, "body": [[1]]},
            }),
        )
        .await
        .unwrap();

    let title = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/test_cities", "selector": "meta.title"}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(title, "city data");

    let err = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/test_cities", "selector": "meta..title"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid selector");

    let err = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/test_cities", "selector": "meta.nope"}),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn diff_same_ref_compares_with_previous_version() {
    let (instance, _, _) = fixture();
    save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;
    save_rows(
        &instance,
        "me/test_cities",
        json!([["toronto", 4000], ["osaka", 19000], ["lagos", 21000]]),
    )
    .await;

    let response = instance
        .dispatch(
            "dataset.diff",
            json!({"leftSide": "me/test_cities", "rightSide": "me/test_cities"}),
        )
        .await
        .unwrap()
        .value;
    let stat = &response["stat"];
    assert!(stat["leftNodes"].as_u64().unwrap() > 0);
    assert!(stat["rightNodes"].as_u64().unwrap() > 0);
    let churn = stat["inserts"].as_u64().unwrap() + stat["deletes"].as_u64().unwrap();
    assert!(churn > 0);

    let err = instance
        .dispatch("dataset.diff", json!({"leftSide": "me/test_cities"}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid parameters to diff");
}

#[tokio::test]
async fn diff_mode_mixing_is_rejected() {
    let (instance, _, _) = fixture();
    let err = instance
        .dispatch(
            "dataset.diff",
            json!({
                "leftSide": "me/a", "useLeftPrevVersion": true, "workingDir": "/tmp/x",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot use previous version and working directory"
    );

    let err = instance
        .dispatch(
            "dataset.diff",
            json!({"leftSide": "me/a", "rightSide": "me/b", "workingDir": "/tmp/x"}),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot use working directory when comparing two sources"
    );
}

#[tokio::test]
async fn remove_versions_and_whole_dataset() {
    let (instance, _, _) = fixture();
    save_rows(&instance, "me/test_cities", json!([[1]])).await;
    save_rows(&instance, "me/test_cities", json!([[1], [2]])).await;
    save_rows(&instance, "me/test_cities", json!([[1], [2], [3]])).await;

    // Drop one revision; the previous version becomes latest.
    let response = instance
        .dispatch(
            "dataset.remove",
            json!({"ref": "me/test_cities", "revisions": 1}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(response["numDeleted"], 1);
    let body = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/test_cities", "selector": "body"}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(body, json!([[1], [2]]));

    // Remove everything.
    let response = instance
        .dispatch(
            "dataset.remove",
            json!({"ref": "me/test_cities", "revisions": -1}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(response["numDeleted"], -1);
    let err = instance
        .dispatch("dataset.get", json!({"ref": "me/test_cities"}))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn component_removal_is_rejected() {
    let (instance, _, _) = fixture();
    let err = instance
        .dispatch(
            "dataset.remove",
            json!({"ref": "me/test_cities", "selector": "meta"}),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "can only remove whole dataset versions, not individual components"
    );
}

#[tokio::test]
async fn rename_validates_and_rejects_collisions() {
    let (instance, _, _) = fixture();
    save_rows(&instance, "me/old_name", json!([[1]])).await;
    save_rows(&instance, "me/taken", json!([[2]])).await;

    let err = instance
        .dispatch(
            "dataset.rename",
            json!({"current": "me/old_name", "next": "Bad Name"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), almanac_core::error::ErrorKind::Validation);

    let err = instance
        .dispatch(
            "dataset.rename",
            json!({"current": "me/old_name", "next": "taken"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), almanac_core::error::ErrorKind::Conflict);

    let renamed = instance
        .dispatch(
            "dataset.rename",
            json!({"current": "me/old_name", "next": "new_name"}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(renamed["name"], "new_name");

    let body = instance
        .dispatch(
            "dataset.get",
            json!({"ref": "me/new_name", "selector": "body"}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(body, json!([[1]]));
}

#[tokio::test]
async fn validate_reports_schema_issues() {
    let (instance, _, _) = fixture();
    save_rows(
        &instance,
        "me/test_cities",
        json!([["toronto", 4000], [12, "not a pop"]]),
    )
    .await;

    let report = instance
        .dispatch("dataset.validate", json!({"ref": "me/test_cities"}))
        .await
        .unwrap()
        .value;
    assert_eq!(report["valid"], false);
    assert_eq!(report["errors"].as_array().unwrap().len(), 2);

    let err = instance
        .dispatch("dataset.validate", json!({"bodyFile": "/tmp/body.json"}))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "must provide a dataset reference, or a body file and schema file"
    );
}

#[tokio::test]
async fn stats_summarise_columns() {
    let (instance, _, _) = fixture();
    save_rows(
        &instance,
        "me/test_cities",
        json!([["toronto", 4000], ["osaka", 19000]]),
    )
    .await;

    let stats = instance
        .dispatch("dataset.stats", json!({"ref": "me/test_cities"}))
        .await
        .unwrap()
        .value;
    assert_eq!(stats[0]["name"], "city");
    assert_eq!(stats[0]["distinct"], 2);
    assert_eq!(stats[1]["min"], 4000.0);
    assert_eq!(stats[1]["max"], 19000.0);
}

#[tokio::test]
async fn sql_exec_selects_filtered_rows() {
    let (instance, _, _) = fixture();
    save_rows(
        &instance,
        "me/test_cities",
        json!([["toronto", 4000], ["osaka", 19000], ["lagos", 21000]]),
    )
    .await;

    let outcome = instance
        .dispatch(
            "sql.exec",
            json!({"query": "SELECT city FROM me/test_cities WHERE pop > 10000 ORDER BY pop DESC"}),
        )
        .await
        .unwrap();
    let raw: RawBytes = serde_json::from_value(outcome.value).unwrap();
    assert_eq!(raw.content_type, "application/json");
    let rows: Value = serde_json::from_slice(&raw.body).unwrap();
    assert_eq!(rows, json!([{"city": "lagos"}, {"city": "osaka"}]));
}

#[tokio::test]
async fn get_csv_encodes_the_body_with_headers() {
    let (instance, _, _) = fixture();
    save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;

    let outcome = instance
        .dispatch("dataset.getcsv", json!({"ref": "me/test_cities"}))
        .await
        .unwrap();
    let raw: RawBytes = serde_json::from_value(outcome.value).unwrap();
    assert_eq!(raw.content_type, "text/csv");
    let text = String::from_utf8(raw.body).unwrap();
    assert_eq!(text, "city,pop\ntoronto,4000\n");
}

#[tokio::test]
async fn get_zip_contains_component_documents_and_the_pinned_ref() {
    let (instance, _, _) = fixture();
    instance
        .dispatch(
            "dataset.save",
            json!({
                "ref": "me/test_cities",
                "dataset": {
                    "meta": {"title": "cities"},
                    "structure": {"format": "json", "schema": cities_schema()},
                    "body": [["toronto", 4000]],
                },
            }),
        )
        .await
        .unwrap();

    let outcome = instance
        .dispatch("dataset.getzip", json!({"ref": "me/test_cities"}))
        .await
        .unwrap();
    let raw: RawBytes = serde_json::from_value(outcome.value).unwrap();
    assert_eq!(raw.content_type, "application/zip");

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(raw.body)).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    for expected in ["commit.json", "meta.json", "structure.json", "body.json", "ref.txt"] {
        assert!(names.contains(&expected.to_string()), "missing {expected}");
    }

    use std::io::Read as _;
    let mut pinned = String::new();
    archive
        .by_name("ref.txt")
        .unwrap()
        .read_to_string(&mut pinned)
        .unwrap();
    assert!(pinned.starts_with("peer/test_cities@/store/"));
}

#[tokio::test]
async fn save_from_a_csv_body_file() {
    let (instance, _, _) = fixture();
    let dir = tempfile::tempdir().unwrap();
    let body_path = dir.path().join("cities.csv");
    std::fs::write(&body_path, "city,pop\ntoronto,4000\nosaka,19000\n").unwrap();

    let saved = instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/test_cities", "bodyPath": body_path.to_str().unwrap()}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(saved["structure"]["format"], "csv");
    assert_eq!(saved["structure"]["entries"], 2);
    assert_eq!(saved["body"][0][0], "toronto");

    // Body format errors carry context.
    let bad_path = dir.path().join("broken.json");
    std::fs::write(&bad_path, "{not json").unwrap();
    let err = instance
        .dispatch(
            "dataset.save",
            json!({"ref": "me/other", "bodyPath": bad_path.to_str().unwrap()}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("body file:"));
}
