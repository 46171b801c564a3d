//! Filesystem workspace flows: init (with rollback), checkout, write,
//! status.

use almanac_auth::KeyPair;
use almanac_core::config::Config;
use almanac_core::fsi::{ComponentStatus, StatusItem};
use almanac_core::instance::Instance;
use serde_json::{json, Value};

fn instance() -> Instance {
    Instance::builder(Config::default())
        .with_keypair(KeyPair::test_fixture())
        .open()
        .unwrap()
}

async fn save_rows(instance: &Instance, refstr: &str, rows: Value) {
    instance
        .dispatch(
            "dataset.save",
            json!({"ref": refstr, "dataset": {"body": rows}}),
        )
        .await
        .unwrap();
}

fn status_of(items: &[StatusItem], component: &str) -> Option<ComponentStatus> {
    items
        .iter()
        .find(|item| item.component == component)
        .map(|item| item.status)
}

#[tokio::test]
async fn init_creates_a_linked_workspace() {
    let instance = instance();
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("cities");

    let created = instance
        .dispatch(
            "fsi.init",
            json!({"name": "cities", "targetDir": target.to_str().unwrap()}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(created["username"], "peer");
    assert_eq!(created["name"], "cities");

    assert!(target.join(".almanac-ref").exists());
    assert!(target.join("body.csv").exists());
    assert!(target.join("meta.json").exists());
    assert_eq!(
        std::fs::read_to_string(target.join(".almanac-ref")).unwrap().trim(),
        "peer/cities"
    );
}

#[tokio::test]
async fn init_rolls_back_directories_it_created() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([[1]])).await;

    let root = tempfile::tempdir().unwrap();
    let pre_existing = root.path().join("path");
    std::fs::create_dir(&pre_existing).unwrap();
    let target = pre_existing.join("to").join("dataset");

    // The ref already has a log, so init must fail and remove exactly the
    // directories it created.
    let err = instance
        .dispatch(
            "fsi.init",
            json!({"name": "test_cities", "targetDir": target.to_str().unwrap()}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), almanac_core::error::ErrorKind::Conflict);
    assert!(!pre_existing.join("to").exists());
    assert!(pre_existing.exists());
}

#[tokio::test]
async fn init_validates_name_and_format() {
    let instance = instance();
    let err = instance
        .dispatch("fsi.init", json!({"name": "Bad Name", "targetDir": "/tmp/x"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), almanac_core::error::ErrorKind::Validation);

    let err = instance
        .dispatch(
            "fsi.init",
            json!({"name": "ok_name", "targetDir": "/tmp/x", "format": "parquet"}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported workspace format"));
}

#[tokio::test]
async fn checkout_requires_an_absolute_dir() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([[1]])).await;
    let err = instance
        .dispatch(
            "fsi.checkout",
            json!({"ref": "me/test_cities", "dir": "relative/dir"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "checkout directory must be absolute");
}

#[tokio::test]
async fn checkout_then_status_tracks_edits() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("work");
    instance
        .dispatch(
            "fsi.checkout",
            json!({"ref": "me/test_cities", "dir": dir.to_str().unwrap()}),
        )
        .await
        .unwrap();

    // Untouched checkout: everything unmodified.
    let items: Vec<StatusItem> = serde_json::from_value(
        instance
            .dispatch("fsi.status", json!({"ref": "me/test_cities"}))
            .await
            .unwrap()
            .value,
    )
    .unwrap();
    assert!(items
        .iter()
        .all(|item| item.status == ComponentStatus::Unmodified));

    // Edit the body on disk, add a readme.
    std::fs::write(dir.join("body.json"), "[[\"lagos\", 21000]]").unwrap();
    std::fs::write(dir.join("readme.md"), "# cities\n").unwrap();

    let items: Vec<StatusItem> = serde_json::from_value(
        instance
            .dispatch(
                "fsi.status",
                json!({"ref": dir.to_str().unwrap()}),
            )
            .await
            .unwrap()
            .value,
    )
    .unwrap();
    assert_eq!(status_of(&items, "body"), Some(ComponentStatus::Modified));
    assert_eq!(status_of(&items, "readme"), Some(ComponentStatus::Add));
}

#[tokio::test]
async fn write_merges_components_into_the_workspace() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([["toronto", 4000]])).await;

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("work");
    instance
        .dispatch(
            "fsi.checkout",
            json!({"ref": "me/test_cities", "dir": dir.to_str().unwrap()}),
        )
        .await
        .unwrap();

    let items: Vec<StatusItem> = serde_json::from_value(
        instance
            .dispatch(
                "fsi.write",
                json!({
                    "ref": "me/test_cities",
                    "dataset": {"meta": {"title": "city dataset"}},
                }),
            )
            .await
            .unwrap()
            .value,
    )
    .unwrap();
    assert_eq!(status_of(&items, "meta"), Some(ComponentStatus::Add));
    let meta = std::fs::read_to_string(dir.join("meta.json")).unwrap();
    assert!(meta.contains("city dataset"));
}

#[tokio::test]
async fn write_requires_a_link() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([[1]])).await;
    let err = instance
        .dispatch(
            "fsi.write",
            json!({"ref": "me/test_cities", "dataset": {"meta": {"title": "x"}}}),
        )
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("not linked to a working directory"));
}

#[tokio::test]
async fn remove_unlinks_the_workspace() {
    let instance = instance();
    save_rows(&instance, "me/test_cities", json!([[1]])).await;

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("work");
    instance
        .dispatch(
            "fsi.checkout",
            json!({"ref": "me/test_cities", "dir": dir.to_str().unwrap()}),
        )
        .await
        .unwrap();
    assert!(dir.join(".almanac-ref").exists());

    let response = instance
        .dispatch(
            "dataset.remove",
            json!({"ref": "me/test_cities", "revisions": -1}),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(response["unlinked"], true);
    assert!(!dir.join(".almanac-ref").exists());
    // Edited files stay; only the link is removed.
    assert!(dir.join("body.json").exists());
}
