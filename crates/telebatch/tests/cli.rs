//! CLI contract tests.
//!
//! Every command runs against temp directories; `XDG_CONFIG_HOME` points at
//! an empty dir so a real user config is never picked up.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

#[allow(deprecated)]
fn telebatch(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("telebatch").expect("telebatch binary should be built");
    cmd.env("XDG_CONFIG_HOME", home.join("config"));
    cmd.env("XDG_DATA_HOME", home.join("data"));
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("TELEBATCH_CONFIG");
    cmd.args(["--log-level", "warn"]);
    cmd
}

#[test]
fn config_prints_defaults() {
    let home = tempfile::tempdir().unwrap();
    telebatch(home.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_interval_ms = 60000"))
        .stdout(predicate::str::contains("max_fee = \"1000000000000000000\""));
}

#[test]
fn config_reflects_file_overrides() {
    let home = tempfile::tempdir().unwrap();
    let path = home.path().join("telebatch.toml");
    std::fs::write(&path, "[engine]\nbatch_interval_ms = 5000\n").unwrap();

    telebatch(home.path())
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_interval_ms = 5000"));
}

#[test]
fn invalid_config_is_rejected_with_reason() {
    let home = tempfile::tempdir().unwrap();
    let path = home.path().join("telebatch.toml");
    std::fs::write(&path, "[engine]\nbatch_interval_ms = 0\n").unwrap();

    telebatch(home.path())
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch_interval_ms"));
}

#[test]
fn ingest_uploads_per_device_and_fetch_reads_back() {
    let home = tempfile::tempdir().unwrap();
    let store = home.path().join("batches");
    let input = home.path().join("readings.jsonl");
    std::fs::write(
        &input,
        concat!(
            "{\"deviceId\": \"D1\", \"value\": 1}\n",
            "{\"deviceId\": \"D2\", \"value\": 2}\n",
            "not json\n",
            "\n",
            "{\"deviceId\": \"\", \"value\": 3}\n",
            "{\"deviceId\": \"D1\", \"value\": 4}\n",
        ),
    )
    .unwrap();

    let output = telebatch(home.path())
        .arg("ingest")
        .arg("--input")
        .arg(&input)
        .arg("--store")
        .arg(&store)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let summary: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(summary["accepted"], 3);
    assert_eq!(summary["rejected"], 2);
    assert_eq!(summary["unflushed_readings"], 0);
    assert_eq!(summary["drained"], true);

    let uploads = summary["uploads"].as_array().unwrap();
    assert_eq!(uploads.len(), 2);
    let d1 = uploads.iter().find(|u| u["device_id"] == "D1").unwrap();
    assert_eq!(d1["readings"], 2);

    let content_id = d1["content_id"].as_str().unwrap();
    assert!(store.join(format!("{content_id}.json")).is_file());

    telebatch(home.path())
        .args(["fetch", content_id, "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deviceId\": \"D1\""))
        .stdout(predicate::str::contains("\"value\": 4"));
}

#[test]
fn fetch_unknown_batch_fails() {
    let home = tempfile::tempdir().unwrap();
    let missing = format!("sha256-{}", "0".repeat(64));

    telebatch(home.path())
        .args(["fetch", &missing, "--store"])
        .arg(home.path().join("batches"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("content not found"));
}
