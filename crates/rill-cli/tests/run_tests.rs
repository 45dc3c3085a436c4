//! End-to-end runs of rule files over JSON lines inputs.

use rill_cli::config::RuleFile;
use rill_cli::{run_rule, RunOptions};
use std::path::Path;
use std::time::Duration;

const DEMO: &str = r#"{"color": "red", "size": 3, "ts": 1541152486013}
{"color": "blue", "size": 6, "ts": 1541152486822}
{"color": "blue", "size": 2, "ts": 1541152487632}

{"color": "yellow", "size": 4, "ts": 1541152488442}
{"color": "red", "size": 1, "ts": 1541152489252}
"#;

fn write_rule(dir: &Path, options: &str) -> RuleFile {
    std::fs::write(dir.join("demo.jsonl"), DEMO).unwrap();
    let rule = format!(
        r#"
streams:
  - CREATE STREAM demo (color STRING, size BIGINT, ts BIGINT) WITH (FORMAT="json", TIMESTAMP="ts")
rule:
  id: filter_rule
  sql: SELECT color, size FROM demo WHERE size > 3
  options:
{}
inputs:
  demo: demo.jsonl
output: results.jsonl
"#,
        options
    );
    let path = dir.join("rule.yaml");
    std::fs::write(&path, rule).unwrap();
    RuleFile::load(&path).unwrap()
}

fn read_results(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn opts() -> RunOptions {
    RunOptions {
        linger: Duration::from_millis(200),
        output: None,
    }
}

#[tokio::test]
async fn run_filter_rule_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_rule(dir.path(), "    sendError: true");

    let metrics = run_rule(&file, &opts()).await.unwrap();

    let results = read_results(&dir.path().join("results.jsonl"));
    assert_eq!(
        results,
        vec![
            serde_json::json!([{"color": "blue", "size": 6}]),
            serde_json::json!([{"color": "yellow", "size": 4}]),
        ]
    );
    assert_eq!(metrics["source_demo_0_records_in_total"], 5);
    assert_eq!(metrics["sink_file_0_records_out_total"], 2);
}

#[tokio::test]
async fn run_output_override() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_rule(dir.path(), "    sendError: true");
    let other = dir.path().join("other.jsonl");

    let opts = RunOptions {
        output: Some(other.clone()),
        ..opts()
    };
    run_rule(&file, &opts).await.unwrap();

    assert_eq!(read_results(&other).len(), 2);
    assert!(!dir.path().join("results.jsonl").exists());
}

#[tokio::test]
async fn run_resumes_from_saved_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = write_rule(
        dir.path(),
        "    qos: 1\n    checkpointInterval: 1h\n    enableSaveStateBeforeStop: true",
    );
    file.state_dir = Some(dir.path().join("state"));

    run_rule(&file, &opts()).await.unwrap();
    let metrics = run_rule(&file, &opts()).await.unwrap();

    // The second run starts after the last consumed line
    assert_eq!(metrics["source_demo_0_records_in_total"], 0);
    assert_eq!(read_results(&dir.path().join("results.jsonl")).len(), 2);
}

#[tokio::test]
async fn run_without_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = write_rule(dir.path(), "    sendError: true");
    file.inputs.clear();

    let err = run_rule(&file, &opts()).await.unwrap_err();
    assert_eq!(err.to_string(), "no input file for stream demo");
}

#[tokio::test]
async fn run_unknown_stream_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = write_rule(dir.path(), "    sendError: true");
    file.rule.sql = "SELECT * FROM nope".to_string();

    let err = run_rule(&file, &opts()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "fail to get stream nope, please check if stream is created"
    );
}
