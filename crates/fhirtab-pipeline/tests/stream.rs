//! Stream processor and runner integration tests over real files.

use std::io::Write;
use std::sync::Arc;

use fhirtab_db::DuckDbPool;
use fhirtab_pipeline::{StreamProcessor, ViewRunner};
use fhirtab_view::{Materializer, ViewDefinition, compile};
use serde_json::json;
use tempfile::NamedTempFile;

fn patient_view() -> ViewDefinition {
    ViewDefinition::from_json(&json!({
        "resourceType": "ViewDefinition",
        "name": "patients",
        "status": "active",
        "resource": "Patient",
        "select": [{
            "column": [
                {"name": "patient_id", "path": "getResourceKey()"},
                {"name": "gender", "path": "gender"}
            ]
        }]
    }))
    .unwrap()
}

fn materializer(view: &ViewDefinition) -> Materializer {
    Materializer::new(Arc::new(compile(view).unwrap()))
}

fn ndjson_file(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn empty_file_produces_nothing() {
    let file = ndjson_file(&[]);
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert!(rows.is_empty());
    assert_eq!(stats.total_records, 0);
    assert_eq!(stats.parsed_records, 0);
    assert_eq!(stats.invalid_records, 0);
}

#[tokio::test]
async fn basic_projection_through_the_stream() {
    let file = ndjson_file(&[
        r#"{"resourceType":"Patient","id":"1","gender":"male"}"#,
        r#"{"resourceType":"Patient","id":"2","gender":"female"}"#,
    ]);
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.parsed_records, 2);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["patient_id"], json!("1"));
    assert_eq!(rows[0]["gender"], json!("male"));
    assert_eq!(rows[1]["patient_id"], json!("2"));
    assert_eq!(rows[1]["gender"], json!("female"));
}

#[tokio::test]
async fn invalid_lines_are_counted_and_skipped() {
    let file = ndjson_file(&[
        r#"{"resourceType":"Patient","id":"1","gender":"male"}"#,
        "{not json",
        r#""just a string""#,
        r#"{"resourceType":"Patient","id":"2","gender":"female"}"#,
    ]);
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 4);
    assert_eq!(stats.parsed_records, 2);
    assert_eq!(stats.invalid_records, 2);
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn non_matching_resource_type_is_skipped_silently() {
    let file = ndjson_file(&[
        r#"{"resourceType":"Observation","id":"o1"}"#,
        r#"{"resourceType":"Patient","id":"1","gender":"male"}"#,
    ]);
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.parsed_records, 1);
    // Mismatched types are not failures.
    assert_eq!(stats.invalid_records, 0);
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn blank_lines_are_ignored() {
    let file = ndjson_file(&[
        "",
        r#"{"resourceType":"Patient","id":"1","gender":"male"}"#,
        "   ",
    ]);
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.parsed_records, 1);
    assert_eq!(stats.invalid_records, 0);
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn where_excluded_resources_are_not_parsed() {
    let view = ViewDefinition::from_json(&json!({
        "resourceType": "ViewDefinition",
        "name": "active_patients",
        "status": "active",
        "resource": "Patient",
        "select": [{
            "column": [{"name": "patient_id", "path": "id"}]
        }],
        "where": [{"path": "active = true"}]
    }))
    .unwrap();

    let file = ndjson_file(&[
        r#"{"resourceType":"Patient","id":"1","active":true}"#,
        r#"{"resourceType":"Patient","id":"2","active":false}"#,
    ]);
    let processor = StreamProcessor::new(1, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.parsed_records, 1);
    assert_eq!(stats.invalid_records, 0);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["patient_id"], json!("1"));
}

#[tokio::test]
async fn bounded_concurrency_processes_everything() {
    let lines: Vec<String> = (0..50)
        .map(|i| format!(r#"{{"resourceType":"Patient","id":"{i}","gender":"other"}}"#))
        .collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = ndjson_file(&line_refs);
    let view = patient_view();
    let processor = StreamProcessor::new(4, 100);

    let (rows, stats) = processor
        .process(file.path(), &materializer(&view))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 50);
    assert_eq!(stats.parsed_records, 50);
    assert_eq!(rows.len(), 50);
}

#[tokio::test]
async fn missing_input_file_is_an_error() {
    let view = patient_view();
    let processor = StreamProcessor::new(1, 100);

    let result = processor
        .process(std::path::Path::new("/nonexistent/input.ndjson"), &materializer(&view))
        .await;
    assert!(matches!(result, Err(fhirtab_pipeline::Error::Io { .. })));
}

#[tokio::test]
async fn runner_end_to_end_into_duckdb() {
    let file = ndjson_file(&[
        r#"{"resourceType":"Patient","id":"1","gender":"male"}"#,
        r#"{"resourceType":"Patient","id":"2","gender":"female"}"#,
        r#"{"resourceType":"Observation","id":"o1"}"#,
    ]);
    let pool = DuckDbPool::open_in_memory(2).unwrap();
    let runner = ViewRunner::new(Arc::clone(&pool), 2, 1000);

    let report = runner.run(&patient_view(), file.path()).await.unwrap();
    assert_eq!(report.table_name, "patients");
    assert_eq!(report.stats.total_records, 3);
    assert_eq!(report.stats.parsed_records, 2);
    assert_eq!(report.upserts.inserted, 2);
    assert_eq!(report.upserts.errors, 0);
    assert!(report.is_clean());

    let conn = pool.acquire().unwrap();
    let genders: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT gender FROM patients ORDER BY patient_id")
            .unwrap();
        let rows = stmt.query_map([], |r| r.get(0)).unwrap();
        rows.collect::<Result<_, _>>().unwrap()
    };
    assert_eq!(genders, vec!["male".to_string(), "female".to_string()]);
}

#[tokio::test]
async fn rerunning_the_same_file_replaces_rows() {
    let file = ndjson_file(&[r#"{"resourceType":"Patient","id":"1","gender":"male"}"#]);
    let pool = DuckDbPool::open_in_memory(2).unwrap();
    let runner = ViewRunner::new(Arc::clone(&pool), 1, 1000);
    let view = patient_view();

    let first = runner.run(&view, file.path()).await.unwrap();
    assert_eq!(first.upserts.inserted, 1);
    assert_eq!(first.upserts.deleted, 0);

    let second = runner.run(&view, file.path()).await.unwrap();
    assert_eq!(second.upserts.inserted, 1);
    assert_eq!(second.upserts.deleted, 1);
    assert_eq!(second.upserts.updated, 1);

    let conn = pool.acquire().unwrap();
    let total: i64 = conn
        .query_row("SELECT count(*) FROM patients", [], |r| r.get(0))
        .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn runner_fan_out_view_into_duckdb() {
    let view = ViewDefinition::from_json(&json!({
        "resourceType": "ViewDefinition",
        "name": "patient_addresses",
        "status": "active",
        "resource": "Patient",
        "select": [{
            "column": [{"name": "patient_id", "path": "getResourceKey()"}],
            "select": [{
                "forEach": "address",
                "column": [{"name": "city", "path": "city"}]
            }]
        }]
    }))
    .unwrap();

    let file = ndjson_file(&[
        r#"{"resourceType":"Patient","id":"1","address":[{"city":"Springfield"},{"city":"Shelbyville"}]}"#,
    ]);
    let pool = DuckDbPool::open_in_memory(2).unwrap();
    let runner = ViewRunner::new(Arc::clone(&pool), 1, 1000);

    let report = runner.run(&view, file.path()).await.unwrap();
    assert_eq!(report.upserts.inserted, 2);

    // Fan-out rows repeat the resource key; it is not a primary key.
    let conn = pool.acquire().unwrap();
    let keyed: i64 = conn
        .query_row(
            "SELECT count(*) FROM patient_addresses WHERE patient_id = '1'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(keyed, 2);
}
