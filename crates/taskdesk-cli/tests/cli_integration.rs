use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_taskdesk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_taskdesk"))
        .args(args)
        .env_remove("TASKDESK_INSPECT_TABLES")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute taskdesk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_taskdesk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "taskdesk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run the binary off the async runtime so the mock server keeps serving.
async fn run_json_blocking(args: Vec<String>) -> Value {
    tokio::task::spawn_blocking(move || run_json(args))
        .await
        .unwrap_or_else(|err| panic!("taskdesk task panicked: {err}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn platform_args(server_uri: &str, history_dir: &Path) -> Vec<String> {
    vec![
        "--platform-url".to_string(),
        server_uri.to_string(),
        "--service-key".to_string(),
        "service-role-key".to_string(),
        "--history-dir".to_string(),
        path_str(history_dir).to_string(),
    ]
}

fn with_args(mut base: Vec<String>, extra: &[&str]) -> Vec<String> {
    base.extend(extra.iter().map(ToString::to_string));
    base
}

async fn mount_metadata(server: &MockServer, tables: Value) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/get_tables"))
        .and(body_json(json!({ "schema_name": "public" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(tables))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/get_policies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "tablename": "tasks", "policyname": "owner can read", "cmd": "SELECT" }
        ])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/get_indexes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "tablename": "tasks", "indexname": "tasks_pkey" }
        ])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/get_table_security"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "PGRST202",
            "message": "Could not find the function public.get_table_security(schema_name)"
        })))
        .mount(server)
        .await;
}

// Test IDs: TCLI-201
#[test]
fn cli_changelog_and_history_on_empty_directory() {
    let root = unique_temp_dir("taskdesk-cli-empty");
    let history_dir = root.join("history");

    let changelog = run_json(["--history-dir", path_str(&history_dir), "metadata", "changelog"]);
    validate_schema("metadata_changelog.schema.json", &changelog);
    assert_eq!(changelog["entries"], json!([]));

    let history = run_json(["--history-dir", path_str(&history_dir), "metadata", "history"]);
    validate_schema("metadata_history.schema.json", &history);
    assert_eq!(history["snapshots"], json!([]));
    assert_eq!(history["latest_present"], false);
}

// Test IDs: TCLI-202
#[test]
fn cli_track_fails_without_writing_when_platform_is_unreachable() {
    let root = unique_temp_dir("taskdesk-cli-unreachable");
    let history_dir = root.join("history");
    let output = run_taskdesk(with_args(
        platform_args("http://127.0.0.1:9", &history_dir),
        &["--timeout", "2", "metadata", "track"],
    ));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to fetch tables"), "stderr:\n{stderr}");
    assert!(!history_dir.exists());
}

// Test IDs: TCLI-203
#[test]
fn cli_track_requires_platform_configuration() {
    let root = unique_temp_dir("taskdesk-cli-unconfigured");
    let output = Command::new(env!("CARGO_BIN_EXE_taskdesk"))
        .args(["--history-dir", path_str(&root.join("history")), "metadata", "track"])
        .env_remove("TASKDESK_PLATFORM_URL")
        .env_remove("TASKDESK_SERVICE_KEY")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute taskdesk binary: {err}"));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TASKDESK_PLATFORM_URL"), "stderr:\n{stderr}");
}

// Test IDs: TCLI-204
#[tokio::test(flavor = "multi_thread")]
async fn cli_track_records_changes_between_runs() {
    let server = MockServer::start().await;
    mount_metadata(&server, json!([{ "table_name": "tasks", "rls_enabled": true }])).await;
    let root = unique_temp_dir("taskdesk-cli-track");
    let history_dir = root.join("history");
    let args = platform_args(&server.uri(), &history_dir);

    let first = run_json_blocking(with_args(args.clone(), &["metadata", "track"])).await;
    validate_schema("metadata_track.schema.json", &first);
    assert_eq!(first["first_run"], true);
    assert_eq!(first["table_count"], 1);
    assert_eq!(first["sections"], json!(["tables", "policies", "indexes"]));
    assert_eq!(first["skipped"][0]["section"], "security");
    assert_eq!(first["changelog_entry"], Value::Null);

    server.reset().await;
    mount_metadata(
        &server,
        json!([
            { "table_name": "tasks", "rls_enabled": true },
            { "table_name": "projects", "rls_enabled": false }
        ]),
    )
    .await;

    let second = run_json_blocking(with_args(args.clone(), &["metadata", "track"])).await;
    validate_schema("metadata_track.schema.json", &second);
    assert_eq!(second["first_run"], false);
    assert_eq!(second["changelog_entry"]["changes"][0]["section"], "tables");
    assert_eq!(second["changelog_entry"]["changes"][0]["details"], "Changes detected in tables");

    let latest = read_json_file(&history_dir.join("latest.json"));
    assert_eq!(latest["tables"][1]["table_name"], "projects");
    assert!(latest.get("security").is_none());

    let changelog = run_json_blocking(with_args(args.clone(), &["metadata", "changelog"])).await;
    validate_schema("metadata_changelog.schema.json", &changelog);
    assert_eq!(changelog["entries"].as_array().map(Vec::len), Some(1));

    let history = run_json_blocking(with_args(args, &["metadata", "history"])).await;
    validate_schema("metadata_history.schema.json", &history);
    assert_eq!(history["snapshots"].as_array().map(Vec::len), Some(2));
    assert_eq!(history["latest_present"], true);
}

// Test IDs: TCLI-205
#[tokio::test(flavor = "multi_thread")]
async fn cli_inspect_profiles_tables_and_writes_structure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "email": "ada@example.com", "vip": true },
            { "id": 2, "email": null, "vip": false }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "42P01",
            "message": "relation \"public.payments\" does not exist"
        })))
        .mount(&server)
        .await;

    let root = unique_temp_dir("taskdesk-cli-inspect");
    let out = root.join("database_structure.json");
    let args = with_args(
        platform_args(&server.uri(), &root.join("history")),
        &["db", "inspect", "--table", "customers,payments", "--out", path_str(&out)],
    );
    let report = run_json_blocking(args).await;
    validate_schema("db_inspect.schema.json", &report);
    assert_eq!(report["structure"]["tables"][0]["name"], "customers");
    assert_eq!(report["skipped"][0]["table"], "payments");

    let written = read_json_file(&out);
    assert_eq!(written["tables"][0]["total_rows"], 2);
    assert_eq!(written["tables"][0]["columns"][1]["nullable"], true);
    assert_eq!(written["tables"][0]["columns"][2]["type"], "boolean");
}
