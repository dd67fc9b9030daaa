use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn t2s_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_t2s"))
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[embedding]
provider = "hash"
dims = 256

[retrieval]
top_k = 5

[server]
bind = "127.0.0.1:0"
{}"#,
        extra
    );

    let config_path = config_dir.join("t2s.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_t2s(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = t2s_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run t2s binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_corpus_lists_builtin_documents() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, stderr, success) = run_t2s(&config_path, &["corpus"]);
    assert!(success, "corpus failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents:   9"));
    assert!(stdout.contains("semantic:    true"));
    assert!(stdout.contains("nuclear_power_plant_status_types/operational_definition"));
}

#[test]
fn test_search_finds_operational_rule() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, stderr, success) = run_t2s(
        &config_path,
        &["search", "How many operational nuclear power plants are there?"],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("operational_definition"));
    assert!(stdout.contains("lexical:"));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env("");
    let (first, _, _) = run_t2s(&config_path, &["search", "capacity by country"]);
    let (second, _, _) = run_t2s(&config_path, &["search", "capacity by country"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_top_k_limits_results() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, _, success) = run_t2s(
        &config_path,
        &["search", "capacity StatusId plants", "--top-k", "2"],
    );
    assert!(success);
    let ranked: Vec<&str> = stdout
        .lines()
        .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .collect();
    assert_eq!(ranked.len(), 2, "got: {}", stdout);
}

#[test]
fn test_search_empty_query_fails() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_t2s(&config_path, &["search", "  "]);
    assert!(!success);
    assert!(stderr.contains("must not be empty"));
}

#[test]
fn test_tools_lists_agent_tools() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, _, success) = run_t2s(&config_path, &["tools"]);
    assert!(success);
    for tool in [
        "get_schema",
        "get_sample_data",
        "search_metadata",
        "execute_sql",
        "validate_results",
    ] {
        assert!(stdout.contains(tool), "missing {} in {}", tool, stdout);
    }
}

#[test]
fn test_ask_without_model_reports_error_in_response() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, stderr, success) = run_t2s(
        &config_path,
        &["ask", "How many operational plants are there?", "--method", "simple"],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["method"], "simple");
    assert!(response.get("sql").is_none());
    assert!(response["error"].as_str().is_some());
}

#[test]
fn test_ask_rejects_iteration_ceiling() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_t2s(
        &config_path,
        &["ask", "Total capacity", "--method", "agentic", "--max-iterations", "11"],
    );
    assert!(!success);
    assert!(stderr.contains("max_iterations"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("\n[agent]\nmax_iterations = 0\n");
    let (_, stderr, success) = run_t2s(&config_path, &["corpus"]);
    assert!(!success);
    assert!(stderr.contains("agent.max_iterations"));
}

#[test]
fn test_missing_database_is_configuration_error() {
    let (tmp, config_path) = setup_test_env("");
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(
        &config_path,
        format!(
            "{}\n[database]\npath = \"{}\"\n",
            content,
            tmp.path().join("missing.db").display()
        ),
    )
    .unwrap();
    let (_, stderr, success) = run_t2s(&config_path, &["tools"]);
    assert!(!success);
    assert!(stderr.contains("database"));
}
