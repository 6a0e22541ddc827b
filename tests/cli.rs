use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn arag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_arag"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(
        root.join("chunks.json"),
        r#"[
  {"id": "tesla", "content": "Tesla reported revenue of 81 billion dollars in 2022.",
   "metadata": {"doc_type": "report", "source": "tesla_revenue.txt"}},
  {"id": "python", "content": "Python is a programming language created by Guido van Rossum.",
   "metadata": {"doc_type": "guide", "source": "python_language.txt"}},
  {"id": "pwc", "content": "The person completed a summer internship at PwC in the audit practice.",
   "metadata": {"doc_type": "person", "source": "pwc_internship.txt"}}
]"#,
    )
    .unwrap();

    fs::write(
        root.join("cases.json"),
        r#"[
  {"query": "Tesla revenue", "relevant": ["tesla"], "expected_phrase": "81 billion"},
  {"query": "programming language", "relevant": ["python"]}
]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"

[corpus]
path = "{root}/chunks.json"

[monitor]
enabled = false
"#,
        root = root.display()
    );

    let config_path = config_dir.join("arag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_arag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = arag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run arag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn feedback_args(rating: &str) -> Vec<&str> {
    vec![
        "feedback",
        "--session",
        "s1",
        "--query",
        "What did the person do at PwC?",
        "--answer",
        "Not sure.",
        "--rating",
        rating,
        "--k",
        "5",
        "--threshold",
        "0.7",
        "--quality",
        "1.0",
    ]
}

#[test]
fn test_search_ranks_matching_chunk_first() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_arag(&config_path, &["search", "What did the person do at PwC?"]);
    assert!(success, "search failed: {}", stderr);
    assert!(
        stdout.starts_with("1. ") && stdout.lines().next().unwrap().contains("pwc"),
        "Expected pwc first, got: {}",
        stdout
    );
    assert!(stdout.contains("source=pwc_internship.txt"));
}

#[test]
fn test_search_with_filter_and_explain() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_arag(
        &config_path,
        &["search", "revenue", "--filter", "doc_type=report", "--explain"],
    );
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("query: type="));
    assert!(stdout.contains("filter: "));
    assert!(stdout.contains("stage "));
    assert!(stdout.contains("tesla"));
    assert!(!stdout.contains("python_language.txt"));
}

#[test]
fn test_search_rejects_malformed_filter() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_arag(&config_path, &["search", "revenue", "--filter", "nokey"]);
    assert!(!success);
}

#[test]
fn test_analyze_prints_classification() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_arag(&config_path, &["analyze", "Who founded PwC?"]);
    assert!(success);
    let analysis: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(analysis["query_type"], "entity");
    assert!(analysis["optimal_k"].as_u64().unwrap() <= 3);
}

#[test]
fn test_feedback_tunes_parameters_across_runs() {
    let (_tmp, config_path) = setup_test_env();

    for _ in 0..4 {
        let (stdout, stderr, success) = run_arag(&config_path, &feedback_args("negative"));
        assert!(success, "feedback failed: {}", stderr);
        assert!(stdout.contains("No tuning yet"), "got: {}", stdout);
    }

    let (stdout, _, success) = run_arag(&config_path, &feedback_args("negative"));
    assert!(success);
    assert!(stdout.contains("Adjusted retrieval_k: 5 -> 7"), "got: {}", stdout);

    let (stdout, _, success) = run_arag(&config_path, &feedback_args("negative"));
    assert!(success);
    assert!(stdout.contains("cooldown"), "got: {}", stdout);

    let (stdout, _, success) = run_arag(&config_path, &["params"]);
    assert!(success);
    let params: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(params["retrieval_k"], 7);

    let (stdout, _, success) = run_arag(&config_path, &["summary", "--hours", "1"]);
    assert!(success);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["total_feedback"], 6);
    assert_eq!(summary["negative_count"], 6);
}

#[test]
fn test_summary_window_limits() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_arag(&config_path, &["summary", "--hours", "1e13"]);
    assert!(success, "summary failed: {}", stderr);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["total_feedback"], 0);

    let (_, stderr, success) = run_arag(&config_path, &["summary", "--hours=-1"]);
    assert!(!success);
    assert!(stderr.contains("Invalid summary window"));
}

#[test]
fn test_feedback_rejects_unknown_rating() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_arag(&config_path, &feedback_args("meh"));
    assert!(!success);
    assert!(stderr.contains("meh"));
}

#[test]
fn test_eval_reports_metrics() {
    let (tmp, config_path) = setup_test_env();
    let cases = tmp.path().join("cases.json");

    let (stdout, stderr, success) = run_arag(
        &config_path,
        &["eval", cases.to_str().unwrap(), "--k", "1,3", "--tune"],
    );
    assert!(success, "eval failed: {}", stderr);
    assert!(stdout.contains("Evaluated 2 queries"));
    assert!(stdout.contains("@1   precision 1.000"));
    assert!(stdout.contains("MRR 1.000"));
    assert!(stdout.contains("phrase recall 1.000"));
    assert!(stdout.contains("Best dense weight"));
}

#[test]
fn test_ask_without_llm_fails_cleanly() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_arag(&config_path, &["ask", "Tesla revenue"]);
    assert!(!success);
    assert!(stderr.contains("No LLM configured"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_arag(&tmp.path().join("nope.toml"), &["params"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
