use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cq");
    path
}

/// Temp dir with a config and a small repository at `<tmp>/shop`.
fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let repo = root.join("shop");
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(
        repo.join("Cargo.toml"),
        "[package]\nname = \"shop\"\nversion = \"0.1.0\"\n\n[dependencies]\naxum = \"0.8\"\ntokio = \"1\"\n",
    )
    .unwrap();
    fs::write(
        repo.join("src/main.rs"),
        "mod billing;\n\n#[tokio::main]\nasync fn main() {\n    billing::charge(42);\n}\n",
    )
    .unwrap();
    fs::write(
        repo.join("src/billing.rs"),
        "/// Settles the quuxotic ledger.\npub fn charge(amount: u64) -> u64 {\n    amount * 2\n}\n",
    )
    .unwrap();
    fs::write(repo.join("README.md"), "# Shop\n\nA tiny web shop used in tests.\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/cq.sqlite"

[fetch]
cache_dir = "{root}/data/repos"

[retrieval]
final_limit = 5

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("codequest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, repo)
}

fn run_cq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn analyze(config_path: &Path, repo: &Path) {
    let (stdout, stderr, success) = run_cq(
        config_path,
        &["analyze", repo.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "analyze failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path, _repo) = setup_test_env();

    let (stdout, stderr, success) = run_cq(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path, _repo) = setup_test_env();

    let (_, _, success1) = run_cq(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cq(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_analyze_local_repository() {
    let (_tmp, config_path, repo) = setup_test_env();
    run_cq(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cq(
        &config_path,
        &["analyze", repo.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "analyze failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed"));
    // No model configured: the walkthrough is a skeleton.
    assert!(stderr.contains("warning:"));
}

#[test]
fn test_analyze_json_output() {
    let (_tmp, config_path, repo) = setup_test_env();

    let (stdout, stderr, success) = run_cq(
        &config_path,
        &["analyze", repo.to_str().unwrap(), "--progress", "off", "--json"],
    );
    assert!(success, "analyze failed: stderr={}", stderr);
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["repo"]["id"], "local/shop");
    assert_eq!(output["walkthrough"]["skeleton"], true);
    assert_eq!(output["index"]["status"], "ready");
    let steps: Vec<&str> = output["progress_log"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["step"].as_str().unwrap())
        .collect();
    assert_eq!(
        steps,
        vec!["fetching", "analyzing", "indexing", "synthesizing", "completed"]
    );
}

#[test]
fn test_analyze_missing_path_fails() {
    let (tmp, config_path, _repo) = setup_test_env();
    let missing = tmp.path().join("nope");

    let (_, stderr, success) = run_cq(
        &config_path,
        &["analyze", missing.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success);
    assert!(stderr.contains("repository fetch failed"), "stderr={}", stderr);
}

#[test]
fn test_search_finds_unique_token() {
    let (_tmp, config_path, repo) = setup_test_env();
    analyze(&config_path, &repo);

    for mode in ["fulltext", "hybrid"] {
        let (stdout, stderr, success) = run_cq(
            &config_path,
            &["search", "quuxotic", "--repo", "local/shop", "--mode", mode],
        );
        assert!(success, "search failed: stderr={}", stderr);
        assert!(stdout.starts_with("1. "), "mode {}: {}", mode, stdout);
        assert!(stdout.contains("src/billing.rs"), "mode {}: {}", mode, stdout);
    }
}

#[test]
fn test_search_respects_limit() {
    let (_tmp, config_path, repo) = setup_test_env();
    analyze(&config_path, &repo);

    let (stdout, _, success) = run_cq(
        &config_path,
        &["search", "shop", "--repo", "local/shop", "--limit", "1"],
    );
    assert!(success);
    assert!(stdout.contains("1. "));
    assert!(!stdout.contains("2. "));
}

#[test]
fn test_search_before_analyze_fails() {
    let (_tmp, config_path, _repo) = setup_test_env();
    run_cq(&config_path, &["init"]);

    let (_, stderr, success) = run_cq(&config_path, &["search", "anything", "--repo", "local/shop"]);
    assert!(!success);
    assert!(stderr.contains("has not been indexed"), "stderr={}", stderr);
}

#[test]
fn test_search_invalid_mode() {
    let (_tmp, config_path, _repo) = setup_test_env();

    let (_, stderr, success) = run_cq(
        &config_path,
        &["search", "x", "--repo", "local/shop", "--mode", "fuzzy"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown search mode"));
}

#[test]
fn test_ask_static_fallback() {
    let (_tmp, config_path, repo) = setup_test_env();
    analyze(&config_path, &repo);

    let (stdout, stderr, success) = run_cq(
        &config_path,
        &["ask", "what does quuxotic charge do", "--repo", "local/shop", "--json"],
    );
    assert!(success, "ask failed: stderr={}", stderr);
    let answer: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(answer["tier"], "static");
    assert_eq!(answer["degraded"], true);
    assert!(answer["answer"].as_str().unwrap().contains("src/billing.rs"));
    assert_eq!(answer["sources"][0]["file_path"], "src/billing.rs");
}

#[test]
fn test_repos_lists_indexed_repository() {
    let (_tmp, config_path, repo) = setup_test_env();

    let (stdout, _, success) = run_cq(&config_path, &["repos"]);
    assert!(success);
    assert!(stdout.contains("No repositories indexed"));

    analyze(&config_path, &repo);
    let (stdout, _, success) = run_cq(&config_path, &["repos"]);
    assert!(success);
    assert!(stdout.contains("local/shop"));
    assert!(stdout.contains("ready"));
}

#[test]
fn test_reanalyze_is_idempotent() {
    let (_tmp, config_path, repo) = setup_test_env();
    analyze(&config_path, &repo);
    let (first, _, _) = run_cq(&config_path, &["repos"]);

    analyze(&config_path, &repo);
    let (second, _, _) = run_cq(&config_path, &["repos"]);

    let counts = |s: &str| {
        s.lines()
            .find(|l| l.starts_with("local/shop"))
            .map(|l| l.split_whitespace().skip(2).take(2).collect::<Vec<_>>().join(" "))
            .unwrap()
    };
    assert_eq!(counts(&first), counts(&second));
}

#[test]
fn test_status_reports_static_plan() {
    let (_tmp, config_path, _repo) = setup_test_env();

    let (stdout, _, success) = run_cq(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Generation plan: local → hosted → static"));
    assert!(stdout.contains("no model backends configured"));
    assert!(stdout.contains("Embeddings: feature-hash"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cq(&tmp.path().join("missing.toml"), &["repos"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
