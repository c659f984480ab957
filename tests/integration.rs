use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragline_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragline");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    ).unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    ).unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    ).unwrap();

    // Offline backends so no network or API key is needed
    let config_content = format!(
        r#"[db]
path = "{}/data/ragline.sqlite"

[chunking]
chunk_size_tokens = 50
overlap_tokens = 5

[embedding]
provider = "hash"
model = "hash"
dims = 128
batch_size = 4

[completion]
provider = "extractive"
model = "extractive"

[retrieval]
top_k = 3
similarity_threshold = 0.0
max_context_tokens = 200

[telemetry]
buffer_size = 5
flush_interval_secs = 1
"#,
        root.display()
    );

    let config_path = config_dir.join("ragline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragline(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragline_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragline binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragline(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ragline(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ragline(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_unknown_config_key_rejected() {
    let (tmp, _) = setup_test_env();
    let bad_config = tmp.path().join("config").join("bad.toml");
    fs::write(
        &bad_config,
        "[db]\npath = \"x.sqlite\"\n\n[chunking]\nchunk_tokens = 100\n",
    )
    .unwrap();

    let (_, stderr, success) = run_ragline(&bad_config, &["init"]);
    assert!(!success, "init should fail on unknown config key");
    assert!(stderr.contains("config"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_directory_reports_per_file() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("beta.md"));
    assert!(stdout.contains("gamma.txt"));
    assert!(stdout.contains("ingested 3 document(s), 0 failure(s)"));
}

#[test]
fn test_ingest_pdf_is_partial_success() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");
    fs::write(files.join("paper.pdf"), b"%PDF-1.4 fake").unwrap();

    // Widen the globs so the pdf is picked up and rejected
    let config_path2 = tmp.path().join("config").join("all.toml");
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[ingest]\ninclude_globs = [\"**/*\"]\n");
    fs::write(&config_path2, content).unwrap();

    run_ragline(&config_path2, &["init"]);
    let (stdout, _, success) =
        run_ragline(&config_path2, &["ingest", files.to_str().unwrap()]);
    // Partial success exits zero with the failure listed
    assert!(success, "partial ingest should exit 0: {}", stdout);
    assert!(stdout.contains("paper.pdf"));
    assert!(stdout.contains("3 document(s), 1 failure(s)"));
}

#[test]
fn test_ingest_total_failure_exits_nonzero() {
    let (tmp, config_path) = setup_test_env();
    let only_pdf = tmp.path().join("onlypdf");
    fs::create_dir_all(&only_pdf).unwrap();
    fs::write(only_pdf.join("doc.pdf"), b"%PDF").unwrap();

    let config_path2 = tmp.path().join("config").join("all2.toml");
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[ingest]\ninclude_globs = [\"**/*\"]\n");
    fs::write(&config_path2, content).unwrap();

    run_ragline(&config_path2, &["init"]);
    let (_, _, success) = run_ragline(&config_path2, &["ingest", only_pdf.to_str().unwrap()]);
    assert!(!success, "all-failed ingest should exit non-zero");
}

#[test]
fn test_embed_pending_and_dry_run() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );

    let (stdout, _, success) = run_ragline(&config_path, &["embed", "pending", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("chunks needing embeddings"));

    let (stdout, stderr, success) = run_ragline(&config_path, &["embed", "pending"]);
    assert!(success, "embed failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("embedded:"));
    assert!(stdout.contains("failed: 0"));

    // Second run finds nothing left
    let (stdout, _, _) = run_ragline(&config_path, &["embed", "pending"]);
    assert!(stdout.contains("all chunks up to date"));
}

#[test]
fn test_query_roundtrip_with_sources() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );
    run_ragline(&config_path, &["embed", "pending"]);

    // The hash backend scores exact word overlap highest, so asking with the
    // document's own words retrieves the right chunk
    let (stdout, stderr, success) = run_ragline(
        &config_path,
        &["query", "the alpha document about Rust programming"],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Based on the provided context"));
    assert!(stdout.contains("sources:"));
    assert!(stdout.contains("est. cost"));
}

#[test]
fn test_query_no_search() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );
    run_ragline(&config_path, &["embed", "pending"]);

    let (stdout, _, success) = run_ragline(
        &config_path,
        &["query", "a question without retrieval", "--no-search"],
    );
    assert!(success, "no-search query failed: {}", stdout);
    // No retrieval means no source listing
    assert!(!stdout.contains("sources:"));
}

#[test]
fn test_query_top_k_flag() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );
    run_ragline(&config_path, &["embed", "pending"]);

    let (stdout, _, success) = run_ragline(
        &config_path,
        &["query", "deployment and infrastructure notes", "--top-k", "1"],
    );
    assert!(success, "query failed: {}", stdout);
    // Exactly one source line
    let source_lines = stdout
        .lines()
        .filter(|l| l.trim_start().starts_with("1. ["))
        .count();
    assert_eq!(source_lines, 1);
    assert!(!stdout.contains("\n  2. ["));
}

#[test]
fn test_metrics_and_costs_after_activity() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );
    run_ragline(&config_path, &["embed", "pending"]);
    run_ragline(&config_path, &["query", "rust programming"]);

    let (stdout, _, success) = run_ragline(&config_path, &["metrics"]);
    assert!(success, "metrics failed: {}", stdout);
    assert!(stdout.contains("OPERATION"));
    assert!(stdout.contains("ingest"));
    assert!(stdout.contains("embed"));

    let (stdout, _, success) = run_ragline(&config_path, &["costs"]);
    assert!(success, "costs failed: {}", stdout);
    assert!(stdout.contains("cost breakdown"));
}

#[test]
fn test_errors_report_lists_failures() {
    let (tmp, config_path) = setup_test_env();

    // No activity yet
    run_ragline(&config_path, &["init"]);
    let (stdout, _, success) = run_ragline(&config_path, &["errors"]);
    assert!(success, "errors failed: {}", stdout);
    assert!(stdout.contains("no recorded failures"));

    // A rejected pdf leaves a failed ingest event behind
    let files = tmp.path().join("files");
    fs::write(files.join("paper.pdf"), b"%PDF-1.4 fake").unwrap();
    let config_path2 = tmp.path().join("config").join("all.toml");
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[ingest]\ninclude_globs = [\"**/*\"]\n");
    fs::write(&config_path2, content).unwrap();
    run_ragline(&config_path2, &["ingest", files.to_str().unwrap()]);

    let (stdout, _, success) = run_ragline(&config_path2, &["errors"]);
    assert!(success, "errors failed: {}", stdout);
    assert!(stdout.contains("ingest"));
    assert!(stdout.contains("1 failure(s)"));
    // The sample message names the rejection
    assert!(stdout.contains("    - "), "expected a sample line: {}", stdout);
}

#[test]
fn test_stats_overview() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );

    let (stdout, _, success) = run_ragline(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stdout);
    assert!(stdout.contains("Documents:   3"));
    assert!(stdout.contains("Chunks:"));
    assert!(stdout.contains("Embedded:"));
}

#[test]
fn test_get_document_by_id() {
    let (tmp, config_path) = setup_test_env();

    run_ragline(&config_path, &["init"]);
    let (stdout, _, _) = run_ragline(
        &config_path,
        &["ingest", tmp.path().join("files").to_str().unwrap()],
    );

    // Pull a document id out of the ingest report ("... id <uuid>)")
    let id = stdout
        .lines()
        .find(|l| l.contains("alpha.md"))
        .and_then(|l| l.split("id ").nth(1))
        .map(|s| s.trim_end_matches(')').to_string())
        .expect("no document id in ingest output");

    let (stdout, stderr, success) = run_ragline(&config_path, &["get", &id]);
    assert!(success, "get failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("--- Document ---"));
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("--- Chunks"));

    let (_, _, success) = run_ragline(&config_path, &["get", "no-such-id"]);
    assert!(!success, "get for unknown id should fail");
}
