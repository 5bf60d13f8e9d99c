use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn blens_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("blens");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    // Reference store
    fs::write(
        data_dir.join("foods.csv"),
        "food_id,description,category,portion_grams,Energy,Protein,Sugars\n\
         f001,\"Apples, raw, with skin\",Fruits,150,52,0.3,10.4\n\
         f002,\"Chips, paprika flavor\",Snacks,,536,6.6,2.3\n\
         f003,\"Milk, whole, 3.25% fat\",Dairy,244,61,3.2,5.1\n",
    )
    .unwrap();
    fs::write(
        data_dir.join("drv.csv"),
        "nutrient,unit,drv\nEnergy,kcal,2500\nProtein,g,50\nSugars,g,90\n",
    )
    .unwrap();

    // Two ticket files, one with bookkeeping lines that must be dropped
    let tickets_dir = root.join("tickets");
    fs::create_dir_all(&tickets_dir).unwrap();
    fs::write(
        tickets_dir.join("2023_04_15.csv"),
        "product_name,price,barcode\n\
         MILK WHOLE 1L,1.29,5400112\n\
         CHIPS PAPRIKA 175G,2.10,\n\
         REMISE FIDELITE,-0.50,\n\
         TOTAL,12.34,\n",
    )
    .unwrap();
    fs::write(
        tickets_dir.join("2023_05_20.csv"),
        "product_name,price,barcode\nAPPLES GOLDEN,3.20,\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/blens.sqlite"

[reference]
foods_csv = "{root}/data/foods.csv"
drv_csv = "{root}/data/drv.csv"

[report]
out_dir = "{root}/output"

[adapters.tickets]
dir = "{root}/tickets"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("blens.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_blens(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = blens_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run blens binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_blens(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_blens(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_blens(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_tickets() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    let (stdout, stderr, success) = run_blens(&config_path, &["ingest", "tickets"]);
    assert!(
        success,
        "ingest failed: stdout={}, stderr={}",
        stdout, stderr
    );
    assert!(stdout.contains("files: 2"));
    assert!(stdout.contains("rows inserted: 3"));
    assert!(stdout.contains("rows skipped: 2"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);

    let (stdout1, _, _) = run_blens(&config_path, &["ingest", "tickets"]);
    assert!(stdout1.contains("rows inserted: 3"));

    // Second ingest over the same directory inserts nothing new
    let (stdout2, _, _) = run_blens(&config_path, &["ingest", "tickets"]);
    assert!(stdout2.contains("rows inserted: 0"));
    assert!(stdout2.contains("rows already present: 3"));
}

#[test]
fn test_resolve_dry_run_needs_no_oracle() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    run_blens(&config_path, &["ingest", "tickets"]);

    let (stdout, stderr, success) = run_blens(&config_path, &["resolve", "--dry-run"]);
    assert!(
        success,
        "dry-run failed: stdout={}, stderr={}",
        stdout, stderr
    );
    assert!(stdout.contains("names needing resolution: 3"));
}

#[test]
fn test_resolve_fails_fast_when_provider_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    run_blens(&config_path, &["ingest", "tickets"]);

    let (stdout, stderr, success) = run_blens(&config_path, &["resolve"]);
    assert!(!success, "resolve should fail without a provider: {}", stdout);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_ocr_fails_fast_when_provider_disabled() {
    let (tmp, config_path) = setup_test_env();

    // Point the receipts adapter at an existing directory
    let receipts_dir = tmp.path().join("receipts");
    fs::create_dir_all(&receipts_dir).unwrap();
    let mut config = fs::read_to_string(&config_path).unwrap();
    config.push_str(&format!(
        "\n[adapters.receipts]\ndir = \"{}\"\n",
        receipts_dir.display()
    ));
    fs::write(&config_path, config).unwrap();

    run_blens(&config_path, &["init"]);
    let (stdout, stderr, success) = run_blens(&config_path, &["ingest", "ocr"]);
    assert!(!success, "ocr should fail without a provider: {}", stdout);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_report_requires_purchases() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    let (stdout, stderr, success) = run_blens(&config_path, &["report"]);
    assert!(!success, "report should fail on empty db: {}", stdout);
    assert!(stderr.contains("No purchases"));
}

#[test]
fn test_report_writes_output_files() {
    let (tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    run_blens(&config_path, &["ingest", "tickets"]);

    // No resolution happened, so every trip lacks energy and is excluded,
    // but the report still writes all five files
    let (stdout, stderr, success) = run_blens(&config_path, &["report"]);
    assert!(
        success,
        "report failed: stdout={}, stderr={}",
        stdout, stderr
    );

    let out = tmp.path().join("output");
    for file in [
        "enriched_purchases.csv",
        "trip_nutrients.csv",
        "yearly_summary.csv",
        "top_foods.csv",
        "most_bought.csv",
    ] {
        assert!(out.join(file).is_file(), "missing output file {}", file);
    }
}

#[test]
fn test_stats_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    run_blens(&config_path, &["init"]);
    run_blens(&config_path, &["ingest", "tickets"]);

    let (stdout, stderr, success) = run_blens(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Purchases:   3"));
    assert!(stdout.contains("Trips:       2"));
    assert!(stdout.contains("tickets"));
}
