use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(as_str(&value, "contract_version"), "rk.v1");
    value
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    assert!(
        !output.status.success(),
        "rk command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn child<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or_else(|| panic!("missing object field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn open_db(path: &Path) -> Connection {
    Connection::open(path)
        .unwrap_or_else(|err| panic!("failed to open fixture db {}: {err}", path.display()))
}

fn seed_cards(path: &Path, collation: &str, rows: &[(i64, Option<&str>, Option<&str>)]) {
    let conn = open_db(path);
    conn.execute_batch(&format!(
        "CREATE TABLE cards (id INTEGER PRIMARY KEY, column_id TEXT, position TEXT {collation});"
    ))
    .unwrap_or_else(|err| panic!("failed to create cards table: {err}"));
    for (id, column, position) in rows {
        conn.execute(
            "INSERT INTO cards(id, column_id, position) VALUES (?1, ?2, ?3)",
            params![id, column, position],
        )
        .unwrap_or_else(|err| panic!("failed to insert card {id}: {err}"));
    }
}

fn stored_positions(path: &Path) -> Vec<(i64, Option<String>)> {
    let conn = open_db(path);
    let mut stmt = conn
        .prepare("SELECT id, position FROM cards ORDER BY id")
        .unwrap_or_else(|err| panic!("failed to prepare position query: {err}"));
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap_or_else(|err| panic!("failed to query positions: {err}"));
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .unwrap_or_else(|err| panic!("failed to read positions: {err}"))
}

const BROKEN_BOARD: [(i64, Option<&str>, Option<&str>); 6] = [
    (1, Some("todo"), None),
    (2, Some("todo"), Some("B")),
    (3, Some("todo"), Some("B")),
    (4, Some("todo"), None),
    (5, Some("done"), Some("B")),
    (6, Some("done"), Some("C")),
];

const BINDING_FLAGS: [&str; 4] = ["--table", "cards", "--group-column", "column_id"];

fn some(raw: &str) -> Option<String> {
    Some(raw.to_string())
}

#[test]
fn rank_commands_emit_keys() {
    let first = run_json(["rank", "first"]);
    assert_eq!(as_str(&first, "rank"), "U");

    let after = run_json(["rank", "after", "--rank", "y"]);
    assert_eq!(as_str(&after, "rank"), "y1");

    let before = run_json(["rank", "before", "--rank", "1"]);
    assert_eq!(as_str(&before, "rank"), "0y");

    let between = run_json(["rank", "between", "--prev", "T", "--next", "V"]);
    assert_eq!(as_str(&between, "rank"), "U");
}

#[test]
fn rank_edge_places_around_existing_keys() {
    let top = run_json(["rank", "edge", "--edge", "top", "--existing", "b,m,bad!"]);
    assert_eq!(as_str(&top, "edge"), "top");
    assert_eq!(as_str(&top, "rank"), "a");

    let bottom = run_json(["rank", "edge", "--edge", "bottom", "--existing", "b,m,bad!"]);
    assert_eq!(as_str(&bottom, "edge"), "bottom");
    assert_eq!(as_str(&bottom, "rank"), "n");

    let empty = run_json(["rank", "edge", "--edge", "bottom"]);
    assert_eq!(as_str(&empty, "rank"), "U");
}

#[test]
fn rank_between_rejects_unordered_bounds() {
    let stderr = run_failure(["rank", "between", "--prev", "V", "--next", "T"]);
    assert!(stderr.contains("greater than or equal"), "unexpected stderr: {stderr}");

    let stderr = run_failure(["rank", "after", "--rank", "ab0"]);
    assert!(stderr.contains("invalid rank"), "unexpected stderr: {stderr}");
}

#[test]
fn rank_validate_reports_both_outcomes() {
    let valid = run_json(["rank", "validate", "--rank", "a0z"]);
    assert!(as_bool(&valid, "valid"));

    let invalid = run_json(["rank", "validate", "--rank", "ab0"]);
    assert!(!as_bool(&invalid, "valid"));
    assert!(as_str(&invalid, "error").contains("min char"));
}

#[test]
fn repair_plan_then_apply_fixes_the_board() {
    let sandbox = unique_temp_dir("rankkernel-cli-plan-apply");
    let db = sandbox.join("board.sqlite3");
    let plan_file = sandbox.join("plan.json");
    seed_cards(&db, "", &BROKEN_BOARD);

    let mut analyze_args = vec!["--db", path_str(&db), "repair", "analyze"];
    analyze_args.extend(BINDING_FLAGS);
    let analysis = run_json(&analyze_args);
    assert!(as_bool(&analysis, "needs_repair"));
    let counts = child(&analysis, "analysis");
    assert_eq!(as_i64(counts, "total"), 6);
    assert_eq!(as_i64(counts, "missing"), 2);
    assert_eq!(as_i64(counts, "duplicate_values"), 1);
    assert!(!as_str(&analysis, "generated_at").is_empty());

    let mut plan_args =
        vec!["--db", path_str(&db), "repair", "plan", "--out", path_str(&plan_file)];
    plan_args.extend(BINDING_FLAGS);
    let planned = run_json(&plan_args);
    let summary = child(&planned, "summary");
    assert_eq!(as_str(summary, "strategy"), "fix_all");
    assert_eq!(as_i64(summary, "assignments"), 4);
    assert_eq!(as_i64(child(summary, "groups"), "todo"), 4);
    assert!(plan_file.exists());
    assert_eq!(stored_positions(&db)[0], (1, None));

    let mut apply_args =
        vec!["--db", path_str(&db), "repair", "apply", "--plan", path_str(&plan_file)];
    apply_args.extend(BINDING_FLAGS);
    let applied = run_json(&apply_args);
    assert_eq!(as_i64(&applied, "updated"), 4);

    assert_eq!(
        stored_positions(&db),
        vec![(1, some("U")), (2, some("V")), (3, some("W")), (4, some("X")), (5, some("B")), (6, some("C"))]
    );

    let rerun = run_json(&analyze_args);
    assert!(!as_bool(&rerun, "needs_repair"));
}

#[test]
fn repair_apply_honours_strategy_and_filters() {
    let sandbox = unique_temp_dir("rankkernel-cli-filters");
    let db = sandbox.join("board.sqlite3");
    seed_cards(&db, "", &BROKEN_BOARD);

    let mut args = vec![
        "--db",
        path_str(&db),
        "repair",
        "apply",
        "--strategy",
        "fix-missing",
        "--ids",
        "1,2,3",
    ];
    args.extend(BINDING_FLAGS);
    let applied = run_json(&args);
    assert_eq!(as_i64(&applied, "updated"), 1);
    assert_eq!(as_str(child(&applied, "summary"), "strategy"), "fix_missing");

    let stored = stored_positions(&db);
    assert_eq!(stored[0], (1, some("C")));
    assert_eq!(stored[3], (4, None));

    let mut group_args =
        vec!["--db", path_str(&db), "repair", "apply", "--strategy", "regenerate", "--group", "done"];
    group_args.extend(BINDING_FLAGS);
    let regenerated = run_json(&group_args);
    assert_eq!(as_i64(&regenerated, "updated"), 2);

    let stored = stored_positions(&db);
    assert_eq!(stored[4], (5, some("U")));
    assert_eq!(stored[5], (6, some("V")));
    assert_eq!(stored[1], (2, some("B")));
}

#[test]
fn stale_saved_plan_is_rejected_without_writes() {
    let sandbox = unique_temp_dir("rankkernel-cli-stale");
    let db = sandbox.join("board.sqlite3");
    let plan_file = sandbox.join("plan.json");
    seed_cards(&db, "", &BROKEN_BOARD);

    let mut plan_args =
        vec!["--db", path_str(&db), "repair", "plan", "--out", path_str(&plan_file)];
    plan_args.extend(BINDING_FLAGS);
    let _planned = run_json(&plan_args);

    open_db(&db)
        .execute("UPDATE cards SET position = 'k' WHERE id = 4", [])
        .unwrap_or_else(|err| panic!("failed to mutate fixture: {err}"));
    let before = stored_positions(&db);

    let mut apply_args =
        vec!["--db", path_str(&db), "repair", "apply", "--plan", path_str(&plan_file)];
    apply_args.extend(BINDING_FLAGS);
    let stderr = run_failure(&apply_args);
    assert!(stderr.contains("no longer holds"), "unexpected stderr: {stderr}");
    assert_eq!(stored_positions(&db), before);
}

#[test]
fn saved_plan_cannot_be_combined_with_strategy() {
    let sandbox = unique_temp_dir("rankkernel-cli-plan-strategy");
    let db = sandbox.join("board.sqlite3");
    let plan_file = sandbox.join("plan.json");
    seed_cards(&db, "", &BROKEN_BOARD);

    let mut plan_args =
        vec!["--db", path_str(&db), "repair", "plan", "--out", path_str(&plan_file)];
    plan_args.extend(BINDING_FLAGS);
    let _planned = run_json(&plan_args);
    let before = stored_positions(&db);

    let mut apply_args = vec![
        "--db",
        path_str(&db),
        "repair",
        "apply",
        "--plan",
        path_str(&plan_file),
        "--strategy",
        "regenerate",
    ];
    apply_args.extend(BINDING_FLAGS);
    let stderr = run_failure(&apply_args);
    assert!(stderr.contains("cannot be used with"), "unexpected stderr: {stderr}");
    assert_eq!(stored_positions(&db), before);
}

#[test]
fn yaml_config_replaces_binding_flags() {
    let sandbox = unique_temp_dir("rankkernel-cli-config");
    let db = sandbox.join("board.sqlite3");
    let config = sandbox.join("binding.yaml");
    seed_cards(&db, "", &BROKEN_BOARD);
    fs::write(&config, "table: cards\ngroup_column: column_id\nrank_column: position\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let analysis =
        run_json(["--db", path_str(&db), "repair", "analyze", "--config", path_str(&config)]);
    assert_eq!(as_str(&analysis, "table"), "cards");
    assert_eq!(as_i64(child(&analysis, "analysis"), "missing"), 2);

    let stderr = run_failure(["--db", path_str(&db), "repair", "analyze", "--table", "cards"]);
    assert!(stderr.contains("--group-column"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db",
        path_str(&db),
        "repair",
        "analyze",
        "--table",
        "cards;drop",
        "--group-column",
        "column_id",
    ]);
    assert!(stderr.contains("invalid table identifier"), "unexpected stderr: {stderr}");
}

#[test]
fn check_order_flags_case_insensitive_columns() {
    let sandbox = unique_temp_dir("rankkernel-cli-order");
    let binary_db = sandbox.join("binary.sqlite3");
    let nocase_db = sandbox.join("nocase.sqlite3");
    let rows = [(1, Some("todo"), Some("a")), (2, Some("todo"), Some("B"))];
    seed_cards(&binary_db, "", &rows);
    seed_cards(&nocase_db, "COLLATE NOCASE", &rows);

    let mut binary_args = vec!["--db", path_str(&binary_db), "db", "check-order"];
    binary_args.extend(BINDING_FLAGS);
    let binary = run_json(&binary_args);
    assert!(as_bool(child(&binary, "report"), "consistent"));

    let mut nocase_args = vec!["--db", path_str(&nocase_db), "db", "check-order"];
    nocase_args.extend(BINDING_FLAGS);
    let nocase = run_json(&nocase_args);
    let report = child(&nocase, "report");
    assert!(!as_bool(report, "consistent"));
    assert_eq!(report.get("mismatched_groups"), Some(&serde_json::json!(["todo"])));
}
