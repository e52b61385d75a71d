//! End-to-end tests for the schema-sync binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;

struct Env {
    _temp_dir: TempDir,
    root: PathBuf,
    source: PathBuf,
    replica: PathBuf,
}

fn env() -> Env {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("sync");
    let source = temp_dir.path().join("source.db");
    let replica = temp_dir.path().join("replica.db");
    Env {
        root,
        source,
        replica,
        _temp_dir: temp_dir,
    }
}

/// Get a Command for the schema-sync binary
fn cmd(db: &Path, root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("schema-sync").expect("Failed to find schema-sync binary");
    cmd.env_remove("SCHEMA_SYNC_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db)
        .arg("--dir")
        .arg(root)
        .arg("--json");
    cmd
}

fn json_out(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn seed_source(env: &Env) {
    let conn = Connection::open(&env.source).unwrap();
    conn.execute_batch(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, parent INTEGER);
         INSERT INTO posts (id, title, parent) VALUES (1, 'root', NULL), (2, 'child', 1);",
    )
    .unwrap();
    std::fs::write(
        env.root.join("config.json"),
        r#"{"syncCustomCollections": {"posts": {"watch": ["posts"], "linkedFields": ["parent"]}}}"#,
    )
    .unwrap();
}

#[test]
fn test_commands_require_install() {
    let env = env();
    cmd(&env.source, &env.root)
        .arg("export")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("NOT_INITIALIZED"));
}

#[test]
fn test_install_writes_config_once() {
    let env = env();
    let out = json_out(cmd(&env.source, &env.root).arg("install"));
    assert_eq!(out["config_written"], true);
    assert!(env.root.join("config.json").exists());

    std::fs::write(env.root.join("config.json"), "{}").unwrap();
    let out = json_out(cmd(&env.source, &env.root).arg("install"));
    assert_eq!(out["config_written"], false);
    assert_eq!(out["migrations_applied"], 0);
    assert_eq!(std::fs::read_to_string(env.root.join("config.json")).unwrap(), "{}");
}

#[test]
fn test_export_then_import_into_replica() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));
    seed_source(&env);

    let exported = json_out(cmd(&env.source, &env.root).arg("export"));
    assert_eq!(exported["success"], true);
    assert!(exported["hash"].is_string());
    assert!(env.root.join("data").join("posts.json").exists());
    assert!(env.root.join("data").join("schema.json").exists());
    assert!(env.root.join("hash.txt").exists());

    json_out(cmd(&env.replica, &env.root).arg("install"));
    let imported = json_out(cmd(&env.replica, &env.root).arg("import"));
    assert_eq!(imported["collections"]["posts"]["inserted"], 2);

    let conn = Connection::open(&env.replica).unwrap();
    let titles: Vec<String> = conn
        .prepare("SELECT title FROM posts ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(titles, vec!["root", "child"]);

    let status = json_out(cmd(&env.replica, &env.root).arg("status"));
    assert_eq!(status["up_to_date"], true);

    let synced = json_out(cmd(&env.replica, &env.root).arg("sync"));
    assert_eq!(synced["applied"], false);
}

fn lock_row(db: &Path) -> (String, bool) {
    Connection::open(db)
        .unwrap()
        .query_row("SELECT mv_hash, mv_locked FROM settings WHERE id = 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap()
}

#[test]
fn test_import_leaves_foreign_lock_alone() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));
    seed_source(&env);
    json_out(cmd(&env.source, &env.root).arg("export"));

    json_out(cmd(&env.replica, &env.root).arg("install"));
    Connection::open(&env.replica)
        .unwrap()
        .execute("UPDATE settings SET mv_locked = 1 WHERE id = 1", [])
        .unwrap();

    let imported = json_out(cmd(&env.replica, &env.root).arg("import"));
    assert_eq!(imported["collections"]["posts"]["inserted"], 2);
    assert_eq!(imported["recorded"], false);
    assert_eq!(lock_row(&env.replica), (String::new(), true));
}

#[test]
fn test_merge_import_records_nothing() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));
    seed_source(&env);
    json_out(cmd(&env.source, &env.root).arg("export"));

    json_out(cmd(&env.replica, &env.root).arg("install"));
    let merged = json_out(cmd(&env.replica, &env.root).args(["import", "--merge"]));
    assert_eq!(merged["recorded"], false);
    assert_eq!(lock_row(&env.replica), (String::new(), false));

    // the next sync still applies the files in full
    let synced = json_out(cmd(&env.replica, &env.root).arg("sync"));
    assert_eq!(synced["applied"], true);
}

#[test]
fn test_sync_applies_new_export_once() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));
    seed_source(&env);
    json_out(cmd(&env.source, &env.root).arg("export"));

    json_out(cmd(&env.replica, &env.root).arg("install"));
    let first = json_out(cmd(&env.replica, &env.root).arg("sync"));
    assert_eq!(first["applied"], true);
    let second = json_out(cmd(&env.replica, &env.root).arg("sync"));
    assert_eq!(second["applied"], false);

    // the exporting database already counts its own export as applied
    let source = json_out(cmd(&env.source, &env.root).arg("sync"));
    assert_eq!(source["applied"], false);
}

#[test]
fn test_hash_and_force_commit() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));

    cmd(&env.source, &env.root)
        .arg("force-commit")
        .assert()
        .failure()
        .stderr(predicate::str::contains("hash.txt"));

    let hashed = json_out(cmd(&env.source, &env.root).arg("hash"));
    let hash = hashed["meta"]["hash"].as_str().unwrap().to_string();

    let committed = json_out(cmd(&env.source, &env.root).arg("force-commit"));
    assert_eq!(committed["meta"]["hash"], hash.as_str());

    let status = json_out(cmd(&env.source, &env.root).arg("status"));
    assert_eq!(status["lock"]["hash"], hash.as_str());
    assert_eq!(status["lock"]["locked"], false);
}

#[test]
fn test_schema_only_round_trip() {
    let env = env();
    json_out(cmd(&env.source, &env.root).arg("install"));
    seed_source(&env);

    json_out(cmd(&env.source, &env.root).args(["export-schema", "--split", "false"]));
    assert!(!env.root.join("data").join("schema").exists());

    json_out(cmd(&env.replica, &env.root).arg("install"));
    let applied = json_out(cmd(&env.replica, &env.root).arg("import-schema"));
    assert_eq!(applied["applied"], true);

    let conn = Connection::open(&env.replica).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}
