#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const TEST_KEY: &str = "test-key-123";

fn oxstash(store: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("oxstash").unwrap();
    cmd.env("OXSTASH_KEY", TEST_KEY);
    cmd.env_remove("OXSTASH_IV");
    cmd.env_remove("OXSTASH_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd.arg("--store").arg(store.path());
    cmd
}

fn write_file(store: &TempDir, path: &str, content: &str) {
    oxstash(store)
        .args(["write", path])
        .write_stdin(content)
        .assert()
        .success();
}

#[test]
fn test_write_then_cat() {
    let store = TempDir::new().unwrap();
    write_file(&store, "/notes/today.txt", "hello world\n");

    oxstash(&store)
        .args(["cat", "/notes/today.txt"])
        .assert()
        .success()
        .stdout("hello world\n");
}

#[test]
fn test_ls_shows_logical_names() {
    let store = TempDir::new().unwrap();
    write_file(&store, "/docs/a.txt", "a");
    write_file(&store, "/docs/sub/b.txt", "bb");

    oxstash(&store)
        .args(["ls", "/docs"])
        .assert()
        .success()
        .stdout("a.txt\nsub/\n");

    oxstash(&store)
        .args(["ls", "-R", "/docs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sub/b.txt"));
}

#[test]
fn test_ls_json() {
    let store = TempDir::new().unwrap();
    write_file(&store, "/f.bin", "12345");

    let output = oxstash(&store).args(["ls", "--json"]).output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["entries"][0]["name"], "f.bin");
    assert_eq!(json["entries"][0]["size"], 5);
}

#[test]
fn test_wrong_key_sees_nothing() {
    let store = TempDir::new().unwrap();
    write_file(&store, "/secret.txt", "s3cr3t");

    oxstash(&store)
        .env("OXSTASH_KEY", "another-key")
        .args(["cat", "/secret.txt"])
        .assert()
        .code(3);
}

#[test]
fn test_missing_path_exit_code() {
    let store = TempDir::new().unwrap();
    oxstash(&store)
        .args(["stat", "/nope"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_rm_recursive() {
    let store = TempDir::new().unwrap();
    write_file(&store, "/tree/a", "1");
    write_file(&store, "/tree/deep/b", "2");

    oxstash(&store).args(["rm", "/tree"]).assert().failure();
    oxstash(&store).args(["rm", "-r", "/tree"]).assert().success();
    oxstash(&store).args(["ls"]).assert().success().stdout("");
    oxstash(&store).args(["rm", "-f", "/tree"]).assert().success();
}

#[test]
fn test_read_only_rejects_writes() {
    let store = TempDir::new().unwrap();
    oxstash(&store)
        .args(["--read-only", "write", "/x"])
        .write_stdin("data")
        .assert()
        .code(4);
}

#[test]
fn test_mirror_plain_directory() {
    let store = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("sub")).unwrap();
    std::fs::write(source.path().join("one.txt"), "1").unwrap();
    std::fs::write(source.path().join("sub/two.txt"), "22").unwrap();

    oxstash(&store)
        .arg("mirror")
        .arg(source.path())
        .arg("/backup")
        .assert()
        .success()
        .stdout(predicate::str::contains("/backup/sub/two.txt"));

    oxstash(&store)
        .args(["cat", "/backup/sub/two.txt"])
        .assert()
        .success()
        .stdout("22");

    // Nothing changed, nothing copied
    oxstash(&store)
        .arg("mirror")
        .arg(source.path())
        .arg("/backup")
        .assert()
        .success()
        .stdout("");
}

#[test]
fn test_config_file() {
    let store = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();
    let config = config_dir.path().join("oxstash.toml");
    std::fs::write(
        &config,
        format!(
            "store = {:?}\n\n[connect.encryption]\nkey = {TEST_KEY:?}\ndir_levels = 1\n",
            store.path().display().to_string()
        ),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("oxstash").unwrap();
    cmd.env_remove("OXSTASH_KEY")
        .env_remove("OXSTASH_STORE")
        .arg("--config")
        .arg(&config)
        .args(["write", "/via-config"])
        .write_stdin("ok")
        .assert()
        .success();

    let mut cmd = Command::cargo_bin("oxstash").unwrap();
    cmd.env_remove("OXSTASH_KEY")
        .env_remove("OXSTASH_STORE")
        .arg("--config")
        .arg(&config)
        .args(["cat", "/via-config"])
        .assert()
        .success()
        .stdout("ok");
}
