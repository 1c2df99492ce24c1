#![allow(missing_docs)]

mod support;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use penumbra::persist::{set_branches, BranchMap};
use penumbra::primitives::kv::{KvProvider, SqliteKvProvider};
use penumbra::storage::dag::{with_write, DagStore, Store};
use penumbra::Replica;
use serde_json::{json, Value};
use tempfile::TempDir;

use support::{options, put};

const NAME: &str = "penumbra-cli-1-1";

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn setup() -> std::result::Result<(TempDir, PathBuf), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let data_dir = dir.path().join("data");
    let replica = Replica::open(options("cli"), Arc::new(SqliteKvProvider::new(&data_dir)))?;
    put(&replica, "k", json!("v"))?;
    replica.persist()?;
    replica.close()?;
    Ok((dir, data_dir))
}

fn cli(config_dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("penumbra");
    cmd.env("PENUMBRA_CONFIG", config_dir.join("cli.toml"))
        .env_remove("PENUMBRA_DATA_DIR")
        .env_remove("PENUMBRA_LOG");
    cmd
}

fn json_output(cmd: &mut Command) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let output = cmd.assert().success().get_output().stdout.clone();
    Ok(serde_json::from_slice(&output)?)
}

#[test]
fn listings_report_json() -> TestResult {
    let (dir, data_dir) = setup()?;

    let heads = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .args(["heads", NAME]),
    )?;
    let names: Vec<&str> = heads["heads"]
        .as_array()
        .ok_or("heads missing")?
        .iter()
        .filter_map(|h| h["name"].as_str())
        .collect();
    assert!(names.contains(&"clients"));
    assert!(names.contains(&"branches"));

    let clients = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .args(["clients", NAME]),
    )?;
    assert_eq!(clients["clients"].as_array().map(Vec::len), Some(1));

    let branches = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .args(["branches", NAME]),
    )?;
    assert_eq!(branches["branches"][0]["pending"], json!(true));
    assert_eq!(branches["branches"][0]["mutator_names"], json!(["del", "put"]));

    let databases = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .arg("databases"),
    )?;
    assert_eq!(databases["databases"][0]["name"], json!(NAME));
    Ok(())
}

#[test]
fn text_output_names_the_store() -> TestResult {
    let (dir, data_dir) = setup()?;
    let output = cli(dir.path())
        .args(["--quiet", "--data-dir"])
        .arg(&data_dir)
        .arg("databases")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output)?;
    assert!(text.contains(NAME), "unexpected output: {text}");
    Ok(())
}

#[test]
fn verify_exit_code_follows_findings() -> TestResult {
    let (dir, data_dir) = setup()?;
    let report = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .args(["verify", NAME, "--level", "full"]),
    )?;
    assert_eq!(report["success"], json!(true));
    assert_eq!(report["counts"]["entries"], json!(1));

    let store = DagStore::new(SqliteKvProvider::new(&data_dir).open(NAME)?);
    with_write(&store, |w| {
        set_branches(&BranchMap::new(), w)?;
        w.commit()
    })?;
    store.close()?;

    cli(dir.path())
        .args(["--format", "json", "--data-dir"])
        .arg(&data_dir)
        .args(["verify", NAME])
        .assert()
        .code(2);
    Ok(())
}

#[test]
fn gc_reports_registry_sizes() -> TestResult {
    let (dir, data_dir) = setup()?;
    let report = json_output(
        cli(dir.path())
            .args(["--format", "json", "--data-dir"])
            .arg(&data_dir)
            .args(["gc", NAME]),
    )?;
    assert_eq!(report["clients_before"], json!(1));
    assert_eq!(report["clients_after"], json!(1));
    assert_eq!(report["branches_after"], json!(1));
    Ok(())
}

#[test]
fn profile_supplies_the_data_dir() -> TestResult {
    let (dir, data_dir) = setup()?;
    fs::write(
        dir.path().join("cli.toml"),
        format!(
            "[profiles.local]\ndata_dir = {}\n",
            toml::Value::String(data_dir.display().to_string())
        ),
    )?;
    let report = json_output(
        cli(dir.path())
            .args(["--format", "json", "--profile", "local"])
            .arg("databases"),
    )?;
    assert_eq!(report["databases"][0]["name"], json!(NAME));
    Ok(())
}

#[test]
fn missing_inputs_fail_cleanly() -> TestResult {
    let dir = TempDir::new()?;
    let output = cli(dir.path()).arg("databases").assert().failure().get_output().stderr.clone();
    assert!(String::from_utf8(output)?.contains("no data directory"));

    cli(dir.path())
        .args(["--data-dir"])
        .arg(dir.path())
        .args(["heads", "nope"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn completions_are_generated() -> TestResult {
    let dir = TempDir::new()?;
    let output = cli(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8(output)?.contains("penumbra"));
    Ok(())
}
