#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::Command;

fn write_catalog(tag: &str, json: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "casrv-{tag}-{}-{}.json",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::write(&path, json).expect("catalogue should be writable");
    path
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("casrv {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn extended_version_reports_protocol() {
    let output = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("version")
        .arg("--extended")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("protocol: 4.13"));
    assert!(!stdout.contains("build_target: unknown"));
    assert!(!stdout.contains("build_profile: unknown"));
}

#[test]
fn pvs_lists_catalogue_as_json() {
    let path = write_catalog(
        "list",
        r#"{"pvs":[{"name":"tempA","type":"double","value":21.5},{"name":"mode","type":"enum","enum_strings":["off","on"]}]}"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("--format")
        .arg("json")
        .arg("pvs")
        .arg("--pvs")
        .arg(&path)
        .output()
        .expect("pvs should run");

    assert!(output.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("pvs should emit json");
    let names: Vec<&str> = payload["pvs"]
        .as_array()
        .expect("pvs should be an array")
        .iter()
        .filter_map(|pv| pv["name"].as_str())
        .collect();
    assert_eq!(names, vec!["tempA", "mode"]);
    assert!(payload["schema_id"]
        .as_str()
        .is_some_and(|id| id.ends_with("pv-listing.schema.json")));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn pvs_invalid_catalogue_returns_60() {
    let path = write_catalog("invalid", r#"{"pvs":[{"name":"a","type":"quad"}]}"#);

    let output = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("pvs")
        .arg("--pvs")
        .arg(&path)
        .output()
        .expect("pvs should run");

    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown type"));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn pvs_missing_catalogue_returns_66() {
    let output = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("pvs")
        .arg("--pvs")
        .arg("/nonexistent/casrv-pvs.json")
        .output()
        .expect("pvs should run");

    assert_eq!(output.status.code(), Some(66));
}
