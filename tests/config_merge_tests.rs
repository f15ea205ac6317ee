//! Tests for config document merging
//!
//! These tests verify:
//! - Unrelated keys written by other tooling survive an upsert
//! - Applying the same updates twice yields byte-identical files
//! - A corrupt document is replaced rather than failing the run
//! - Failed writes leave the previous document intact

use hostsetup::config_merge::{ConfigDocument, KeyPath, parse_assignment, upsert, upsert_env_line};
use serde_json::{Value, json};
use std::fs;
use tempfile::TempDir;

fn updates(pairs: &[(&str, Value)]) -> Vec<(KeyPath, Value)> {
    pairs
        .iter()
        .map(|(k, v)| (KeyPath::parse(k).unwrap(), v.clone()))
        .collect()
}

#[test]
fn test_foreign_keys_survive_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    fs::write(
        &path,
        r#"{"agents":{"defaults":{"workspace":"~/ws"}},"gateway":{"auth":{"token":"t"}},"meta":[1,2]}"#,
    )
    .unwrap();

    upsert(
        &path,
        &updates(&[
            ("gateway.mode", json!("local")),
            ("gateway.port", json!(18789)),
            ("agents.defaults.model.primary", json!("lmstudio/qwen3-14b")),
        ]),
        false,
    )
    .unwrap();

    let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        written,
        json!({
            "agents": {"defaults": {"workspace": "~/ws", "model": {"primary": "lmstudio/qwen3-14b"}}},
            "gateway": {"auth": {"token": "t"}, "mode": "local", "port": 18789},
            "meta": [1, 2]
        })
    );
}

#[test]
fn test_upsert_twice_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    let set = updates(&[
        ("gateway.port", json!(18789)),
        ("models.providers.lmstudio.baseUrl", json!("http://127.0.0.1:1234/v1")),
    ]);

    upsert(&path, &set, false).unwrap();
    let first = fs::read(&path).unwrap();
    upsert(&path, &set, false).unwrap();
    let second = fs::read(&path).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_key_order_does_not_depend_on_update_order() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.json");
    let b = dir.path().join("b.json");

    upsert(&a, &updates(&[("z", json!(1)), ("a", json!(2))]), false).unwrap();
    upsert(&b, &updates(&[("a", json!(2)), ("z", json!(1))]), false).unwrap();

    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn test_corrupt_document_is_replaced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    fs::write(&path, "{\"gateway\": ").unwrap();

    let doc = upsert(&path, &updates(&[("gateway.mode", json!("local"))]), false).unwrap();
    assert_eq!(doc.as_value(), &json!({"gateway": {"mode": "local"}}));
    assert_eq!(ConfigDocument::load(&path), doc);
}

#[test]
fn test_no_temp_files_left_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    upsert(&path, &updates(&[("a", json!(1))]), false).unwrap();
    upsert(&path, &updates(&[("b", json!(2))]), false).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["openclaw.json"]);
}

#[cfg(unix)]
#[test]
fn test_failed_write_keeps_previous_document() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    upsert(&path, &updates(&[("a", json!(1))]), false).unwrap();
    let before = fs::read(&path).unwrap();

    // No temp file can be created in a read-only directory.
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
    let result = upsert(&path, &updates(&[("a", json!(2))]), false);
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

    // Root ignores directory permissions; only check when the write was refused.
    if result.is_err() {
        assert_eq!(fs::read(&path).unwrap(), before);
    }
}

#[test]
fn test_cli_style_assignments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    let set: Vec<_> = ["gateway.mode=local", "gateway.port=18789", "gateway.tls=false"]
        .iter()
        .map(|a| parse_assignment(a).unwrap())
        .collect();
    let doc = upsert(&path, &set, false).unwrap();

    assert_eq!(
        doc.as_value(),
        &json!({"gateway": {"mode": "local", "port": 18789, "tls": false}})
    );
}

#[test]
fn test_env_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".env");

    upsert_env_line(&path, "OPENAI_API_KEY", "sk-1").unwrap();
    upsert_env_line(&path, "ANTHROPIC_API_KEY", "sk-2").unwrap();
    upsert_env_line(&path, "OPENAI_API_KEY", "sk-3").unwrap();
    let first = fs::read(&path).unwrap();
    upsert_env_line(&path, "OPENAI_API_KEY", "sk-3").unwrap();

    assert_eq!(fs::read(&path).unwrap(), first);
    assert_eq!(
        String::from_utf8(first).unwrap(),
        "OPENAI_API_KEY=sk-3\nANTHROPIC_API_KEY=sk-2\n"
    );
}
