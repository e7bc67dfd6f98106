#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests.
//!
//! These keep Cargo.toml in line with the crate's panic-free policy and its
//! feature layout. All checks are synchronous filesystem reads.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    text.parse::<toml::Table>()
        .unwrap_or_else(|e| panic!("Cargo.toml does not parse: {e}"))
}

const REQUIRED_DENY_LINTS: &[&str] = &[
    "unwrap_used",
    "expect_used",
    "panic",
    "todo",
    "unimplemented",
    "indexing_slicing",
];

#[test]
fn panic_prone_lints_are_denied() {
    let manifest = manifest();
    let clippy = manifest["lints"]["clippy"]
        .as_table()
        .expect("Cargo.toml must have a [lints.clippy] section");

    for lint in REQUIRED_DENY_LINTS {
        assert_eq!(
            clippy.get(*lint).and_then(toml::Value::as_str),
            Some("deny"),
            "`{lint}` must be set to deny in [lints.clippy] to keep library code panic-free"
        );
    }
}

#[test]
fn websocket_pinger_is_default_and_optional() {
    let manifest = manifest();
    let features = manifest["features"].as_table().unwrap();
    let default: Vec<&str> = features["default"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(toml::Value::as_str)
        .collect();
    assert_eq!(default, vec!["transport-websocket"]);

    let deps = manifest["dependencies"].as_table().unwrap();
    for dep in ["tokio-tungstenite", "futures-util"] {
        assert_eq!(
            deps[dep]["optional"].as_bool(),
            Some(true),
            "{dep} must stay optional behind transport-websocket"
        );
    }
}

#[test]
fn demo_requires_runtime_feature() {
    let manifest = manifest();
    let examples = manifest["example"].as_array().unwrap();
    for example in examples {
        let path = example["path"].as_str().unwrap();
        assert!(
            project_root().join(path).is_file(),
            "example path '{path}' does not exist"
        );
        let required: Vec<&str> = example["required-features"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert!(required.contains(&"tokio-runtime"));
    }
}

#[test]
fn rust_version_is_declared() {
    let manifest = manifest();
    let version = manifest["package"]["rust-version"]
        .as_str()
        .expect("Cargo.toml must declare a rust-version");
    assert!(version.split('.').count() >= 2, "malformed rust-version {version}");
}
