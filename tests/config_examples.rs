use std::{fs, path::PathBuf};

use hookcatch::config::{Config, LogFormat};

#[test]
fn bundled_example_configs_parse() {
    let configs_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs");
    let entries = fs::read_dir(&configs_dir).expect("configs directory should exist");

    let mut parsed_count = 0usize;
    for entry in entries {
        let entry = entry.expect("directory entry should be readable");
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }

        Config::from_path(&path)
            .unwrap_or_else(|err| panic!("example config {} should parse: {err:#}", path.display()));
        parsed_count += 1;
    }

    assert!(parsed_count >= 1, "expected at least one TOML example config");
}

#[test]
fn example_config_documents_the_defaults() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("configs")
        .join("hookcatch.example.toml");
    let example = Config::from_path(&path).expect("example config should parse");
    let defaults = Config::default();

    assert_eq!(example.server.listen_target(), defaults.server.listen_target());
    assert_eq!(example.backend.host, defaults.backend.host);
    assert_eq!(example.backend.port, defaults.backend.port);
    assert_eq!(example.backend.password, None);
    assert_eq!(
        example.rate_limit.requests_per_second,
        defaults.rate_limit.requests_per_second
    );
    assert_eq!(example.rate_limit.burst, defaults.rate_limit.burst);
    assert_eq!(example.health.interval_secs, defaults.health.interval_secs);
    assert_eq!(example.logging.format, Some(LogFormat::Json));
}

#[test]
fn config_file_round_trips_through_tempdir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hookcatch.toml");
    fs::write(
        &path,
        r#"
[backend]
host = "10.0.0.5"
db = 7

[health]
interval_secs = 5
"#,
    )
    .expect("write config");

    let config = Config::load(Some(&path)).expect("config should load");
    assert_eq!(config.backend.host, "10.0.0.5");
    assert_eq!(config.backend.db, 7);
    assert_eq!(config.health.interval_secs, 5);

    let missing = dir.path().join("absent.toml");
    let err = Config::load(Some(&missing)).unwrap_err();
    assert!(format!("{err:#}").contains("read config"), "got {err:#}");
}
