use std::io::Write;
use std::time::Duration;

use clap::Parser;
use serial_test::serial;
use shopdesk::config::{self, CliArgs, LoadError, LogFormat};
use tempfile::NamedTempFile;

const STALE_ENV: &str = "SHOPDESK__QUERY__STALE_TIME_MS";

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("tmp file");
    file.write_all(contents.as_bytes()).expect("write tmp");
    file
}

fn cli(file: &NamedTempFile, extra: &[&str]) -> CliArgs {
    let path = file.path().to_str().expect("utf-8 path");
    let mut args = vec!["shopdesk", "--config-file", path];
    args.extend_from_slice(extra);
    args.extend_from_slice(&["get", "/products"]);
    CliArgs::parse_from(args)
}

#[test]
#[serial]
fn file_values_are_loaded() {
    let file = toml_file(
        r#"
[logging]
level = "debug"
json = true

[api]
base_url = "admin.shop.example"
token = "from-file"
timeout_seconds = 12

[query]
stale_time_ms = 5000
cache_time_ms = 60000
"#,
    );

    let settings = config::load(&cli(&file, &[])).expect("settings load");

    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.api.base_url.as_str(), "https://admin.shop.example/");
    assert_eq!(settings.api.token.as_deref(), Some("from-file"));
    assert_eq!(settings.api.timeout, Duration::from_secs(12));
    assert_eq!(settings.query.stale_time_ms, 5_000);
    assert_eq!(settings.query.cache_time_ms, 60_000);
}

#[test]
#[serial]
#[allow(unsafe_code)]
fn environment_overrides_file_and_cli_overrides_environment() {
    let file = toml_file("[query]\nstale_time_ms = 1000\n");

    // SAFETY: serialized with every other test that reads the environment
    unsafe {
        std::env::set_var(STALE_ENV, "2000");
    }

    let from_env = config::load(&cli(&file, &[]));
    let from_cli = config::load(&cli(&file, &["--stale-time-ms", "3000"]));

    unsafe {
        std::env::remove_var(STALE_ENV);
    }

    assert_eq!(from_env.expect("settings load").query.stale_time_ms, 2_000);
    assert_eq!(from_cli.expect("settings load").query.stale_time_ms, 3_000);
}

#[test]
#[serial]
fn invalid_file_value_names_the_key() {
    let file = toml_file("[api]\ntimeout_seconds = 0\n");

    let err = config::load(&cli(&file, &[])).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "api.timeout_seconds",
            ..
        }
    ));
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    let args = CliArgs::parse_from([
        "shopdesk",
        "--config-file",
        "/nonexistent/shopdesk.toml",
        "get",
        "/products",
    ]);

    let err = config::load(&args).expect_err("missing file");
    assert!(matches!(err, LoadError::Build(_)));
}
