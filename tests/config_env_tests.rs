//! Environment overrides mutate process state, so these tests run serially.

use estela::config::ConfigError;
use estela::TracerConfig;
use serial_test::serial;
use std::path::PathBuf;

const VARS: &[&str] = &[
    "ESTELA_OUTPUT",
    "ESTELA_ID_OFFSET",
    "ESTELA_STACKFRAMES",
    "ESTELA_SKIP_FRAMES",
    "ESTELA_HELPER",
    "ESTELA_BUFFER_CAPACITY",
    "ESTELA_BATCH_SIZE",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_no_env_keeps_config() {
    clear_env();
    let config = TracerConfig::default().with_env_overrides().unwrap();
    assert_eq!(config, TracerConfig::default());
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("estela.toml");
    std::fs::write(
        &path,
        "output = \"from-file.rpd\"\nid_offset = 5\n\n[buffer]\ncapacity = 128\nbatch_size = 32\n",
    )
    .unwrap();

    std::env::set_var("ESTELA_ID_OFFSET", "9000");
    std::env::set_var("ESTELA_STACKFRAMES", "native");
    std::env::set_var("ESTELA_HELPER", "/opt/helper");
    let config = TracerConfig::load(&path)
        .unwrap()
        .with_env_overrides()
        .unwrap();
    clear_env();

    assert_eq!(config.output, PathBuf::from("from-file.rpd"));
    assert_eq!(config.id_offset, 9000);
    assert_eq!(config.stack_frames, "native");
    assert_eq!(config.helper_command, Some(PathBuf::from("/opt/helper")));
    assert_eq!(config.buffer.capacity, 128);
    assert_eq!(config.pipeline().id_offset, 9000);
}

#[test]
#[serial]
fn test_bad_env_value_rejected() {
    clear_env();
    std::env::set_var("ESTELA_BUFFER_CAPACITY", "-1");
    let result = TracerConfig::default().with_env_overrides();
    clear_env();

    assert!(matches!(
        result,
        Err(ConfigError::InvalidEnv {
            var: "ESTELA_BUFFER_CAPACITY",
            ..
        })
    ));
}

#[test]
#[serial]
fn test_env_geometry_validated() {
    clear_env();
    std::env::set_var("ESTELA_BUFFER_CAPACITY", "8");
    std::env::set_var("ESTELA_BATCH_SIZE", "16");
    let config = TracerConfig::default().with_env_overrides().unwrap();
    clear_env();

    assert!(matches!(config.validate(), Err(ConfigError::InvalidBuffer(_))));
}

#[test]
fn test_missing_file_reports_path() {
    let err = TracerConfig::load(std::path::Path::new("/nonexistent/estela.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/estela.toml"));
}
