//! Integration tests for the configuration store: defaults, the
//! load/save round trip, and repository validation.

use devtrackd::config::Config;
use devtrackd::error::AppError;
use tempfile::tempdir;

#[test]
fn test_config_defaults() {
    let config = Config::default();

    assert_eq!(config.settings.prompt_interval_minutes, 180);
    assert!(!config.settings.work_hours_enabled);
    assert!(config.repositories.is_empty());

    println!("✓ Configuration defaults are correct");
}

#[test]
fn test_config_round_trips_through_disk() {
    let dir = tempdir().unwrap();

    let mut config = Config::default();
    config.settings.prompt_interval_minutes = 45;
    config.add_repository("demo", dir.path(), Some("PROJ".to_string())).unwrap();
    config.save(dir.path()).unwrap();

    let loaded = Config::load(dir.path()).unwrap();
    assert_eq!(loaded.settings.prompt_interval_minutes, 45);
    assert_eq!(loaded.repositories.len(), 1);
    assert_eq!(loaded.repositories[0].name, "demo");

    println!("✓ Configuration round-trips through config.yaml");
}

#[test]
fn test_load_with_no_file_synthesizes_defaults() {
    let dir = tempdir().unwrap();

    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config, Config::default());

    println!("✓ Missing config.yaml falls back to defaults");
}

#[test]
fn test_add_repository_rejects_non_git_path() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();

    let err = config.add_repository("demo", dir.path(), None).unwrap_err();
    assert!(matches!(err, AppError::InvalidRepo(_)));
    assert!(config.repositories.is_empty());

    println!("✓ Non-repository paths are rejected");
}
