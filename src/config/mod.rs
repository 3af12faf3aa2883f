//! Configuration store (§4.1)
//!
//! YAML-backed settings and repository list, living at
//! `<profile>/.devtrack/config.yaml`. Writes are atomic: serialize to a
//! temporary sibling file, then rename over the target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::git::is_git_working_copy;

const CONFIG_FILE_NAME: &str = "config.yaml";
const CURRENT_VERSION: &str = "1";

/// A tracked repository (§3 Repository entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Scheduling and notification settings, with the defaults synthesized on
/// first load (§4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_interval_minutes")]
    pub prompt_interval_minutes: u32,
    #[serde(default)]
    pub work_hours_enabled: bool,
    #[serde(default = "default_work_start_hour")]
    pub work_start_hour: u8,
    #[serde(default = "default_work_end_hour")]
    pub work_end_hour: u8,
    #[serde(default = "default_notification_output")]
    pub notification_output: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_interval_minutes() -> u32 {
    180
}
fn default_work_start_hour() -> u8 {
    9
}
fn default_work_end_hour() -> u8 {
    18
}
fn default_notification_output() -> String {
    "email".to_string()
}
fn default_retention_days() -> u32 {
    90
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prompt_interval_minutes: default_interval_minutes(),
            work_hours_enabled: false,
            work_start_hour: default_work_start_hour(),
            work_end_hour: default_work_end_hour(),
            notification_output: default_notification_output(),
            retention_days: default_retention_days(),
        }
    }
}

/// Top-level configuration document (§6: `version`, `repositories[]`,
/// `settings{}`, `integrations{}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub integrations: HashMap<String, serde_yaml::Value>,
}

fn default_version() -> String {
    CURRENT_VERSION.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            repositories: Vec::new(),
            settings: Settings::default(),
            integrations: HashMap::new(),
        }
    }
}

impl Config {
    fn file_path(profile_dir: &Path) -> PathBuf {
        profile_dir.join(CONFIG_FILE_NAME)
    }

    /// Load configuration from `<profile_dir>/config.yaml`, synthesizing
    /// defaults if the file does not exist yet.
    pub fn load(profile_dir: &Path) -> AppResult<Self> {
        let path = Self::file_path(profile_dir);

        if !path.exists() {
            info!("No configuration file found at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist configuration atomically: write to a temporary sibling file,
    /// then rename over the target (§4.1).
    pub fn save(&self, profile_dir: &Path) -> AppResult<()> {
        self.validate()?;
        std::fs::create_dir_all(profile_dir)?;

        let path = Self::file_path(profile_dir);
        let tmp_path = profile_dir.join(format!("{CONFIG_FILE_NAME}.tmp"));

        let content = serde_yaml::to_string(self)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    fn validate(&self) -> AppResult<()> {
        if self.settings.prompt_interval_minutes == 0 {
            return Err(AppError::config_invalid(
                "settings.prompt_interval_minutes must be at least 1",
            ));
        }
        if self.settings.work_start_hour > 23 || self.settings.work_end_hour > 24 {
            return Err(AppError::config_invalid(
                "settings.work_start_hour/work_end_hour must be valid hours",
            ));
        }
        Ok(())
    }

    /// Add a repository. Fails with `InvalidRepo` if `path` is not a Git
    /// working copy (§4.1).
    pub fn add_repository(
        &mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        project: Option<String>,
    ) -> AppResult<()> {
        let path = path.into();
        if !is_git_working_copy(&path) {
            return Err(AppError::InvalidRepo(path));
        }

        self.repositories.retain(|r| r.path != path);
        self.repositories.push(Repository {
            name: name.into(),
            path,
            enabled: true,
            project,
            ignore_patterns: Vec::new(),
        });
        Ok(())
    }

    /// Remove a repository by path. No-op if not present.
    pub fn remove_repository(&mut self, path: &Path) {
        self.repositories.retain(|r| r.path != path);
    }

    /// Repositories with `enabled = true`.
    pub fn enabled_repositories(&self) -> Vec<&Repository> {
        self.repositories.iter().filter(|r| r.enabled).collect()
    }

    /// Resolve `${NAME}`-style placeholders in the integrations table against
    /// the process environment. Unresolved placeholders are left verbatim
    /// (never sent to an external service) and are never written back.
    pub fn resolved_integrations(&self) -> HashMap<String, serde_yaml::Value> {
        self.integrations
            .iter()
            .map(|(k, v)| (k.clone(), resolve_placeholders(v)))
            .collect()
    }
}

fn resolve_placeholders(value: &serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(resolve_string(s)),
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_placeholders(v));
            }
            serde_yaml::Value::Mapping(out)
        }
        serde_yaml::Value::Sequence(seq) => {
            serde_yaml::Value::Sequence(seq.iter().map(resolve_placeholders).collect())
        }
        other => other.clone(),
    }
}

/// Resolve a single `${NAME}` placeholder string from the environment.
/// Strings not matching the exact `${NAME}` shape pass through unchanged.
fn resolve_string(s: &str) -> String {
    if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            if let Ok(value) = std::env::var(inner) {
                return value;
            }
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_synthesizes_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.settings.prompt_interval_minutes, 180);
        assert!(!config.settings.work_hours_enabled);
        assert_eq!(config.settings.work_start_hour, 9);
        assert_eq!(config.settings.work_end_hour, 18);
        assert_eq!(config.settings.notification_output, "email");
        assert!(config.integrations.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.settings.prompt_interval_minutes = 45;
        config.settings.work_hours_enabled = true;

        config.save(dir.path()).unwrap();
        let reloaded = Config::load(dir.path()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn add_repository_rejects_non_git_path() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        let not_a_repo = dir.path().join("plain");
        std::fs::create_dir_all(&not_a_repo).unwrap();

        let err = config
            .add_repository("plain", &not_a_repo, None)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRepo(_)));
    }

    #[test]
    fn add_repository_accepts_git_working_copy() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        let repo_path = dir.path().join("repo");
        std::fs::create_dir_all(repo_path.join(".git")).unwrap();

        config
            .add_repository("repo", &repo_path, Some("proj".to_string()))
            .unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.enabled_repositories().len(), 1);
    }

    #[test]
    fn remove_repository_drops_matching_path() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        let repo_path = dir.path().join("repo");
        std::fs::create_dir_all(repo_path.join(".git")).unwrap();
        config.add_repository("repo", &repo_path, None).unwrap();

        config.remove_repository(&repo_path);
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn resolves_env_placeholder_without_persisting() {
        std::env::set_var("DEVTRACK_TEST_TOKEN", "secret-value");
        let mut config = Config::default();
        config.integrations.insert(
            "tracker".to_string(),
            serde_yaml::Value::String("${DEVTRACK_TEST_TOKEN}".to_string()),
        );

        let resolved = config.resolved_integrations();
        assert_eq!(
            resolved.get("tracker").unwrap().as_str().unwrap(),
            "secret-value"
        );
        assert_eq!(
            config.integrations.get("tracker").unwrap().as_str().unwrap(),
            "${DEVTRACK_TEST_TOKEN}"
        );
        std::env::remove_var("DEVTRACK_TEST_TOKEN");
    }
}
