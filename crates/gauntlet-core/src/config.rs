//! Configuration management for gauntlet
//!
//! Repository-level settings live in `.gauntlet/config.toml`: the pipeline's
//! phases and steps, fail-fast policy, and where captured output is written.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Phase, Step};
use crate::{GauntletError, Result};

/// Config file location relative to the repository root
pub const CONFIG_PATH: &str = ".gauntlet/config.toml";

/// Repository-level gauntlet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GauntletConfig {
    /// Kill running siblings when a step fails
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Directory for per-step and consolidated logs
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Write a consolidated log of every step
    #[serde(default = "default_true")]
    pub consolidated_log: bool,

    /// Re-hash the tree after a pipeline and refuse to cache if it changed
    #[serde(default = "default_true")]
    pub stability_check: bool,

    /// Ordered pipeline phases
    #[serde(default)]
    pub phases: Vec<Phase>,
}

/// Supported project languages for default pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
}

fn default_true() -> bool {
    true
}

impl Default for GauntletConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            log_dir: None,
            consolidated_log: true,
            stability_check: true,
            phases: Vec::new(),
        }
    }
}

impl GauntletConfig {
    /// Load from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            GauntletError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load `.gauntlet/config.toml` or fall back to a language default
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(CONFIG_PATH);

        if config_path.exists() {
            return Self::load(&config_path);
        }

        let mut config = Self::default();
        if let Some(lang) = Self::detect_language(repo_root) {
            tracing::debug!(?lang, "No config file, using language defaults");
            config.phases = Self::default_phases_for_language(lang);
        }
        Ok(config)
    }

    /// Directory for step logs
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gauntlet"))
    }

    /// Detect the primary programming language of a repository
    pub fn detect_language(repo_root: &Path) -> Option<Language> {
        if repo_root.join("Cargo.toml").exists() {
            Some(Language::Rust)
        } else if repo_root.join("pyproject.toml").exists() {
            Some(Language::Python)
        } else if repo_root.join("package.json").exists() {
            Some(Language::JavaScript)
        } else {
            None
        }
    }

    /// Default pipeline for a language
    pub fn default_phases_for_language(lang: Language) -> Vec<Phase> {
        match lang {
            Language::Rust => vec![
                Phase::new(
                    "check",
                    vec![
                        Step::new("fmt", "cargo fmt --check"),
                        Step::new("clippy", "cargo clippy --all-targets -- -D warnings"),
                    ],
                ),
                Phase::new("test", vec![Step::new("test", "cargo test")]),
            ],
            Language::Python => vec![
                Phase::new(
                    "check",
                    vec![Step::new("ruff", "ruff check ."), Step::new("mypy", "mypy .")],
                ),
                Phase::new("test", vec![Step::new("pytest", "pytest")]),
            ],
            Language::JavaScript => vec![
                Phase::new("check", vec![Step::new("lint", "npm run lint")]),
                Phase::new("test", vec![Step::new("test", "npm test")]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let toml = r#"
fail_fast = false
log_dir = "/tmp/logs"

[[phases]]
name = "lint"

[[phases.steps]]
name = "clippy"
command = "cargo clippy"

[[phases.steps]]
name = "fmt"
command = "cargo fmt --check"
cwd = "crates/core"

[[phases]]
name = "test"
parallel = false

[[phases.steps]]
name = "test"
command = "cargo test"
"#;
        let config: GauntletConfig = toml::from_str(toml).unwrap();

        assert!(!config.fail_fast);
        assert!(config.consolidated_log);
        assert_eq!(config.resolved_log_dir(), PathBuf::from("/tmp/logs"));
        assert_eq!(config.phases.len(), 2);
        assert!(config.phases[0].parallel);
        assert!(!config.phases[1].parallel);
        assert_eq!(config.phases[0].steps[1].cwd.as_deref(), Some("crates/core"));
    }

    #[test]
    fn test_load_or_default_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = GauntletConfig::load_or_default(temp_dir.path()).unwrap();
        assert!(config.phases.is_empty());
        assert!(config.fail_fast);
    }

    #[test]
    fn test_load_or_default_detects_rust() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("Cargo.toml"), "[package]\n").unwrap();

        let config = GauntletConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.phases.len(), 2);
        assert_eq!(config.phases[1].steps[0].command, "cargo test");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(".gauntlet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "fail_fast = \"maybe\"").unwrap();

        let err = GauntletConfig::load_or_default(temp_dir.path()).unwrap_err();
        assert!(matches!(err, GauntletError::Config(_)));
    }
}
