use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jobfinder_adapters::SourceConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id `{}`", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub adapter_timeout_secs: u64,
    pub min_match_score: u8,
    pub notify_score_threshold: u8,
    pub notify_failure_threshold: u32,
    pub push_timeout_secs: u64,
    pub dashboard_url: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            artifacts_dir: PathBuf::from("./artifacts"),
            workspace_root: PathBuf::from("."),
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            user_agent: "jobfinder-bot/0.1".to_string(),
            http_timeout_secs: 20,
            adapter_timeout_secs: 60,
            min_match_score: 40,
            notify_score_threshold: 90,
            notify_failure_threshold: 5,
            push_timeout_secs: 10,
            dashboard_url: "/".to_string(),
            web_port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl SyncConfig {
    /// Unset or unparsable variables fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            workspace_root: std::env::var("JOBFINDER_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            scheduler_enabled: env_bool("JOBFINDER_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron: std::env::var("JOBFINDER_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("JOBFINDER_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JOBFINDER_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            adapter_timeout_secs: env_parse(
                "JOBFINDER_ADAPTER_TIMEOUT_SECS",
                defaults.adapter_timeout_secs,
            ),
            min_match_score: env_parse("JOBFINDER_MIN_MATCH_SCORE", defaults.min_match_score)
                .min(100),
            notify_score_threshold: env_parse(
                "JOBFINDER_NOTIFY_SCORE_THRESHOLD",
                defaults.notify_score_threshold,
            )
            .min(100),
            notify_failure_threshold: env_parse(
                "JOBFINDER_NOTIFY_FAILURE_THRESHOLD",
                defaults.notify_failure_threshold,
            )
            .max(1),
            push_timeout_secs: env_parse("JOBFINDER_PUSH_TIMEOUT_SECS", defaults.push_timeout_secs),
            dashboard_url: std::env::var("JOBFINDER_DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            web_port: env_parse("JOBFINDER_WEB_PORT", defaults.web_port),
        }
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs.max(1))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs.max(1))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfinder_adapters::SourceKind;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn workspace_sources_yaml_parses() {
        let registry = SourceRegistry::load(&workspace_root()).expect("sources.yaml");
        assert!(registry.enabled().count() >= 2);
        assert!(registry
            .sources
            .iter()
            .any(|s| s.kind == SourceKind::HtmlListing && !s.enabled));
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let yaml = r#"
sources:
  - { source_id: a, display_name: A, enabled: true, kind: fixture, fixture_path: a.json }
  - { source_id: a, display_name: A2, enabled: true, kind: fixture, fixture_path: b.json }
"#;
        assert!(SourceRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.min_match_score, 40);
        assert_eq!(config.notify_score_threshold, 90);
        assert_eq!(config.notify_failure_threshold, 5);
        assert_eq!(config.adapter_timeout(), Duration::from_secs(60));
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
    }
}
