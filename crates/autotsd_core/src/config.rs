use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::derive::{IdDefinition, default_id_definitions};
use crate::vocabulary::Vocabulary;

pub const DEFAULT_CONFIG_FILENAME: &str = "autotsd.toml";
pub const DEFAULT_DOMAIN: &str = "sol-jira";
pub const DEFAULT_SPACE: &str = "AT";
pub const DEFAULT_USER_AGENT: &str = "autotsd/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 100;
pub const DEFAULT_PAGE_SIZE: usize = 50;

const EMBEDDED_DEFAULT_CONFIG: &str = include_str!("../../../config/autotsd.toml");

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AutoTsdConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub vocabulary: Vocabulary,
    #[serde(default = "default_id_definitions")]
    pub derived_ids: Vec<IdDefinition>,
    #[serde(default)]
    pub sync: SyncSection,
}

impl Default for AutoTsdConfig {
    fn default() -> Self {
        Self {
            confluence: ConfluenceSection::default(),
            vocabulary: Vocabulary::default(),
            derived_ids: default_id_definitions(),
            sync: SyncSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub domain: Option<String>,
    pub base_url: Option<String>,
    pub space: Option<String>,
    pub email: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub page_size: Option<usize>,
}

impl ConfluenceSection {
    /// Resolve the site name: env CONFLUENCE_DOMAIN > config > DEFAULT_DOMAIN.
    pub fn domain(&self) -> String {
        env_override("CONFLUENCE_DOMAIN")
            .or_else(|| self.domain.clone())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
    }

    /// Resolve the site URL: env CONFLUENCE_BASE_URL > config > derived from the domain.
    pub fn base_url(&self) -> String {
        env_override("CONFLUENCE_BASE_URL")
            .or_else(|| self.base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| domain_base_url(&self.domain()))
    }

    /// Resolve the space key: env CONFLUENCE_SPACE > config > DEFAULT_SPACE.
    pub fn space(&self) -> String {
        env_override("CONFLUENCE_SPACE")
            .or_else(|| self.space.clone())
            .unwrap_or_else(|| DEFAULT_SPACE.to_string())
    }

    /// Resolve the account email: env FORGE_EMAIL > config.
    pub fn email(&self) -> Option<String> {
        env_override("FORGE_EMAIL").or_else(|| self.email.clone())
    }

    /// API token is env-only and never stored in the config file.
    pub fn api_token(&self) -> Option<String> {
        env_override("FORGE_API_TOKEN")
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub concurrency: Option<usize>,
    pub execute: Option<bool>,
}

impl SyncSection {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(1).max(1)
    }

    pub fn execute(&self) -> bool {
        self.execute.unwrap_or(false)
    }
}

impl AutoTsdConfig {
    pub fn validate(&self) -> Result<()> {
        let vocabulary = &self.vocabulary;
        if vocabulary.status_prefix.trim().is_empty() {
            bail!("[vocabulary] status_prefix cannot be empty");
        }
        if !vocabulary
            .property_keys
            .iter()
            .any(|key| key == &vocabulary.status_key)
        {
            bail!(
                "[vocabulary] status_key '{}' must be one of property_keys",
                vocabulary.status_key
            );
        }
        if vocabulary.marker_labels.is_empty() {
            bail!("[vocabulary] marker_labels cannot be empty");
        }
        let value_labels = vocabulary.value_labels();
        for marker in &vocabulary.marker_labels {
            if value_labels.contains(marker) || vocabulary.is_status_label(marker) {
                bail!("[vocabulary] marker label '{marker}' overlaps the managed vocabulary");
            }
        }
        for definition in &self.derived_ids {
            if definition.source_key_prefix.trim().is_empty()
                || definition.derived_key.trim().is_empty()
            {
                bail!("[[derived_ids]] entries need source_key_prefix and derived_key");
            }
            if !definition.pattern.has_capture_group() {
                bail!(
                    "[[derived_ids]] pattern '{}' for '{}' needs a capture group for the id",
                    definition.pattern,
                    definition.derived_key
                );
            }
        }
        Ok(())
    }

    /// Batch query: every page in `space` tagged with one of the marker labels.
    pub fn batch_query(&self, space: &str) -> String {
        let markers = self
            .vocabulary
            .marker_labels
            .iter()
            .map(|label| format!("label={}", cql_string(label)))
            .collect::<Vec<_>>()
            .join(" or ");
        format!(
            "space={} and type=page and ({markers})",
            cql_string(space.trim())
        )
    }
}

/// Load and validate the config. Returns defaults if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AutoTsdConfig> {
    if !config_path.exists() {
        return Ok(AutoTsdConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AutoTsdConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    Ok(parsed)
}

/// Write the bundled default config. Returns `false` when the file exists and `force` is off.
pub fn write_default_config(config_path: &Path, force: bool) -> Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(config_path, EMBEDDED_DEFAULT_CONFIG)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

pub fn domain_base_url(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    if trimmed.ends_with(".atlassian.net") {
        return format!("https://{trimmed}");
    }
    format!("https://{trimmed}.atlassian.net")
}

/// Double-quoted CQL string literal.
fn cql_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::IdPattern;
    use tempfile::tempdir;

    #[test]
    fn embedded_default_matches_builtin_defaults() {
        let parsed: AutoTsdConfig =
            toml::from_str(EMBEDDED_DEFAULT_CONFIG).expect("parse embedded config");
        parsed.validate().expect("valid");
        assert_eq!(parsed.vocabulary, Vocabulary::default());
        assert_eq!(parsed.derived_ids, default_id_definitions());
        assert_eq!(parsed.confluence.domain.as_deref(), Some(DEFAULT_DOMAIN));
        assert_eq!(parsed.confluence.space.as_deref(), Some(DEFAULT_SPACE));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/autotsd.toml")).expect("load config");
        assert_eq!(config, AutoTsdConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("autotsd.toml");
        fs::write(
            &config_path,
            r#"
[confluence]
base_url = "https://wiki.example.org/"
space = "SE"

[vocabulary]
property_keys = ["Industry", "Phase"]
status_key = "Phase"
status_prefix = "phase-"
values = ["Retail"]
marker_labels = ["tsd"]

[[derived_ids]]
source_key_prefix = "CRM Link"
derived_key = "AccountID"
pattern = '/Account/(\w+)'

[sync]
concurrency = 4
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.confluence.space.as_deref(), Some("SE"));
        assert_eq!(config.vocabulary.status_prefix, "phase-");
        assert_eq!(config.derived_ids.len(), 1);
        assert_eq!(config.derived_ids[0].pattern.as_str(), r"/Account/(\w+)");
        assert_eq!(
            config.derived_ids[0]
                .pattern
                .capture("https://crm.example/Account/0017x00000Q1/view"),
            Some("0017x00000Q1".to_string())
        );
        assert_eq!(config.sync.concurrency(), 4);
        assert!(!config.sync.execute());
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("autotsd.toml");
        fs::write(&config_path, "[sync]\nexecute = true\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.sync.execute());
        assert_eq!(config.vocabulary, Vocabulary::default());
        assert_eq!(config.derived_ids, default_id_definitions());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("autotsd.toml");
        fs::write(&config_path, "[vocabulary\nstatus_key = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn validate_rejects_empty_status_prefix() {
        let mut config = AutoTsdConfig::default();
        config.vocabulary.status_prefix = String::new();
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("status_prefix"));
    }

    #[test]
    fn validate_rejects_marker_inside_vocabulary() {
        let mut config = AutoTsdConfig::default();
        config.vocabulary.values.push("se-tsd".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_pattern_without_capture_group() {
        let mut config = AutoTsdConfig::default();
        config.derived_ids[0].pattern = IdPattern::new("/view").expect("pattern");
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("OpportunityID"));
    }

    #[test]
    fn load_config_rejects_unparseable_pattern() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("autotsd.toml");
        fs::write(
            &config_path,
            "[[derived_ids]]\nsource_key_prefix = \"CRM\"\nderived_key = \"AccountID\"\npattern = '/(['\n",
        )
        .expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(format!("{error:#}").contains("invalid id pattern"));
    }

    #[test]
    fn write_default_config_respects_force() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("nested").join("autotsd.toml");
        assert!(write_default_config(&config_path, false).expect("write"));
        fs::write(&config_path, "[sync]\n").expect("overwrite");
        assert!(!write_default_config(&config_path, false).expect("skip"));
        assert!(write_default_config(&config_path, true).expect("force"));
        let config = load_config(&config_path).expect("load");
        assert_eq!(config.confluence.domain.as_deref(), Some(DEFAULT_DOMAIN));
    }

    #[test]
    fn batch_query_lists_marker_labels() {
        let config = AutoTsdConfig::default();
        assert_eq!(
            config.batch_query("AT"),
            "space=\"AT\" and type=page and (label=\"se-tsd\" or label=\"se-opportunity\")"
        );
    }

    #[test]
    fn batch_query_quotes_and_escapes_values() {
        let mut config = AutoTsdConfig::default();
        config.vocabulary.marker_labels = vec!["tsd\"x".to_string()];
        assert_eq!(
            config.batch_query(" Sales Eng\\\"Q\" "),
            r#"space="Sales Eng\\\"Q\"" and type=page and (label="tsd\"x")"#
        );
    }

    #[test]
    fn domain_base_url_variants() {
        assert_eq!(domain_base_url("sol-jira"), "https://sol-jira.atlassian.net");
        assert_eq!(
            domain_base_url("sol-jira.atlassian.net"),
            "https://sol-jira.atlassian.net"
        );
        assert_eq!(
            domain_base_url("https://wiki.example.org/"),
            "https://wiki.example.org"
        );
    }

    #[test]
    fn sync_section_concurrency_is_at_least_one() {
        let section = SyncSection {
            concurrency: Some(0),
            execute: None,
        };
        assert_eq!(section.concurrency(), 1);
    }
}
