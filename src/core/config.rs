//! Configuration management: `AppConfig` (the host process's own document,
//! §9-A) and `ProviderConfig` (§3, the options recognised per-provider,
//! §6). Layered loading mirrors the path-dependency crate's own
//! `AppConfig::load()`: a `config`-crate builder seeded with defaults, an
//! optional `config.toml` overlay, `try_deserialize()` into typed structs.

use std::path::Path;

use bon::Builder;
use config::{Config, File};
use serde::Deserialize;

use crate::core::error::{ProviderError, Result};
use crate::core::model::{DialerOptions, FilterMode, GroupBaseOptions, GroupKind, RuleScope};
use crate::core::option::NoneOrSome;

/// The host process's own configuration document.
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AppConfig {
    /// Parent directory for relative `cache_file` paths.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_level: default_log_level(),
            providers: Vec::new(),
        }
    }
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_download_ua() -> String {
    "clash.meta; sing-box".to_string()
}

/// One rule in a `Filter` before compilation (§3, §4.2). The raw pattern
/// string carries an optional `tag:`/`type:`/`server:` scope prefix; bare
/// patterns default to `tag` scope, matching the original's rule grammar.
#[derive(Debug, Clone)]
pub struct RawFilterRule {
    pub scope: RuleScope,
    pub pattern: String,
}

impl RawFilterRule {
    pub fn parse(raw: &str) -> Self {
        if let Some(pattern) = raw.strip_prefix("tag:") {
            RawFilterRule { scope: RuleScope::Tag, pattern: pattern.to_string() }
        } else if let Some(pattern) = raw.strip_prefix("type:") {
            RawFilterRule { scope: RuleScope::Type, pattern: pattern.to_string() }
        } else if let Some(pattern) = raw.strip_prefix("server:") {
            RawFilterRule { scope: RuleScope::Server, pattern: pattern.to_string() }
        } else {
            RawFilterRule { scope: RuleScope::Tag, pattern: raw.to_string() }
        }
    }
}

/// `{white_mode, rules}` as read from config, before the rules are compiled
/// into regexes (compilation happens in `filter::Filter::compile`).
#[derive(Debug, Deserialize, Builder, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub white_mode: bool,
    #[serde(default)]
    pub rules: NoneOrSome<String>,
}

impl FilterConfig {
    pub fn mode(&self) -> FilterMode {
        if self.white_mode {
            FilterMode::Include
        } else {
            FilterMode::Exclude
        }
    }

    pub fn raw_rules(&self) -> Vec<RawFilterRule> {
        self.rules.iter().map(|r| RawFilterRule::parse(r)).collect()
    }
}

#[derive(Debug, Deserialize, Builder, Clone)]
pub struct GroupSpecConfig {
    pub tag: String,
    pub kind: GroupKind,
    #[serde(default)]
    pub base_options: GroupBaseOptions,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

/// Immutable per-provider configuration (§3 `ProviderConfig`, §6 recognised
/// options).
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct ProviderConfig {
    pub tag: String,
    pub url: String,
    #[serde(default = "default_download_ua")]
    pub download_ua: String,
    #[serde(default)]
    pub cache_file: Option<String>,
    #[serde(default)]
    pub update_interval_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub use_h3: bool,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub tag_format: Option<String>,
    #[serde(default)]
    pub global_filter: Option<FilterConfig>,
    #[serde(default)]
    pub groups: Vec<GroupSpecConfig>,
    #[serde(default)]
    pub request_dialer: Option<DialerOptions>,
    #[serde(default)]
    pub dialer: Option<DialerOptions>,
    #[serde(default)]
    pub lookup_ip: bool,
    #[serde(default)]
    pub running_detour: Option<String>,
}

impl ProviderConfig {
    /// Construction-time validation (§7 *Configuration* errors are fatal
    /// here, before any I/O is attempted).
    pub fn validate(&self) -> Result<()> {
        if self.tag.is_empty() {
            return Err(ProviderError::Configuration("provider tag must not be empty".into()));
        }
        if self.url.is_empty() {
            return Err(ProviderError::Configuration(format!(
                "provider '{}': url must not be empty",
                self.tag
            )));
        }
        if let Some(template) = &self.tag_format {
            if template.matches("%s").count() != 1 {
                return Err(ProviderError::Configuration(format!(
                    "provider '{}': tag_format must contain exactly one %s",
                    self.tag
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.tag.clone());
        for group in &self.groups {
            if !seen.insert(group.tag.clone()) {
                return Err(ProviderError::Configuration(format!(
                    "provider '{}': duplicate group/umbrella tag '{}'",
                    self.tag, group.tag
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load layered configuration the way the existing binary always has:
    /// defaults, then an optional `config.toml` overlay.
    pub fn load() -> Result<Self> {
        let config_path = Path::new("config.toml");
        let builder = Config::builder();

        let builder = if config_path.exists() {
            builder.add_source(File::from(config_path))
        } else {
            builder
        };

        let settings = builder.build().map_err(ProviderError::Config)?;
        let config: AppConfig = settings.try_deserialize().map_err(ProviderError::Config)?;
        for provider in &config.providers {
            provider.validate()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_filter_rule_defaults_to_tag_scope() {
        let rule = RawFilterRule::parse("abc.*");
        assert_eq!(rule.scope, RuleScope::Tag);
        assert_eq!(rule.pattern, "abc.*");
    }

    #[test]
    fn raw_filter_rule_honors_scope_prefix() {
        let rule = RawFilterRule::parse("type:http");
        assert_eq!(rule.scope, RuleScope::Type);
        assert_eq!(rule.pattern, "http");
    }

    #[test]
    fn provider_config_rejects_bad_tag_format() {
        let cfg = ProviderConfig::builder()
            .tag("p".to_string())
            .url("https://example.com".to_string())
            .download_ua(default_download_ua())
            .tag_format("%s-%s".to_string())
            .lookup_ip(false)
            .build();
        assert!(cfg.validate().is_err());
    }
}
