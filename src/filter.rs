//! Filter Engine (§4.2): compiles a `FilterConfig` into regexes once, then
//! filters an `OutboundRecord` list in place of the list, preserving order.

use regex::Regex;

use crate::core::config::FilterConfig;
use crate::core::error::{ProviderError, Result};
use crate::core::model::{FilterMode, OutboundRecord, RuleScope, TagSideMap};

struct FilterRule {
    scope: RuleScope,
    regex: Regex,
}

impl FilterRule {
    fn matches(&self, record: &OutboundRecord, side_map: Option<&TagSideMap>) -> bool {
        let subject = match self.scope {
            RuleScope::Type => record.kind().to_string(),
            RuleScope::Server => record.server().to_string(),
            RuleScope::Tag => match side_map {
                Some(map) => map
                    .get(record.tag())
                    .cloned()
                    .unwrap_or_else(|| record.tag().to_string()),
                None => record.tag().to_string(),
            },
        };
        self.regex.is_match(&subject)
    }
}

/// A compiled filter: regex compilation happens once at construction,
/// since a bad pattern is a fatal configuration error (§4.2), never a
/// runtime one.
pub struct Filter {
    mode: FilterMode,
    rules: Vec<FilterRule>,
}

impl Filter {
    pub fn compile(config: &FilterConfig) -> Result<Self> {
        let mut rules = Vec::new();
        for raw in config.raw_rules() {
            let regex = Regex::new(&raw.pattern)
                .map_err(|e| ProviderError::Configuration(format!("invalid filter rule '{}': {e}", raw.pattern)))?;
            rules.push(FilterRule { scope: raw.scope, regex });
        }
        Ok(Filter { mode: config.mode(), rules })
    }

    /// Applies the filter, preserving record order. With no rules
    /// configured, every record passes through unchanged (§4.2: absent
    /// filter behaves as identity).
    pub fn apply(&self, records: &[OutboundRecord], side_map: Option<&TagSideMap>) -> Vec<OutboundRecord> {
        if self.rules.is_empty() {
            return records.to_vec();
        }
        records
            .iter()
            .filter(|record| {
                let matched = self.rules.iter().any(|rule| rule.matches(record, side_map));
                match self.mode {
                    FilterMode::Include => matched,
                    FilterMode::Exclude => !matched,
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DirectOptions, ShadowsocksOptions};
    use crate::core::option::NoneOrSome;

    fn ss(tag: &str, server: &str) -> OutboundRecord {
        OutboundRecord::Shadowsocks(ShadowsocksOptions {
            tag: tag.to_string(),
            server: server.to_string(),
            server_port: 443,
            method: "aes-256-gcm".to_string(),
            password: "x".to_string(),
            dialer_options: None,
        })
    }

    fn config(white_mode: bool, rules: Vec<&str>) -> FilterConfig {
        FilterConfig {
            white_mode,
            rules: NoneOrSome::Some(rules.into_iter().map(str::to_string).collect()),
        }
    }

    #[test]
    fn exclude_mode_drops_matching_records() {
        let filter = Filter::compile(&config(false, vec!["tag:^hk-.*"])).unwrap();
        let records = vec![ss("hk-1", "a.example"), ss("us-1", "b.example")];
        let result = filter.apply(&records, None);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].tag(), "us-1");
    }

    #[test]
    fn include_mode_keeps_only_matching_records() {
        let filter = Filter::compile(&config(true, vec!["server:.*\\.example$"])).unwrap();
        let records = vec![ss("a", "x.example"), ss("b", "y.test")];
        let result = filter.apply(&records, None);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].tag(), "a");
    }

    #[test]
    fn tag_scope_consults_side_map_for_original_tag() {
        let filter = Filter::compile(&config(false, vec!["tag:^hidden$"])).unwrap();
        let mut side_map = TagSideMap::new();
        side_map.insert("renamed".to_string(), "hidden".to_string());
        let records = vec![ss("renamed", "a.example")];
        let result = filter.apply(&records, Some(&side_map));
        assert!(result.is_empty());
    }

    #[test]
    fn types_without_a_server_never_match_nonempty_server_pattern() {
        let filter = Filter::compile(&config(true, vec!["server:.+"])).unwrap();
        let direct = OutboundRecord::Direct(DirectOptions {
            tag: "direct".to_string(),
            override_address: None,
            override_port: None,
            dialer_options: None,
        });
        let result = filter.apply(&[direct], None);
        assert!(result.is_empty());
    }

    #[test]
    fn empty_rule_list_is_identity() {
        let filter = Filter::compile(&config(false, vec![])).unwrap();
        let records = vec![ss("a", "x.example")];
        assert_eq!(filter.apply(&records, None).len(), 1);
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        let err = Filter::compile(&config(false, vec!["tag:("])).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }
}
