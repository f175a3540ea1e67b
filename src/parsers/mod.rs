//! Link/Config Parsers (§4.1): turns a fetched byte buffer into
//! `OutboundRecord`s by trying, in fixed order, Clash YAML, the raw-link
//! list grammar, and native sing-box JSON. The first grammar that parses
//! without error and yields at least one record wins.

pub mod clash;
pub mod raw;
pub mod singbox;

use std::collections::HashSet;

use tracing::debug;

use crate::core::error::{ProviderError, Result};
use crate::core::model::OutboundRecord;

/// Parses a fetched subscription document. Order is significant: some
/// raw-link payloads are valid YAML scalars and must not be misread as
/// Clash, so Clash is tried first and only accepted when it actually finds
/// a `proxies` list.
pub fn parse_document(bytes: &[u8]) -> Result<Vec<OutboundRecord>> {
    let text = String::from_utf8_lossy(bytes);

    if let Ok(records) = clash::parse(&text) {
        if !records.is_empty() {
            debug!(grammar = "clash", count = records.len(), "subscription parsed");
            return Ok(dedupe_tags(records));
        }
    }

    if let Ok(records) = raw::parse(&text) {
        if !records.is_empty() {
            debug!(grammar = "raw-link", count = records.len(), "subscription parsed");
            return Ok(dedupe_tags(records));
        }
    }

    if let Ok(records) = singbox::parse(&text) {
        if !records.is_empty() {
            debug!(grammar = "sing-box", count = records.len(), "subscription parsed");
            return Ok(dedupe_tags(records));
        }
    }

    Err(ProviderError::ParseDocument)
}

/// Parses a single raw link (e.g. from `sing-box parse-link`), not a
/// whole subscription document.
pub fn parse_single_link(link: &str) -> Result<OutboundRecord> {
    raw::parse_one(link).ok_or_else(|| ProviderError::ParseDocument)
}

/// Synthesizes `type-host:port`, appending a numeric suffix on collision.
pub(crate) fn synthesize_tag(kind: &str, host: &str, port: u16, used: &mut HashSet<String>) -> String {
    let base = format!("{kind}-{host}:{port}");
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn dedupe_tags(mut records: Vec<OutboundRecord>) -> Vec<OutboundRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    for record in &mut records {
        let tag = record.tag().to_string();
        if seen.insert(tag.clone()) {
            continue;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{tag} ({n})");
            if seen.insert(candidate.clone()) {
                record.set_tag(candidate);
                break;
            }
            n += 1;
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_document_rejects_unrecognised_blob() {
        let err = parse_document(b"not a subscription at all").unwrap_err();
        assert!(matches!(err, ProviderError::ParseDocument));
    }

    #[test]
    fn synthesize_tag_appends_suffix_on_collision() {
        let mut used = HashSet::new();
        let a = synthesize_tag("ss", "example.com", 443, &mut used);
        let b = synthesize_tag("ss", "example.com", 443, &mut used);
        assert_eq!(a, "ss-example.com:443");
        assert_eq!(b, "ss-example.com:443-2");
    }
}
