//! Native sing-box JSON config grammar (§4.1): a document with a top-level
//! `outbounds` array whose entries already match `OutboundRecord`'s own
//! `{type, ...}` serde shape, so this grammar is a near-direct
//! deserialization rather than a field-by-field mapping.

use serde::Deserialize;
use serde_json::Value;

use crate::core::error::{ProviderError, Result};
use crate::core::model::OutboundRecord;

#[derive(Deserialize)]
struct SingboxDocument {
    outbounds: Vec<Value>,
}

/// Deserializes each `outbounds[]` entry independently so one malformed
/// record doesn't abort the whole document; malformed entries are skipped
/// with a warning (§4.1 failure semantics).
pub fn parse(text: &str) -> Result<Vec<OutboundRecord>> {
    let doc: SingboxDocument = serde_json::from_str(text).map_err(|_| ProviderError::ParseDocument)?;

    let records = doc
        .outbounds
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<OutboundRecord>(entry.clone()) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(?err, entry = %entry, "skipped unrecognised outbound entry");
                None
            }
        })
        .collect();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "outbounds": [
            {"type": "direct", "tag": "direct"},
            {"type": "shadowsocks", "tag": "ss-a", "server": "example.com", "server_port": 8388, "method": "aes-256-gcm", "password": "hunter2"},
            {"type": "not-a-real-protocol", "tag": "bogus"}
        ]
    }"#;

    #[test]
    fn parses_direct_and_shadowsocks_skips_unknown_type() {
        let records = parse(DOC).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind(), "direct");
        assert_eq!(records[1].kind(), "shadowsocks");
    }

    #[test]
    fn rejects_documents_without_outbounds_key() {
        let err = parse(r#"{"log": {}}"#).unwrap_err();
        assert!(matches!(err, ProviderError::ParseDocument));
    }
}
