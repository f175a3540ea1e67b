//! Clash YAML grammar (§4.1): a document with a top-level `proxies` list,
//! one entry per node in Clash's own field names.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::core::error::{ProviderError, Result};
use crate::core::model::{
    OutboundRecord, ShadowsocksOptions, TrojanOptions, VlessOptions, VmessOptions,
};

use super::synthesize_tag;

/// Fails (rather than returning an empty list) when there is no `proxies`
/// key at all, so the caller can tell "this isn't Clash" from "this is an
/// empty Clash document".
pub fn parse(text: &str) -> Result<Vec<OutboundRecord>> {
    let root: Value = serde_yml::from_str(text)?;
    let proxies = root
        .get("proxies")
        .and_then(Value::as_array)
        .ok_or(ProviderError::ParseDocument)?;

    let mut used_tags = HashSet::new();
    let records = proxies
        .iter()
        .filter_map(|p| match parse_entry(p) {
            Some(mut record) => {
                if record.tag().is_empty() {
                    let host = record.server().to_string();
                    let port = server_port(p).unwrap_or(0);
                    record.set_tag(synthesize_tag(record.kind(), &host, port, &mut used_tags));
                }
                Some(record)
            }
            None => {
                warn!(entry = ?p.get("name"), "skipped unrecognised clash proxy entry");
                None
            }
        })
        .collect();
    Ok(records)
}

fn server_port(p: &Value) -> Option<u16> {
    p.get("port").and_then(Value::as_u64).map(|v| v as u16)
}

fn parse_entry(p: &Value) -> Option<OutboundRecord> {
    let tag = p.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let server = p.get("server")?.as_str()?.to_string();
    let port = server_port(p)?;

    Some(match p.get("type")?.as_str()? {
        "ss" => OutboundRecord::Shadowsocks(ShadowsocksOptions {
            tag,
            server,
            server_port: port,
            method: p.get("cipher")?.as_str()?.to_string(),
            password: p.get("password")?.as_str()?.to_string(),
            dialer_options: None,
        }),
        "vmess" => OutboundRecord::Vmess(VmessOptions {
            tag,
            server,
            server_port: port,
            uuid: p.get("uuid")?.as_str()?.to_string(),
            alter_id: p.get("alterId").and_then(Value::as_u64).unwrap_or(0) as u32,
            security: p.get("cipher").and_then(Value::as_str).unwrap_or("auto").to_string(),
            transport: p.get("network").and_then(Value::as_str).map(str::to_string),
            dialer_options: None,
        }),
        "vless" => OutboundRecord::Vless(VlessOptions {
            tag,
            server,
            server_port: port,
            uuid: p.get("uuid")?.as_str()?.to_string(),
            flow: p.get("flow").and_then(Value::as_str).map(str::to_string),
            transport: p.get("network").and_then(Value::as_str).map(str::to_string),
            dialer_options: None,
        }),
        "trojan" => OutboundRecord::Trojan(TrojanOptions {
            tag,
            server,
            server_port: port,
            password: p.get("password")?.as_str()?.to_string(),
            dialer_options: None,
        }),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
proxies:
  - name: node-a
    type: ss
    server: example.com
    port: 8388
    cipher: aes-256-gcm
    password: hunter2
  - name: node-b
    type: trojan
    server: other.example
    port: 443
    password: secret
  - name: node-c
    type: unsupported-future-protocol
    server: whatever.example
    port: 1
"#;

    #[test]
    fn parses_known_entries_and_skips_unknown_types() {
        let records = parse(DOC).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag(), "node-a");
        assert_eq!(records[1].kind(), "trojan");
    }

    #[test]
    fn rejects_documents_without_a_proxies_key() {
        let err = parse("foo: bar").unwrap_err();
        assert!(matches!(err, ProviderError::ParseDocument));
    }
}
