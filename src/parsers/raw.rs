//! Raw-link list grammar (§4.1 supplemental detail): a line-oriented list
//! of `scheme://...` links, optionally base64-encoded as a whole blob.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use base64::engine::general_purpose;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::core::error::Result;
use crate::core::model::{
    OutboundRecord, ShadowsocksOptions, TrojanOptions, VlessOptions, VmessOptions,
};

use super::synthesize_tag;

/// Tries standard, standard-no-pad, then URL-safe-no-pad, in that order,
/// on the whole blob (§4.1 supplemental detail).
fn decode_base64_auto(input: &str) -> Option<String> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(&clean)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(&clean))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(&clean))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Tries each line as a recognised scheme link; returns `Ok(vec![])` (not
/// an error) when nothing recognisable is found, since a raw-link mismatch
/// isn't distinguishable from "subscription is just empty" until the
/// caller compares it against the other grammars.
pub fn parse(text: &str) -> Result<Vec<OutboundRecord>> {
    let body = decode_base64_auto(text.trim()).unwrap_or_else(|| text.to_string());
    let mut used_tags = HashSet::new();
    let records = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| match parse_one(line) {
            Some(mut record) => {
                if record.tag().is_empty() {
                    if let Some((host, port)) = host_port(&record) {
                        record.set_tag(synthesize_tag(record.kind(), &host, port, &mut used_tags));
                    }
                }
                Some(record)
            }
            None => {
                warn!(line, "skipped unrecognised or malformed raw link");
                None
            }
        })
        .collect();
    Ok(records)
}

fn host_port(record: &OutboundRecord) -> Option<(String, u16)> {
    match record {
        OutboundRecord::Shadowsocks(o) => Some((o.server.clone(), o.server_port)),
        OutboundRecord::Vmess(o) => Some((o.server.clone(), o.server_port)),
        OutboundRecord::Vless(o) => Some((o.server.clone(), o.server_port)),
        OutboundRecord::Trojan(o) => Some((o.server.clone(), o.server_port)),
        _ => None,
    }
}

/// Parses a single link of any recognised scheme. Unknown schemes are a
/// per-record failure (`None`), never a grammar mismatch.
pub fn parse_one(line: &str) -> Option<OutboundRecord> {
    let (scheme, _) = line.split_once("://")?;
    match scheme {
        "ss" => parse_ss(line),
        "vmess" => parse_vmess(line),
        "vless" => parse_vless(line),
        "trojan" => parse_trojan(line),
        _ => None,
    }
}

fn fragment_tag(url: &Url, default: &str) -> String {
    url.fragment()
        .map(|f| percent_encoding::percent_decode_str(f).decode_utf8_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// SIP002 URL form, or the legacy `base64(method:password)@host:port` form.
fn parse_ss(line: &str) -> Option<OutboundRecord> {
    if let Ok(url) = Url::parse(line) {
        if let (Some(host), Some(port)) = (url.host_str(), url.port()) {
            let user_info = decode_base64_auto(url.username())
                .unwrap_or_else(|| url.username().to_string());
            let (method, password) = user_info
                .split_once(':')
                .or_else(|| user_info.rsplit_once(':'))?;
            return Some(OutboundRecord::Shadowsocks(ShadowsocksOptions {
                tag: fragment_tag(&url, ""),
                server: host.to_string(),
                server_port: port,
                method: method.to_string(),
                password: password.to_string(),
                dialer_options: None,
            }));
        }
    }

    let body = line.strip_prefix("ss://")?;
    let (body, tag) = match body.split_once('#') {
        Some((b, t)) => (
            b,
            percent_encoding::percent_decode_str(t).decode_utf8_lossy().to_string(),
        ),
        None => (body, String::new()),
    };
    let decoded = decode_base64_auto(body)?;
    let (auth, addr) = decoded.rsplit_once('@')?;
    let (method, password) = auth.split_once(':')?;
    let (host, port_str) = addr.rsplit_once(':')?;
    Some(OutboundRecord::Shadowsocks(ShadowsocksOptions {
        tag,
        server: host.to_string(),
        server_port: port_str.parse().ok()?,
        method: method.to_string(),
        password: password.to_string(),
        dialer_options: None,
    }))
}

/// `vmess://` is base64-decoded whole into a small JSON object.
fn parse_vmess(line: &str) -> Option<OutboundRecord> {
    let body = line.strip_prefix("vmess://")?;
    let decoded = decode_base64_auto(body)?;
    let v: Value = serde_json::from_str(&decoded).ok()?;

    let json_u64 = |v: &Value| -> Option<u64> { v.as_u64().or_else(|| v.as_str()?.parse().ok()) };

    Some(OutboundRecord::Vmess(VmessOptions {
        tag: v.get("ps").and_then(Value::as_str).unwrap_or_default().to_string(),
        server: v.get("add")?.as_str()?.to_string(),
        server_port: json_u64(v.get("port")?)? as u16,
        uuid: v.get("id")?.as_str()?.to_string(),
        alter_id: v.get("aid").and_then(|a| json_u64(a)).unwrap_or(0) as u32,
        security: v.get("scy").and_then(Value::as_str).unwrap_or("auto").to_string(),
        transport: v.get("net").and_then(Value::as_str).map(str::to_string),
        dialer_options: None,
    }))
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// `vless://uuid@host:port?...#tag`.
fn parse_vless(line: &str) -> Option<OutboundRecord> {
    let url = Url::parse(line).ok()?;
    let query = query_map(&url);
    Some(OutboundRecord::Vless(VlessOptions {
        tag: fragment_tag(&url, ""),
        server: url.host_str()?.to_string(),
        server_port: url.port()?,
        uuid: url.username().to_string(),
        flow: query.get("flow").cloned(),
        transport: query.get("type").cloned(),
        dialer_options: None,
    }))
}

/// `trojan://password@host:port?...#tag`.
fn parse_trojan(line: &str) -> Option<OutboundRecord> {
    let url = Url::parse(line).ok()?;
    Some(OutboundRecord::Trojan(TrojanOptions {
        tag: fragment_tag(&url, ""),
        server: url.host_str()?.to_string(),
        server_port: url.port()?,
        password: url.username().to_string(),
        dialer_options: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sip002_shadowsocks_link() {
        let userinfo = general_purpose::STANDARD.encode("aes-256-gcm:hunter2");
        let link = format!("ss://{userinfo}@example.com:8388#my-node");
        let record = parse_one(&link).expect("should parse");
        match record {
            OutboundRecord::Shadowsocks(o) => {
                assert_eq!(o.server, "example.com");
                assert_eq!(o.server_port, 8388);
                assert_eq!(o.method, "aes-256-gcm");
                assert_eq!(o.password, "hunter2");
                assert_eq!(o.tag, "my-node");
            }
            other => panic!("expected shadowsocks, got {other:?}"),
        }
    }

    #[test]
    fn parses_vless_link_with_query_params() {
        let link = "vless://11111111-1111-1111-1111-111111111111@host.example:443?type=ws&flow=xtls-rprx-vision#tag";
        let record = parse_one(link).expect("should parse");
        match record {
            OutboundRecord::Vless(o) => {
                assert_eq!(o.server, "host.example");
                assert_eq!(o.server_port, 443);
                assert_eq!(o.flow.as_deref(), Some("xtls-rprx-vision"));
                assert_eq!(o.transport.as_deref(), Some("ws"));
            }
            other => panic!("expected vless, got {other:?}"),
        }
    }

    #[test]
    fn unknown_scheme_is_skipped_not_fatal() {
        assert!(parse_one("wireguard://whatever").is_none());
    }

    #[test]
    fn parse_ignores_blank_and_comment_lines() {
        let userinfo = general_purpose::STANDARD.encode("aes-128-gcm:pw");
        let text = format!("\n# comment\nss://{userinfo}@1.2.3.4:1234#a\n\n");
        let records = parse(&text).unwrap();
        assert_eq!(records.len(), 1);
    }
}
