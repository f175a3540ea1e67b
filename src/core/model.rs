//! The outbound data model (§3): `OutboundRecord` and its satellites.
//!
//! Reimplemented per the re-architecture note in §9: a tagged sum with
//! per-variant field groups and one shared header `{tag, type}`; accessor
//! helpers (`tag`, `set_tag`, `server`, `set_dialer_options`) are
//! pattern-matched methods rather than a shared base-class field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::option::NoneOrSome;

/// Dialer-level options injected into every record during composition
/// step 1 (§4.6). Left intentionally narrow: the concrete dial behavior is
/// a forwarding-data-plane concern and out of scope (§1); this is only the
/// configuration payload that gets cloned into each record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DialerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

macro_rules! server_outbound_options {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub struct $name {
            pub tag: String,
            pub server: String,
            pub server_port: u16,
            $(pub $field: $ty,)*
            #[serde(skip_serializing_if = "Option::is_none")]
            pub dialer_options: Option<DialerOptions>,
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DirectOptions {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialer_options: Option<DialerOptions>,
}

server_outbound_options!(SimpleServerOptions {
    username: Option<String>,
    password: Option<String>,
});

server_outbound_options!(ShadowsocksOptions {
    method: String,
    password: String,
});

server_outbound_options!(VmessOptions {
    uuid: String,
    alter_id: u32,
    security: String,
    transport: Option<String>,
});

server_outbound_options!(VlessOptions {
    uuid: String,
    flow: Option<String>,
    transport: Option<String>,
});

server_outbound_options!(TrojanOptions {
    password: String,
});

server_outbound_options!(WireguardOptions {
    private_key: String,
    peer_public_key: String,
    local_address: Vec<String>,
});

server_outbound_options!(TuicOptions {
    uuid: String,
    password: Option<String>,
    congestion_control: Option<String>,
});

server_outbound_options!(TorOptions {
    executable_path: Option<String>,
});

server_outbound_options!(SshOptions {
    user: String,
    password: Option<String>,
    private_key_path: Option<String>,
});

server_outbound_options!(ShadowsocksrOptions {
    method: String,
    password: String,
    protocol: String,
    obfs: String,
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomAddrOptions {
    pub tag: String,
}

/// Shared member-list shape for `selector` / `url-test` groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupOptions {
    pub tag: String,
    pub outbounds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub interrupt_exist_connections: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptTestOptions {
    pub tag: String,
    pub outbounds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub interrupt_exist_connections: bool,
    #[serde(default)]
    pub global_vars: HashMap<String, serde_json::Value>,
}

/// A tagged-union outbound config record (§3). One shared `{tag, type}`
/// header with per-variant fields; immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundRecord {
    Direct(DirectOptions),
    Http(SimpleServerOptions),
    Socks(SimpleServerOptions),
    Shadowsocks(ShadowsocksOptions),
    Vmess(VmessOptions),
    Vless(VlessOptions),
    Trojan(TrojanOptions),
    Wireguard(WireguardOptions),
    Hysteria(SimpleServerOptions),
    Hysteria2(SimpleServerOptions),
    Tuic(TuicOptions),
    Tor(TorOptions),
    Ssh(SshOptions),
    Shadowtls(SimpleServerOptions),
    Shadowsocksr(ShadowsocksrOptions),
    Selector(GroupOptions),
    #[serde(rename = "url-test")]
    UrlTest(GroupOptions),
    #[serde(rename = "script-test")]
    ScriptTest(ScriptTestOptions),
    #[serde(rename = "random-addr")]
    RandomAddr(RandomAddrOptions),
}

impl OutboundRecord {
    /// The discriminator string, matching the `type` tag exactly.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundRecord::Direct(_) => "direct",
            OutboundRecord::Http(_) => "http",
            OutboundRecord::Socks(_) => "socks",
            OutboundRecord::Shadowsocks(_) => "shadowsocks",
            OutboundRecord::Vmess(_) => "vmess",
            OutboundRecord::Vless(_) => "vless",
            OutboundRecord::Trojan(_) => "trojan",
            OutboundRecord::Wireguard(_) => "wireguard",
            OutboundRecord::Hysteria(_) => "hysteria",
            OutboundRecord::Hysteria2(_) => "hysteria2",
            OutboundRecord::Tuic(_) => "tuic",
            OutboundRecord::Tor(_) => "tor",
            OutboundRecord::Ssh(_) => "ssh",
            OutboundRecord::Shadowtls(_) => "shadowtls",
            OutboundRecord::Shadowsocksr(_) => "shadowsocksr",
            OutboundRecord::Selector(_) => "selector",
            OutboundRecord::UrlTest(_) => "url-test",
            OutboundRecord::ScriptTest(_) => "script-test",
            OutboundRecord::RandomAddr(_) => "random-addr",
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            OutboundRecord::Direct(o) => &o.tag,
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => &o.tag,
            OutboundRecord::Shadowsocks(o) => &o.tag,
            OutboundRecord::Vmess(o) => &o.tag,
            OutboundRecord::Vless(o) => &o.tag,
            OutboundRecord::Trojan(o) => &o.tag,
            OutboundRecord::Wireguard(o) => &o.tag,
            OutboundRecord::Tuic(o) => &o.tag,
            OutboundRecord::Tor(o) => &o.tag,
            OutboundRecord::Ssh(o) => &o.tag,
            OutboundRecord::Shadowsocksr(o) => &o.tag,
            OutboundRecord::Selector(o) | OutboundRecord::UrlTest(o) => &o.tag,
            OutboundRecord::ScriptTest(o) => &o.tag,
            OutboundRecord::RandomAddr(o) => &o.tag,
        }
    }

    pub fn set_tag(&mut self, new_tag: String) {
        match self {
            OutboundRecord::Direct(o) => o.tag = new_tag,
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => o.tag = new_tag,
            OutboundRecord::Shadowsocks(o) => o.tag = new_tag,
            OutboundRecord::Vmess(o) => o.tag = new_tag,
            OutboundRecord::Vless(o) => o.tag = new_tag,
            OutboundRecord::Trojan(o) => o.tag = new_tag,
            OutboundRecord::Wireguard(o) => o.tag = new_tag,
            OutboundRecord::Tuic(o) => o.tag = new_tag,
            OutboundRecord::Tor(o) => o.tag = new_tag,
            OutboundRecord::Ssh(o) => o.tag = new_tag,
            OutboundRecord::Shadowsocksr(o) => o.tag = new_tag,
            OutboundRecord::Selector(o) | OutboundRecord::UrlTest(o) => o.tag = new_tag,
            OutboundRecord::ScriptTest(o) => o.tag = new_tag,
            OutboundRecord::RandomAddr(o) => o.tag = new_tag,
        }
    }

    /// The `server` attribute (§3: "a record always has an extractable
    /// `server` attribute when its type denotes a remote endpoint").
    /// Types without a server produce the empty string, per §4.2.
    pub fn server(&self) -> &str {
        match self {
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => &o.server,
            OutboundRecord::Shadowsocks(o) => &o.server,
            OutboundRecord::Vmess(o) => &o.server,
            OutboundRecord::Vless(o) => &o.server,
            OutboundRecord::Trojan(o) => &o.server,
            OutboundRecord::Wireguard(o) => &o.server,
            OutboundRecord::Tuic(o) => &o.server,
            OutboundRecord::Ssh(o) => &o.server,
            OutboundRecord::Shadowsocksr(o) => &o.server,
            OutboundRecord::Direct(_)
            | OutboundRecord::Tor(_)
            | OutboundRecord::Selector(_)
            | OutboundRecord::UrlTest(_)
            | OutboundRecord::ScriptTest(_)
            | OutboundRecord::RandomAddr(_) => "",
        }
    }

    /// The `server_port` attribute, 0 for types without a server (§4.7
    /// supplemental: healthcheck dialing needs both halves of the address).
    pub fn port(&self) -> u16 {
        match self {
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => o.server_port,
            OutboundRecord::Shadowsocks(o) => o.server_port,
            OutboundRecord::Vmess(o) => o.server_port,
            OutboundRecord::Vless(o) => o.server_port,
            OutboundRecord::Trojan(o) => o.server_port,
            OutboundRecord::Wireguard(o) => o.server_port,
            OutboundRecord::Tuic(o) => o.server_port,
            OutboundRecord::Ssh(o) => o.server_port,
            OutboundRecord::Shadowsocksr(o) => o.server_port,
            OutboundRecord::Direct(_)
            | OutboundRecord::Tor(_)
            | OutboundRecord::Selector(_)
            | OutboundRecord::UrlTest(_)
            | OutboundRecord::ScriptTest(_)
            | OutboundRecord::RandomAddr(_) => 0,
        }
    }

    pub fn set_server(&mut self, new_server: String) {
        match self {
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => o.server = new_server,
            OutboundRecord::Shadowsocks(o) => o.server = new_server,
            OutboundRecord::Vmess(o) => o.server = new_server,
            OutboundRecord::Vless(o) => o.server = new_server,
            OutboundRecord::Trojan(o) => o.server = new_server,
            OutboundRecord::Wireguard(o) => o.server = new_server,
            OutboundRecord::Tuic(o) => o.server = new_server,
            OutboundRecord::Ssh(o) => o.server = new_server,
            OutboundRecord::Shadowsocksr(o) => o.server = new_server,
            _ => {}
        }
    }

    /// Composition step 1: clone provider-wide dialer defaults into this
    /// record's `dialer_options`, skipping variants without one (groups).
    pub fn set_dialer_options(&mut self, options: DialerOptions) {
        match self {
            OutboundRecord::Direct(o) => o.dialer_options = Some(options),
            OutboundRecord::Http(o)
            | OutboundRecord::Socks(o)
            | OutboundRecord::Hysteria(o)
            | OutboundRecord::Hysteria2(o)
            | OutboundRecord::Shadowtls(o) => o.dialer_options = Some(options),
            OutboundRecord::Shadowsocks(o) => o.dialer_options = Some(options),
            OutboundRecord::Vmess(o) => o.dialer_options = Some(options),
            OutboundRecord::Vless(o) => o.dialer_options = Some(options),
            OutboundRecord::Trojan(o) => o.dialer_options = Some(options),
            OutboundRecord::Wireguard(o) => o.dialer_options = Some(options),
            OutboundRecord::Tuic(o) => o.dialer_options = Some(options),
            OutboundRecord::Ssh(o) => o.dialer_options = Some(options),
            OutboundRecord::Shadowsocksr(o) => o.dialer_options = Some(options),
            OutboundRecord::Tor(_)
            | OutboundRecord::Selector(_)
            | OutboundRecord::UrlTest(_)
            | OutboundRecord::ScriptTest(_)
            | OutboundRecord::RandomAddr(_) => {}
        }
    }
}

/// Injective `new tag -> original tag` side map built by tag-format rewrite
/// (§3 Invariant 2), consulted by per-group tag-scope filters.
pub type TagSideMap = HashMap<String, String>;

/// `{download, upload, total, expire}` extracted from the
/// `subscription-userinfo` header (§3, §6), serialized under those names to
/// match the original's `ClashInfo` / the cache file's `clash_info` shape.
/// `expire_time` is kept as an RFC3339 instant internally and in the cache
/// file; conversion to a Unix integer happens only at the management-API
/// boundary (§9 Open Question, decided).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionMetrics {
    #[serde(default, rename = "download")]
    pub download_bytes: u64,
    #[serde(default, rename = "upload")]
    pub upload_bytes: u64,
    #[serde(default, rename = "total")]
    pub total_bytes: u64,
    #[serde(default, rename = "expire", skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// The persisted fetch result (§3), serialized as
/// `{last_update, outbounds, clash_info}` per §6's cache file schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub last_update: chrono::DateTime<chrono::Utc>,
    pub outbounds: Vec<OutboundRecord>,
    #[serde(default, rename = "clash_info", skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SubscriptionMetrics>,
}

impl Cache {
    pub fn empty() -> Self {
        Cache {
            last_update: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            outbounds: Vec::new(),
            metrics: None,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.outbounds.is_empty()
    }
}

/// A single filter rule (§3): a scope plus a compiled regex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Tag,
    Type,
    Server,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// `{tag, kind, base_options, filter?}` (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    Selector,
    UrlTest,
    ScriptTest,
}

/// A group's preserved base configuration, e.g. the pre-existing
/// `outbounds` list prepended ahead of filtered tags (§4.6 step 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupBaseOptions {
    #[serde(default)]
    pub outbounds: NoneOrSome<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub interrupt_exist_connections: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub global_vars: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_http(tag: &str) -> OutboundRecord {
        OutboundRecord::Http(SimpleServerOptions {
            tag: tag.to_string(),
            server: "example.com".to_string(),
            server_port: 443,
            username: None,
            password: None,
            dialer_options: None,
        })
    }

    #[test]
    fn tag_and_server_accessors_round_trip() {
        let mut record = sample_http("a");
        assert_eq!(record.tag(), "a");
        assert_eq!(record.server(), "example.com");
        record.set_tag("a-renamed".to_string());
        record.set_server("1.2.3.4".to_string());
        assert_eq!(record.tag(), "a-renamed");
        assert_eq!(record.server(), "1.2.3.4");
    }

    #[test]
    fn direct_and_selector_have_no_server() {
        let direct = OutboundRecord::Direct(DirectOptions {
            tag: "direct".to_string(),
            override_address: None,
            override_port: None,
            dialer_options: None,
        });
        assert_eq!(direct.server(), "");
        assert_eq!(direct.port(), 0);
        let selector = OutboundRecord::Selector(GroupOptions {
            tag: "auto".to_string(),
            outbounds: vec!["a".to_string()],
            default: None,
            interrupt_exist_connections: false,
        });
        assert_eq!(selector.server(), "");
        assert_eq!(selector.port(), 0);
    }

    #[test]
    fn port_matches_configured_server_port() {
        let record = sample_http("a");
        assert_eq!(record.port(), 443);
    }

    #[test]
    fn serde_tag_matches_kind_discriminator() {
        let record = sample_http("a");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "http");
        assert_eq!(record.kind(), "http");
    }

    #[test]
    fn cache_empty_when_outbounds_absent() {
        assert!(Cache::empty().is_nil());
    }
}
