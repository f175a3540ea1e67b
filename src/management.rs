//! Management Surface (§9 supplemental): the read/trigger operations the
//! original exposes over its clash-compatible HTTP API
//! (`experimental/clashapi/provider.go`), reduced to pure logic with no
//! listener of its own, per the Non-goal excluding an outer HTTP surface.
//! A host process wires these onto whatever transport it already runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::core::error::Result;
use crate::core::model::OutboundRecord;
use crate::provider::Provider;
use crate::request::dialer::Dialer;

/// Subscription accounting in the same shape the clash API renders it:
/// raw byte counts plus a Unix-seconds expiry, zeroed when absent (§9 Open
/// Question: `expire_time` only becomes a Unix integer at this boundary).
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub download: u64,
    pub upload: u64,
    pub total: u64,
    pub expire: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "vehicleType")]
    pub vehicle_type: &'static str,
    #[serde(rename = "subscriptionInfo")]
    pub subscription_info: SubscriptionSummary,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub proxies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub tag: String,
    /// `None` when the TCP dial failed or timed out.
    pub delay_ms: Option<u64>,
}

fn summarize(provider: &Provider) -> ProviderInfo {
    let metrics = provider.get_metrics();
    let subscription_info = match metrics {
        Some(m) => SubscriptionSummary {
            download: m.download_bytes,
            upload: m.upload_bytes,
            total: m.total_bytes,
            expire: m.expire_time.map(|t| t.timestamp()).unwrap_or(0),
        },
        None => SubscriptionSummary { download: 0, upload: 0, total: 0, expire: 0 },
    };

    ProviderInfo {
        name: provider.tag().to_string(),
        kind: "Proxy",
        vehicle_type: "HTTP",
        subscription_info,
        updated_at: provider.last_update_time(),
        proxies: provider.get_outbounds().iter().map(|o| o.tag().to_string()).collect(),
    }
}

/// `GET /providers/proxies` (§9 supplemental): one summary per registered
/// provider.
pub fn list_providers_info(providers: &HashMap<String, Arc<Provider>>) -> Vec<ProviderInfo> {
    providers.values().map(|p| summarize(p)).collect()
}

/// `GET /providers/proxies/{name}`.
pub fn get_provider_info(providers: &HashMap<String, Arc<Provider>>, name: &str) -> Option<ProviderInfo> {
    providers.get(name).map(|p| summarize(p))
}

/// `PUT /providers/proxies/{name}` (§4 `Update`): triggers an out-of-band
/// refresh, a no-op if the provider has no persistence configured.
pub async fn trigger_update(providers: &HashMap<String, Arc<Provider>>, name: &str) -> Result<()> {
    match providers.get(name) {
        Some(provider) => provider.update().await,
        None => Ok(()),
    }
}

/// `GET /providers/proxies/{name}/healthcheck`: times a TCP connect to
/// every server-bearing member of the provider's composed outbound set.
/// Unlike the original's `urltest.URLTest` (a full HTTP round trip through
/// each outbound's own data plane), this measures raw connect latency
/// through the crate's own narrow `Dialer` seam, since the actual
/// forwarding data plane is out of scope (§1).
pub async fn run_healthcheck(provider: &Provider, dialer: &dyn Dialer, timeout: Duration) -> Result<Vec<HealthCheckResult>> {
    let outbounds = provider.get_full_outbounds().await?;
    let probes = outbounds.iter().filter(|o| is_dialable(o)).map(|record| probe_one(dialer, record, timeout));
    Ok(join_all(probes).await)
}

fn is_dialable(record: &OutboundRecord) -> bool {
    !record.server().is_empty() && record.port() != 0
}

async fn probe_one(dialer: &dyn Dialer, record: &OutboundRecord, timeout: Duration) -> HealthCheckResult {
    let tag = record.tag().to_string();
    let addr = match format!("{}:{}", record.server(), record.port()).parse::<std::net::SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => return HealthCheckResult { tag, delay_ms: None },
    };

    let started = std::time::Instant::now();
    let delay_ms = match tokio::time::timeout(timeout, dialer.connect_tcp(addr)).await {
        Ok(Ok(_)) => Some(started.elapsed().as_millis() as u64),
        _ => None,
    };
    HealthCheckResult { tag, delay_ms }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DirectOptions, ShadowsocksOptions};

    #[test]
    fn is_dialable_excludes_groups_and_direct() {
        let direct = OutboundRecord::Direct(DirectOptions { tag: "direct".into(), override_address: None, override_port: None, dialer_options: None });
        assert!(!is_dialable(&direct));

        let ss = OutboundRecord::Shadowsocks(ShadowsocksOptions {
            tag: "ss".into(),
            server: "1.2.3.4".into(),
            server_port: 8388,
            method: "aes-256-gcm".into(),
            password: "x".into(),
            dialer_options: None,
        });
        assert!(is_dialable(&ss));
    }
}
