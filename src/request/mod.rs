//! Request Pipeline (§4.4): builds and memoizes one of two HTTP clients for
//! the provider's lifetime, selected by `use_h3`, and performs the
//! subscription GET.

pub mod dialer;
pub mod dns;
mod h3;
mod raw_http;
mod resolver;

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use reqwest::header::HeaderMap;
use tracing::debug;
use url::Url;

use crate::core::error::{ProviderError, Result};
use crate::core::model::SubscriptionMetrics;

use self::dialer::{Dialer, DirectDialer};
use self::dns::BootstrapDns;
use self::resolver::BootstrapResolver;

const DEFAULT_USER_AGENT: &str = "clash.meta; sing-box";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

enum ClientImpl {
    H1H2(reqwest::Client),
    H3 { dns: Option<Arc<BootstrapDns>> },
}

/// Memoized for the lifetime of the provider, per §4.4. The detour dialer is
/// never stored here: it's passed in per call, so the caller controls
/// exactly which requests may use it (bootstrap requests must never use
/// running-detour, per §4.4).
pub struct RequestPipeline {
    client: ClientImpl,
    user_agent: String,
    timeout: Duration,
    dns: Option<Arc<BootstrapDns>>,
}

impl RequestPipeline {
    pub fn build(use_h3: bool, user_agent: Option<&str>, timeout: Option<Duration>, dns_addr: Option<&str>) -> Result<Self> {
        let dns = dns_addr.map(BootstrapDns::parse).transpose()?.map(Arc::new);
        let client = if use_h3 {
            ClientImpl::H3 { dns: dns.clone() }
        } else {
            let mut builder = reqwest::Client::builder().use_rustls_tls();
            if let Some(dns) = dns.clone() {
                builder = builder.dns_resolver(Arc::new(BootstrapResolver::new(dns)));
            }
            let client = builder.build().map_err(ProviderError::Network)?;
            ClientImpl::H1H2(client)
        };

        Ok(RequestPipeline {
            client,
            user_agent: user_agent.unwrap_or(DEFAULT_USER_AGENT).to_string(),
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            dns,
        })
    }

    /// Performs the subscription GET, returning the raw body and any
    /// `subscription-userinfo` metrics extracted from the response
    /// headers (§4.4, §6). `detour`, when given, routes the request through
    /// that in-process outbound instead of the memoized H1/H2 or H3 client;
    /// callers must only pass one for non-bootstrap requests.
    pub async fn fetch(&self, url: &str, detour: Option<&dyn Dialer>) -> Result<(Vec<u8>, Option<SubscriptionMetrics>)> {
        if let Some(detour) = detour {
            return self.fetch_via_detour(url, detour).await;
        }
        match &self.client {
            ClientImpl::H1H2(client) => {
                let resp = client
                    .get(url)
                    .header("user-agent", &self.user_agent)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(ProviderError::Network)?;
                if !resp.status().is_success() {
                    return Err(ProviderError::Configuration(format!(
                        "subscription request failed: http {}",
                        resp.status()
                    )));
                }
                let metrics = extract_metrics(resp.headers());
                let body = resp.bytes().await.map_err(ProviderError::Network)?;
                debug!(bytes = body.len(), "fetched subscription body over h1/h2");
                Ok((body.to_vec(), metrics))
            }
            ClientImpl::H3 { dns } => {
                let parsed = Url::parse(url).map_err(|e| ProviderError::Configuration(e.to_string()))?;
                let (status, headers, body) = self::h3::get(&parsed, &self.user_agent, self.timeout, dns.clone()).await?;
                if !status.is_success() {
                    return Err(ProviderError::Configuration(format!("subscription request failed: http {status}")));
                }
                let metrics = extract_metrics_http(&headers);
                debug!(bytes = body.len(), "fetched subscription body over h3");
                Ok((body.to_vec(), metrics))
            }
        }
    }
}

impl RequestPipeline {
    async fn fetch_via_detour(&self, url: &str, dialer: &dyn Dialer) -> Result<(Vec<u8>, Option<SubscriptionMetrics>)> {
        let parsed = Url::parse(url).map_err(|e| ProviderError::Configuration(e.to_string()))?;
        let (status, headers, body) =
            self::raw_http::get_via_dialer(dialer, &parsed, &self.user_agent, self.dns.as_deref()).await?;
        if !status.is_success() {
            return Err(ProviderError::Configuration(format!("subscription request failed: http {status}")));
        }
        let metrics = extract_metrics_http(&headers);
        debug!(bytes = body.len(), "fetched subscription body via running detour");
        Ok((body.to_vec(), metrics))
    }
}

/// The pipeline's own default dialer, used whenever no detour is
/// registered but a caller still needs the `Dialer` seam directly (e.g.
/// composition's `lookup-ip` resolution reuses the same bootstrap stub).
pub fn default_dialer() -> Arc<dyn Dialer> {
    Arc::new(DirectDialer)
}

/// Parses `subscription-userinfo: upload=…; download=…; total=…; expire=…`
/// (§6), matching clash's own loose key=value header grammar.
fn extract_metrics(headers: &HeaderMap) -> Option<SubscriptionMetrics> {
    let raw = headers.get("subscription-userinfo")?.to_str().ok()?;
    parse_subscription_userinfo(raw)
}

fn extract_metrics_http(headers: &http::HeaderMap) -> Option<SubscriptionMetrics> {
    let raw = headers.get("subscription-userinfo")?.to_str().ok()?;
    parse_subscription_userinfo(raw)
}

fn parse_subscription_userinfo(raw: &str) -> Option<SubscriptionMetrics> {
    let lower = raw.to_ascii_lowercase();
    let traffic_re = Regex::new(r"upload=(\d+).*?download=(\d+).*?total=(\d+)").ok()?;
    let expire_re = Regex::new(r"expire=(\d+)").ok()?;

    let mut metrics = SubscriptionMetrics::default();
    let mut found = false;

    if let Some(caps) = traffic_re.captures(&lower) {
        metrics.upload_bytes = caps[1].parse().ok()?;
        metrics.download_bytes = caps[2].parse().ok()?;
        metrics.total_bytes = caps[3].parse().ok()?;
        found = true;
    }
    if let Some(caps) = expire_re.captures(&lower) {
        let unix: i64 = caps[1].parse().ok()?;
        metrics.expire_time = chrono::DateTime::from_timestamp(unix, 0);
        found = true;
    }

    found.then_some(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_traffic_and_expire_fields() {
        let metrics = parse_subscription_userinfo("upload=100; download=200; total=300; expire=1750000000").unwrap();
        assert_eq!(metrics.upload_bytes, 100);
        assert_eq!(metrics.download_bytes, 200);
        assert_eq!(metrics.total_bytes, 300);
        assert!(metrics.expire_time.is_some());
    }

    #[test]
    fn missing_header_yields_no_metrics() {
        assert!(parse_subscription_userinfo("").is_none());
    }
}
