//! Adapts the Bootstrap DNS Stub to `reqwest`'s pluggable resolver hook, so
//! the H1/H2 client resolves the subscription URL's authority through it
//! (§4.4) while still getting reqwest/hyper's own connection pooling and
//! opportunistic H2 upgrade for free.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use super::dns::BootstrapDns;

#[derive(Clone)]
pub struct BootstrapResolver {
    dns: Arc<BootstrapDns>,
}

impl BootstrapResolver {
    pub fn new(dns: Arc<BootstrapDns>) -> Self {
        BootstrapResolver { dns }
    }
}

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let dns = self.dns.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let ips = dns
                .lookup(&host, true, true)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            // Port is filled in by the connector from the request URI; 0
            // here is the conventional placeholder reqwest's own
            // resolver implementations use.
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
