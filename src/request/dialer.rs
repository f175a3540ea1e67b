//! The narrow dialer seam (§4.4): the concrete transport behind a named
//! `running-detour` is a forwarding-data-plane concern and out of scope
//! (§1), so the Request Pipeline depends on it only through this trait.
//! The crate's own default dials TCP directly; a host process may inject
//! a real detour implementation ahead of it.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_ok;
use tokio::net::TcpStream;

use crate::core::error::{ProviderError, Result};

const HAPPY_EYEBALLS_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect_tcp(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Opens a direct TCP connection; the pipeline's fallback when no detour
/// is registered (§4.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn connect_tcp(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Happy-eyeballs-style parallel dial: races every resolved address with a
/// shared timeout and returns the first established connection (§4.4).
pub async fn dial_parallel(dialer: &dyn Dialer, ips: &[IpAddr], port: u16) -> Result<TcpStream> {
    if ips.is_empty() {
        return Err(ProviderError::Dns("no addresses to dial".into()));
    }

    let attempts = ips.iter().map(|ip| {
        let addr = SocketAddr::new(*ip, port);
        Box::pin(async move {
            tokio::time::timeout(HAPPY_EYEBALLS_TIMEOUT, dialer.connect_tcp(addr))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))?
                .map_err(ProviderError::Io)
        })
    });

    match select_ok(attempts).await {
        Ok((stream, _)) => Ok(stream),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_parallel_rejects_empty_address_list() {
        let err = dial_parallel(&DirectDialer, &[], 443).await.unwrap_err();
        assert!(matches!(err, ProviderError::Dns(_)));
    }
}
