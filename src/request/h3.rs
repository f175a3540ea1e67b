//! The HTTP/3 client path (§4.4): same authority resolution as H1/H2, dialed
//! over UDP and handed to a QUIC early-data dialer.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use h3::client::SendRequest;
use h3_quinn::quinn;
use http::{Request, Response};
use tokio_rustls::rustls;

use crate::core::error::{ProviderError, Result};

use super::dns::BootstrapDns;

/// One HTTP/3 roundtrip to `url`. Resolution goes through `dns` when
/// configured, else falls back to the system resolver via a plain
/// connect-by-name lookup.
pub async fn get(
    url: &url::Url,
    user_agent: &str,
    request_timeout: std::time::Duration,
    dns: Option<Arc<BootstrapDns>>,
) -> Result<(http::StatusCode, http::HeaderMap, Bytes)> {
    let host = url.host_str().ok_or_else(|| ProviderError::Dns("request url has no host".into()))?;
    let port = url.port_or_known_default().unwrap_or(443);

    let addr = resolve_one(host, dns).await?;
    let endpoint = build_quic_endpoint(addr)?;
    let connecting = endpoint
        .connect(SocketAddr::new(addr, port), host)
        .map_err(|e| ProviderError::Dns(e.to_string()))?;
    let quinn_conn = tokio::time::timeout(request_timeout, connecting)
        .await
        .map_err(|_| ProviderError::Dns("h3 connect timed out".into()))?
        .map_err(|e| ProviderError::Dns(e.to_string()))?;

    let quinn_h3_conn = h3_quinn::Connection::new(quinn_conn);
    let (mut driver, mut send_request) = h3::client::new(quinn_h3_conn)
        .await
        .map_err(|e| ProviderError::Dns(e.to_string()))?;

    let request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("user-agent", user_agent)
        .body(())
        .map_err(|e| ProviderError::Dns(e.to_string()))?;

    let drive = tokio::spawn(async move {
        let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let (response, body) = send_one(&mut send_request, request, request_timeout).await?;
    drive.abort();
    Ok((response.status(), response.headers().clone(), body))
}

async fn send_one(
    send_request: &mut SendRequest<h3_quinn::OpenStreams, Bytes>,
    request: Request<()>,
    timeout: std::time::Duration,
) -> Result<(Response<()>, Bytes)> {
    let mut stream = tokio::time::timeout(timeout, send_request.send_request(request))
        .await
        .map_err(|_| ProviderError::Dns("h3 request timed out".into()))?
        .map_err(|e| ProviderError::Dns(e.to_string()))?;
    stream.finish().await.map_err(|e| ProviderError::Dns(e.to_string()))?;

    let response = stream.recv_response().await.map_err(|e| ProviderError::Dns(e.to_string()))?;

    let mut body = BytesMut::new();
    while let Some(chunk) = stream.recv_data().await.map_err(|e| ProviderError::Dns(e.to_string()))? {
        body.extend_from_slice(chunk.chunk());
    }

    Ok((response, body.freeze()))
}

async fn resolve_one(host: &str, dns: Option<Arc<BootstrapDns>>) -> Result<std::net::IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    match dns {
        Some(dns) => dns
            .lookup(host, true, true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Dns(format!("no address found for {host}"))),
        None => tokio::net::lookup_host((host, 0))
            .await
            .map_err(ProviderError::Io)?
            .next()
            .map(|a| a.ip())
            .ok_or_else(|| ProviderError::Dns(format!("no address found for {host}"))),
    }
}

fn build_quic_endpoint(local: std::net::IpAddr) -> Result<quinn::Endpoint> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![b"h3".to_vec()];

    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| ProviderError::Dns(e.to_string()))?,
    ));

    let bind_addr = match local {
        std::net::IpAddr::V4(_) => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
        std::net::IpAddr::V6(_) => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0),
    };
    let mut endpoint = quinn::Endpoint::client(bind_addr).map_err(ProviderError::Io)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}
