//! A minimal HTTP/1.1 GET used only when the request must go through the
//! narrow `Dialer` seam (§4.4) — i.e. when `running-detour` names an
//! in-process outbound that reqwest's own connector can never reach.
//! Plain HTTP or TLS-on-top, `Content-Length` or connection-close framing
//! only; no chunked transfer-encoding, since subscription hosts serve a
//! single buffered body.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsConnector, rustls};
use url::Url;

use crate::core::error::{ProviderError, Result};

use super::dialer::Dialer;
use super::dns::BootstrapDns;

pub async fn get_via_dialer(
    dialer: &dyn Dialer,
    url: &Url,
    user_agent: &str,
    dns: Option<&BootstrapDns>,
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let host = url.host_str().ok_or_else(|| ProviderError::Dns("request url has no host".into()))?;
    let https = url.scheme() == "https";
    let port = url.port_or_known_default().unwrap_or(if https { 443 } else { 80 });

    let ip = match host.parse() {
        Ok(ip) => ip,
        Err(_) => match dns {
            Some(dns) => dns
                .lookup(host, true, true)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::Dns(format!("no address found for {host}")))?,
            None => tokio::net::lookup_host((host, port))
                .await
                .map_err(ProviderError::Io)?
                .next()
                .map(|a| a.ip())
                .ok_or_else(|| ProviderError::Dns(format!("no address found for {host}")))?,
        },
    };

    let tcp = dialer.connect_tcp(std::net::SocketAddr::new(ip, port)).await.map_err(ProviderError::Io)?;

    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };
    let request_line = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {user_agent}\r\nConnection: close\r\nAccept: */*\r\n\r\n"
    );

    if https {
        let connector = tls_connector();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProviderError::Dns(format!("invalid TLS server name: {host}")))?;
        let mut stream = connector.connect(server_name, tcp).await.map_err(ProviderError::Io)?;
        stream.write_all(request_line.as_bytes()).await.map_err(ProviderError::Io)?;
        read_response(&mut stream).await
    } else {
        let mut stream = tcp;
        stream.write_all(request_line.as_bytes()).await.map_err(ProviderError::Io)?;
        read_response(&mut stream).await
    }
}

async fn read_response<S>(stream: &mut S) -> Result<(StatusCode, HeaderMap, Bytes)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.map_err(ProviderError::Io)?;

    let header_end = find_header_end(&raw).ok_or_else(|| ProviderError::Dns("malformed http response".into()))?;
    let header_text =
        String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| ProviderError::Dns("empty http response".into()))?;
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProviderError::Dns(format!("malformed status line: {status_line}")))?;
    let status = StatusCode::from_u16(status_code).map_err(|e| ProviderError::Dns(e.to_string()))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.trim().as_bytes()),
                http::header::HeaderValue::from_str(value.trim()),
            ) {
                headers.insert(name, value);
            }
        }
    }

    let body = Bytes::copy_from_slice(&raw[header_end..]);
    Ok((status, headers, body))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
