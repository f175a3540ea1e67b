//! Bootstrap DNS Stub (§4.5): a minimal resolver used only by the Request
//! Pipeline when a custom DNS address is configured.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsConnector, rustls};
use url::Url;

use crate::core::error::{ProviderError, Result};

const UDP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Transport {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Tls { addr: SocketAddr, sni: String },
    Https { endpoint: Url, sni: String },
}

/// A configured bootstrap resolver address, parsed once at provider
/// construction time.
pub struct BootstrapDns {
    transport: Transport,
}

impl BootstrapDns {
    /// Accepts `tcp://`, `udp://`, `tls://`, `https://`, or a bare
    /// `host[:port]` (defaulting to UDP/53), per §4.5.
    pub fn parse(addr: &str) -> Result<Self> {
        let transport = if let Some(rest) = addr.strip_prefix("tcp://") {
            Transport::Tcp(resolve_host_port(rest, 53)?)
        } else if let Some(rest) = addr.strip_prefix("udp://") {
            Transport::Udp(resolve_host_port(rest, 53)?)
        } else if addr.starts_with("tls://") {
            let url = Url::parse(addr).map_err(|e| ProviderError::Dns(e.to_string()))?;
            let host = url.host_str().ok_or_else(|| ProviderError::Dns("missing host".into()))?;
            let port = url.port().unwrap_or(853);
            let sni = sni_override(&url).unwrap_or_else(|| host.to_string());
            Transport::Tls { addr: resolve_host_port(&format!("{host}:{port}"), 853)?, sni }
        } else if addr.starts_with("https://") {
            let mut url = Url::parse(addr).map_err(|e| ProviderError::Dns(e.to_string()))?;
            let host = url.host_str().ok_or_else(|| ProviderError::Dns("missing host".into()))?.to_string();
            let sni = sni_override(&url).unwrap_or_else(|| host.clone());
            if url.path().is_empty() || url.path() == "/" {
                url.set_path("/dns-query");
            }
            url.set_query(None);
            Transport::Https { endpoint: url, sni }
        } else {
            Transport::Udp(resolve_host_port(addr, 53)?)
        };
        Ok(BootstrapDns { transport })
    }

    /// Issues A and/or AAAA queries, concatenating A results before AAAA
    /// results (§4.5). Queries run serially over the same connection for
    /// TCP/UDP/TLS, or as independent POSTs for DoH.
    pub async fn lookup(&self, domain: &str, want_a: bool, want_aaaa: bool) -> Result<Vec<IpAddr>> {
        let mut types = Vec::new();
        if want_a {
            types.push(RecordType::A);
        }
        if want_aaaa {
            types.push(RecordType::AAAA);
        }
        if types.is_empty() {
            return Err(ProviderError::Dns("no query types requested".into()));
        }

        let mut addrs = Vec::new();
        match &self.transport {
            Transport::Udp(addr) => {
                let socket = UdpSocket::bind(bind_addr_for(*addr)).await.map_err(ProviderError::Io)?;
                socket.connect(addr).await.map_err(ProviderError::Io)?;
                for qtype in types {
                    let query = build_query(domain, qtype)?;
                    socket.send(&query).await.map_err(ProviderError::Io)?;
                    let mut buf = vec![0u8; 4096];
                    let n = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
                        .await
                        .map_err(|_| ProviderError::Dns("udp query timed out".into()))?
                        .map_err(ProviderError::Io)?;
                    addrs.extend(extract_addresses(&buf[..n])?);
                }
            }
            Transport::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr).await.map_err(ProviderError::Io)?;
                for qtype in types {
                    let query = build_query(domain, qtype)?;
                    addrs.extend(query_framed_stream(&mut stream, &query).await?);
                }
            }
            Transport::Tls { addr, sni } => {
                let tcp = TcpStream::connect(addr).await.map_err(ProviderError::Io)?;
                let connector = tls_connector();
                let server_name = ServerName::try_from(sni.clone())
                    .map_err(|_| ProviderError::Dns(format!("invalid SNI: {sni}")))?;
                let mut stream = connector.connect(server_name, tcp).await.map_err(ProviderError::Io)?;
                for qtype in types {
                    let query = build_query(domain, qtype)?;
                    addrs.extend(query_framed_stream(&mut stream, &query).await?);
                }
            }
            Transport::Https { endpoint, sni } => {
                for qtype in types {
                    let query = build_query(domain, qtype)?;
                    let body = post_doh(endpoint, sni, &query).await?;
                    addrs.extend(extract_addresses(&body)?);
                }
            }
        }
        Ok(addrs)
    }
}

/// POSTs a DoH query over a TLS connection whose SNI is `sni` rather than
/// `endpoint`'s own host, so the `?sni=` override (§4.5) actually takes
/// effect — `reqwest` derives SNI from the request URL's host and gives no
/// way to substitute it, so this drives the handshake manually like
/// `raw_http.rs` does for the narrow `Dialer` seam.
async fn post_doh(endpoint: &Url, sni: &str, query: &[u8]) -> Result<Vec<u8>> {
    let host = endpoint.host_str().ok_or_else(|| ProviderError::Dns("doh endpoint has no host".into()))?;
    let port = endpoint.port_or_known_default().unwrap_or(443);
    let addr = resolve_host_port(&format!("{host}:{port}"), port)?;

    let tcp = TcpStream::connect(addr).await.map_err(ProviderError::Io)?;
    let connector = tls_connector();
    let server_name = ServerName::try_from(sni.to_string()).map_err(|_| ProviderError::Dns(format!("invalid SNI: {sni}")))?;
    let mut stream = connector.connect(server_name, tcp).await.map_err(ProviderError::Io)?;

    let path = if endpoint.query().is_some() { format!("{}?{}", endpoint.path(), endpoint.query().unwrap()) } else { endpoint.path().to_string() };
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/dns-message\r\nAccept: application/dns-message\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        query.len()
    );
    stream.write_all(request.as_bytes()).await.map_err(ProviderError::Io)?;
    stream.write_all(query).await.map_err(ProviderError::Io)?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.map_err(ProviderError::Io)?;
    let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4).ok_or_else(|| ProviderError::Dns("malformed doh response".into()))?;
    Ok(raw[header_end..].to_vec())
}

fn sni_override(url: &Url) -> Option<String> {
    url.query_pairs().find(|(k, _)| k == "sni").map(|(_, v)| v.to_string())
}

fn resolve_host_port(host_port: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = host_port.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host_port.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let candidate = if host_port.contains(':') { host_port.to_string() } else { format!("{host_port}:{default_port}") };
    candidate
        .to_socket_addrs()
        .map_err(|e| ProviderError::Dns(format!("invalid bootstrap dns address '{host_port}': {e}")))?
        .next()
        .ok_or_else(|| ProviderError::Dns(format!("could not resolve bootstrap dns address '{host_port}'")))
}

fn bind_addr_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn query_id() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos & 0xffff) as u16
}

fn build_query(domain: &str, qtype: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_ascii(domain).map_err(|e| ProviderError::Dns(e.to_string()))?;
    let mut message = Message::new();
    message
        .set_id(query_id())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    message.to_vec().map_err(|e| ProviderError::Dns(e.to_string()))
}

async fn query_framed_stream<S>(stream: &mut S, query: &[u8]) -> Result<Vec<IpAddr>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| ProviderError::Dns("query too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await.map_err(ProviderError::Io)?;
    stream.write_all(query).await.map_err(ProviderError::Io)?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(ProviderError::Io)?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;
    let mut resp_buf = vec![0u8; resp_len];
    stream.read_exact(&mut resp_buf).await.map_err(ProviderError::Io)?;
    extract_addresses(&resp_buf)
}

fn extract_addresses(raw: &[u8]) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(raw).map_err(|e| ProviderError::Dns(e.to_string()))?;
    let addrs = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(addrs)
}

fn tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(std::sync::Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ip_as_udp_53() {
        let dns = BootstrapDns::parse("1.1.1.1").unwrap();
        assert!(matches!(dns.transport, Transport::Udp(addr) if addr.port() == 53));
    }

    #[test]
    fn parses_tls_scheme_with_default_port() {
        let dns = BootstrapDns::parse("tls://1.1.1.1").unwrap();
        match dns.transport {
            Transport::Tls { addr, sni } => {
                assert_eq!(addr.port(), 853);
                assert_eq!(sni, "1.1.1.1");
            }
            other => panic!("expected tls transport, got {other:?}"),
        }
    }

    #[test]
    fn parses_https_scheme_defaulting_dns_query_path() {
        let dns = BootstrapDns::parse("https://1.1.1.1").unwrap();
        match dns.transport {
            Transport::Https { endpoint, .. } => assert_eq!(endpoint.path(), "/dns-query"),
            other => panic!("expected https transport, got {other:?}"),
        }
    }

    #[test]
    fn honors_explicit_sni_query_parameter() {
        let dns = BootstrapDns::parse("tls://1.1.1.1/?sni=cloudflare-dns.com").unwrap();
        match dns.transport {
            Transport::Tls { sni, .. } => assert_eq!(sni, "cloudflare-dns.com"),
            other => panic!("expected tls transport, got {other:?}"),
        }
    }

    #[test]
    fn doh_stores_sni_override_separately_from_endpoint_host() {
        let dns = BootstrapDns::parse("https://1.1.1.1/dns-query?sni=cf").unwrap();
        match dns.transport {
            Transport::Https { endpoint, sni } => {
                assert_eq!(endpoint.host_str(), Some("1.1.1.1"));
                assert_eq!(endpoint.port_or_known_default(), Some(443));
                assert_eq!(sni, "cf");
            }
            other => panic!("expected https transport, got {other:?}"),
        }
    }
}
