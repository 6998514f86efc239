//! Server address parsing and SRV resolution (RFC 6120 section 3.2).

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::Result;

pub const DEFAULT_STARTTLS_PORT: u16 = 5222;
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP, upgraded in-band through STARTTLS if offered.
    Tcp,
    /// TLS from the first byte.
    DirectTls,
}

/// One concrete place to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain when it differs from `host` (SRV targets).
    pub domain: Option<String>,
}

impl Endpoint {
    /// Name for TLS SNI and certificate checks: the XMPP domain, not the SRV target.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the user asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Explicit(Endpoint),
    /// Bare domain, looked up through SRV.
    Domain(String),
}

fn strip_domain_query(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((rest, query)) => (rest, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn explicit(host_port: &str, default_port: u16, mode: Option<ConnectionMode>, domain: Option<String>) -> Endpoint {
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (host_port, default_port),
        },
        None => (host_port, default_port),
    };
    let mode = mode.unwrap_or(if port == DEFAULT_DIRECT_TLS_PORT {
        ConnectionMode::DirectTls
    } else {
        ConnectionMode::Tcp
    });
    Endpoint {
        host: host.to_string(),
        port,
        mode,
        domain,
    }
}

/// Accepted forms: `tls://host[:port][?domain=d]`, `tcp://host[:port][?domain=d]`,
/// `host:port` (5223 means direct TLS) and a bare domain.
pub fn parse_server_input(input: &str) -> ServerAddress {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix("tls://") {
        let (host_port, domain) = strip_domain_query(rest);
        return ServerAddress::Explicit(explicit(
            host_port,
            DEFAULT_DIRECT_TLS_PORT,
            Some(ConnectionMode::DirectTls),
            domain,
        ));
    }
    if let Some(rest) = input.strip_prefix("tcp://") {
        let (host_port, domain) = strip_domain_query(rest);
        return ServerAddress::Explicit(explicit(
            host_port,
            DEFAULT_STARTTLS_PORT,
            Some(ConnectionMode::Tcp),
            domain,
        ));
    }

    match input.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => {
            ServerAddress::Explicit(explicit(input, DEFAULT_STARTTLS_PORT, None, None))
        }
        _ => ServerAddress::Domain(input.to_string()),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn lookup_srv(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: ConnectionMode,
) -> Vec<Endpoint> {
    let name = format!("{}.{}", service, domain);
    let started = Instant::now();
    let lookup = match resolver.srv_lookup(name.as_str()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            info!(domain, srv = %name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    // Priority ascending, then weight descending (RFC 2782)
    records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));

    let endpoints: Vec<Endpoint> = records
        .into_iter()
        .filter_map(|r| {
            let target = r.target().to_string().trim_end_matches('.').to_string();
            // "." means the service is explicitly unavailable
            if target.is_empty() {
                return None;
            }
            Some(Endpoint {
                host: target,
                port: r.port(),
                mode,
                domain: Some(domain.to_string()),
            })
        })
        .collect();
    info!(domain, srv = %name, count = endpoints.len(), lookup_ms = elapsed_ms(started), "SRV lookup complete");
    endpoints
}

/// Candidate endpoints for `domain` in connection-attempt order.
///
/// `_xmpps-client` records come first, then `_xmpp-client`; `domain:5222`
/// is used only when neither exists.
pub async fn resolve(domain: &str) -> Result<Vec<Endpoint>> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = lookup_srv(&resolver, domain, "_xmpps-client._tcp", ConnectionMode::DirectTls).await;
    endpoints.extend(lookup_srv(&resolver, domain, "_xmpp-client._tcp", ConnectionMode::Tcp).await);

    if endpoints.is_empty() {
        warn!(domain, "No SRV records found, falling back to {}:{}", domain, DEFAULT_STARTTLS_PORT);
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: DEFAULT_STARTTLS_PORT,
            mode: ConnectionMode::Tcp,
            domain: None,
        });
    }
    info!(domain, total = endpoints.len(), resolve_ms = elapsed_ms(started), "Resolved XMPP server");
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, mode: ConnectionMode, domain: Option<&str>) -> ServerAddress {
        ServerAddress::Explicit(Endpoint {
            host: host.to_string(),
            port,
            mode,
            domain: domain.map(str::to_string),
        })
    }

    #[test]
    fn test_parse_tls_scheme() {
        assert_eq!(
            parse_server_input("tls://chat.example.com:5270"),
            endpoint("chat.example.com", 5270, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("tls://chat.example.com"),
            endpoint("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
    }

    #[test]
    fn test_parse_tcp_scheme_with_domain() {
        assert_eq!(
            parse_server_input("tcp://v4.mdosch.de:5222?domain=diebesban.de"),
            endpoint("v4.mdosch.de", 5222, ConnectionMode::Tcp, Some("diebesban.de"))
        );
        assert_eq!(
            parse_server_input("tcp://chat.example.com"),
            endpoint("chat.example.com", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_host_port_picks_mode_from_port() {
        assert_eq!(
            parse_server_input("chat.example.com:5223"),
            endpoint("chat.example.com", 5223, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("chat.example.com:5280"),
            endpoint("chat.example.com", 5280, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_ipv6_with_port() {
        assert_eq!(
            parse_server_input("[::1]:5222"),
            endpoint("[::1]", 5222, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_bare_domain() {
        assert_eq!(
            parse_server_input("  process-one.net  "),
            ServerAddress::Domain("process-one.net".to_string())
        );
    }

    #[test]
    fn test_tls_name_prefers_domain() {
        let srv = Endpoint {
            host: "v4.mdosch.de".to_string(),
            port: 5222,
            mode: ConnectionMode::Tcp,
            domain: Some("diebesban.de".to_string()),
        };
        assert_eq!(srv.tls_name(), "diebesban.de");
        assert_eq!(srv.address(), "v4.mdosch.de:5222");

        let direct = Endpoint { domain: None, ..srv };
        assert_eq!(direct.tls_name(), "v4.mdosch.de");
    }
}
