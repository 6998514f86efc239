//! Socket establishment: resolve the server, connect, negotiate, then hand the
//! stream to the handler's read loop on its own task.

pub mod dns;
pub mod tls;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConnectionInfo;
use crate::context::BoxedTransport;
use crate::error::{Error, Result};
use crate::handler::ConnectionHandler;
use dns::{ConnectionMode, Endpoint, ServerAddress};

/// Upper bound for one TCP connect; the OS default can reach minutes for unreachable hosts.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

async fn connect_endpoint(endpoint: &Endpoint) -> Result<BoxedTransport> {
    let started = Instant::now();
    let tcp = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(endpoint.address()))
        .await
        .map_err(|_| {
            error!(
                host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
                "TCP connect timed out"
            );
            Error::Timeout(format!(
                "TCP connect to {} after {}s",
                endpoint.address(),
                TCP_CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| {
            error!(
                host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                error = %e, error_kind = ?e.kind(),
                "TCP connect failed"
            );
            Error::Io(e)
        })?;
    if let Err(e) = tcp.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }

    let transport: BoxedTransport = match endpoint.mode {
        ConnectionMode::Tcp => Box::new(tcp),
        ConnectionMode::DirectTls => Box::new(tls::upgrade(tcp, endpoint.tls_name()).await?),
    };
    info!(
        host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
        tls_name = endpoint.tls_name(), connect_ms = started.elapsed().as_millis() as u64,
        "Connected"
    );
    Ok(transport)
}

/// Resolve `info` and connect to the first endpoint that accepts.
pub async fn open_transport(info: &ConnectionInfo) -> Result<BoxedTransport> {
    let endpoints = match dns::parse_server_input(info.server_input()) {
        ServerAddress::Explicit(mut endpoint) => {
            if endpoint.domain.is_none() && !info.domain.is_empty() {
                endpoint.domain = Some(info.domain.clone());
            }
            info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Using explicit endpoint");
            vec![endpoint]
        }
        ServerAddress::Domain(domain) => dns::resolve(&domain).await?,
    };

    let total = endpoints.len();
    let mut last_error = None;
    for (attempt, endpoint) in endpoints.iter().enumerate() {
        match connect_endpoint(endpoint).await {
            Ok(transport) => return Ok(transport),
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, attempt = attempt + 1, total, error = %e, "Endpoint failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Resolve(format!("no endpoints for {}", info.server_input()))))
}

/// Negotiate over an already open transport and spawn the read loop.
///
/// On handshake failure the handler is shut down and the transport closed.
pub async fn establish(
    handler: &Arc<ConnectionHandler>,
    transport: BoxedTransport,
    info: &ConnectionInfo,
) -> Result<JoinHandle<()>> {
    if let Err(e) = handler.handshake(transport, info).await {
        handler.shutdown();
        // Already stopped: runs cleanup only
        handler.handle().await;
        return Err(e);
    }

    let running = Arc::clone(handler);
    Ok(tokio::spawn(async move { running.handle().await }))
}

/// Start `handler`, connect per `info`, negotiate, and return the read loop task.
///
/// The returned task finishes when the stream ends or the handler shuts down.
pub async fn connect(handler: &Arc<ConnectionHandler>, info: &ConnectionInfo) -> Result<JoinHandle<()>> {
    info.validate()?;
    handler.start().await;
    let transport = match open_transport(info).await {
        Ok(transport) => transport,
        Err(e) => {
            handler.shutdown();
            return Err(e);
        }
    };
    establish(handler, transport, info).await
}
