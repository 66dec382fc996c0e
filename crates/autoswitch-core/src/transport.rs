//! Retirement transports
//!
//! Both strategies sit behind `RetirementTransport`, so the drift gate call
//! site is identical in either mode:
//! - `ChannelTransport` sends `disconnect` to this system's supervisor
//! - `HostControlTransport` writes `recycle` to an external host manager

use crate::bridge::SupervisorLink;
use crate::config::ControlEndpoint;
use crate::error::TransportError;
use crate::protocol::{WorkerMessage, RECYCLE_COMMAND};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Delivers a worker's retirement request
#[async_trait::async_trait]
pub trait RetirementTransport: Send + Sync {
    /// Ask for this worker to be replaced
    async fn signal_retirement(&self) -> Result<(), TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Channel mode: `disconnect` over the supervisor link
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    link: SupervisorLink,
}

impl ChannelTransport {
    /// Create transport over an established link
    #[inline]
    #[must_use]
    pub fn new(link: SupervisorLink) -> Self {
        Self { link }
    }
}

#[async_trait::async_trait]
impl RetirementTransport for ChannelTransport {
    async fn signal_retirement(&self) -> Result<(), TransportError> {
        self.link.send(&WorkerMessage::Disconnect).await?;
        info!(worker_id = %self.link.worker_id(), "sent disconnect to supervisor");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Host-delegated mode: connect, write `recycle`, close
#[derive(Debug, Clone)]
pub struct HostControlTransport {
    endpoint: ControlEndpoint,
}

impl HostControlTransport {
    /// Create transport for `endpoint`
    #[inline]
    #[must_use]
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self { endpoint }
    }

    /// Endpoint written to
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl RetirementTransport for HostControlTransport {
    async fn signal_retirement(&self) -> Result<(), TransportError> {
        send_recycle(&self.endpoint).await?;
        info!(endpoint = %self.endpoint, "sent recycle to host manager");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "host-delegated"
    }
}

/// Write the recycle command to a control endpoint
///
/// # Errors
/// Returns `TransportError::EndpointUnreachable` if the connection cannot be
/// opened, or `TransportError::Io` if the write fails.
pub async fn send_recycle(endpoint: &ControlEndpoint) -> Result<(), TransportError> {
    let unreachable = |source: std::io::Error| TransportError::EndpointUnreachable {
        endpoint: endpoint.to_string(),
        source,
    };

    match endpoint {
        ControlEndpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(unreachable)?;
            write_and_close(stream).await
        }
        #[cfg(unix)]
        ControlEndpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(unreachable)?;
            write_and_close(stream).await
        }
        #[cfg(windows)]
        ControlEndpoint::NamedPipe(name) => {
            let pipe = tokio::net::windows::named_pipe::ClientOptions::new()
                .open(name)
                .map_err(unreachable)?;
            write_and_close(pipe).await
        }
    }
}

async fn write_and_close<S>(mut stream: S) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(RECYCLE_COMMAND).await?;
    stream.shutdown().await?;
    Ok(())
}
