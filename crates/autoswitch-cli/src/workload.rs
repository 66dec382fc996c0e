//! Reference workloads
//!
//! `serve` is the interesting one: every worker binds the same port with
//! `SO_REUSEPORT`, so a successor can start accepting before its
//! predecessor stops. Each connection is one unit of work: consult the
//! drift gate, then answer with the worker's version on a single line.

use anyhow::Context;
use autoswitch_core::WorkerContext;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const BACKLOG: u32 = 1024;
/// Accept-queue silence after which a retiring listener is closed
const BACKLOG_QUIET: Duration = Duration::from_millis(2);

pub(crate) async fn serve(ctx: WorkerContext, port: u16) -> anyhow::Result<()> {
    let listener = bind_shared(port).with_context(|| format!("binding port {port}"))?;
    info!(port, version = %ctx.version(), "accepting connections");
    ctx.mark_listening().await;

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = ctx.shutdown_requested() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(answer(ctx.clone(), stream, peer));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection(joined);
            }
        }
    }

    drain_backlog(&ctx, &listener, &mut connections).await;
    drop(listener);
    info!(in_flight = connections.len(), "stopped accepting; draining");
    while let Some(joined) = connections.join_next().await {
        log_connection(joined);
    }
    Ok(())
}

/// Take every connection the kernel already queued on this socket.
///
/// Closing a `SO_REUSEPORT` listener resets connections still waiting in its
/// accept queue instead of handing them to the other sockets of the group.
async fn drain_backlog(
    ctx: &WorkerContext,
    listener: &TcpListener,
    connections: &mut JoinSet<std::io::Result<()>>,
) {
    let mut drained = 0usize;
    while let Ok(accepted) = tokio::time::timeout(BACKLOG_QUIET, listener.accept()).await {
        match accepted {
            Ok((stream, peer)) => {
                drained += 1;
                connections.spawn(answer(ctx.clone(), stream, peer));
            }
            Err(err) => {
                warn!(%err, "accept failed while draining backlog");
                break;
            }
        }
    }
    debug!(drained, "accept queue drained");
}

pub(crate) async fn throw(after: Duration) -> anyhow::Result<()> {
    if !after.is_zero() {
        tokio::time::sleep(after).await;
    }
    anyhow::bail!("I told you I'd throw")
}

pub(crate) async fn stall(ctx: WorkerContext) -> anyhow::Result<()> {
    info!(version = %ctx.version(), "stalling; listening will never be reported");
    ctx.shutdown_requested().await;
    Ok(())
}

fn bind_shared(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    socket.listen(BACKLOG)
}

async fn answer(ctx: WorkerContext, mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
    if let Err(err) = ctx.check_drift().await {
        warn!(%err, "version check failed; serving anyway");
    }
    debug!(%peer, version = %ctx.version(), "answering");
    stream
        .write_all(format!("{}\n", ctx.version()).as_bytes())
        .await?;
    stream.shutdown().await
}

fn log_connection(joined: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%err, "connection ended with error"),
        Err(err) => warn!(%err, "connection task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throw_fails_after_delay() {
        let started = tokio::time::Instant::now();
        let err = throw(Duration::from_millis(20)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(err.to_string(), "I told you I'd throw");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shared_port_binds_twice() {
        let first = bind_shared(0).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_shared(port).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
