//! Control bridge: the parent/child channel of channel mode
//!
//! The supervisor binds a loopback listener and hands its address and a
//! session token to every worker through the environment. A worker connects,
//! introduces itself with `hello`, and from then on the connection carries
//! `WorkerMessage`s up and `SupervisorCommand`s down, one JSON line each.

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{decode_line, encode_line, SupervisorCommand, WorkerMessage};
use crate::types::WorkerId;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where and how a worker reaches its supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEndpoint {
    /// Loopback address of the bridge listener
    pub addr: SocketAddr,
    /// Per-supervisor session token
    pub token: String,
}

/// Events surfaced by the bridge to the supervisor loop
#[derive(Debug)]
pub enum BridgeEvent {
    /// A worker completed its handshake
    Connected {
        /// Worker that connected
        worker_id: WorkerId,
        /// Channel for commands to this worker
        commands: mpsc::UnboundedSender<SupervisorCommand>,
    },
    /// A worker sent a message
    Message {
        /// Sender
        worker_id: WorkerId,
        /// Decoded message
        message: WorkerMessage,
    },
    /// A worker's connection ended
    Closed {
        /// Worker whose link closed
        worker_id: WorkerId,
    },
}

/// Supervisor side of the bridge
#[derive(Debug)]
pub struct ControlBridge {
    endpoint: BridgeEndpoint,
    accept_task: JoinHandle<()>,
}

impl ControlBridge {
    /// Bind a loopback listener on an ephemeral port
    ///
    /// # Errors
    /// Returns the bind error.
    pub async fn bind() -> std::io::Result<(Self, mpsc::UnboundedReceiver<BridgeEvent>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let endpoint = BridgeEndpoint {
            addr: listener.local_addr()?,
            token: uuid::Uuid::new_v4().to_string(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let token = endpoint.token.clone();
        let accept_task = tokio::spawn(accept_loop(listener, token, events_tx));

        debug!(addr = %endpoint.addr, "control bridge listening");
        Ok((
            Self {
                endpoint,
                accept_task,
            },
            events_rx,
        ))
    }

    /// Endpoint to pass to workers
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &BridgeEndpoint {
        &self.endpoint
    }
}

impl Drop for ControlBridge {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    token: String,
    events: mpsc::UnboundedSender<BridgeEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let token = token.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, &token, events).await {
                        warn!(%peer, %err, "bridge connection rejected");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "bridge accept failed");
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    token: &str,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> Result<(), ProtocolError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let worker_id = loop {
        let Some(line) = lines.next_line().await? else {
            return Err(ProtocolError::ClosedBeforeHandshake);
        };
        match decode_line::<WorkerMessage>(&line)? {
            Some(WorkerMessage::Hello {
                worker_id,
                token: presented,
            }) => {
                if presented != token {
                    return Err(ProtocolError::TokenMismatch(worker_id));
                }
                break worker_id;
            }
            Some(_) => return Err(ProtocolError::MissingHandshake),
            None => {}
        }
    };

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<SupervisorCommand>();
    tokio::spawn(async move {
        while let Some(command) = commands_rx.recv().await {
            let line = match encode_line(&command) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%worker_id, %err, "failed to encode command");
                    continue;
                }
            };
            if let Err(err) = write_half.write_all(&line).await {
                debug!(%worker_id, %err, "command write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    if events
        .send(BridgeEvent::Connected {
            worker_id,
            commands: commands_tx,
        })
        .is_err()
    {
        return Ok(());
    }

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                Ok(Some(message)) => {
                    if events
                        .send(BridgeEvent::Message { worker_id, message })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(%worker_id, %err, "dropping malformed worker message"),
            },
            Ok(None) => break,
            Err(err) => {
                debug!(%worker_id, %err, "bridge read failed");
                break;
            }
        }
    }

    let _ = events.send(BridgeEvent::Closed { worker_id });
    Ok(())
}

/// Worker side of the bridge
///
/// Cheap to clone; all clones share one write half, so concurrent senders
/// never interleave partial lines.
#[derive(Debug, Clone)]
pub struct SupervisorLink {
    worker_id: WorkerId,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl SupervisorLink {
    /// Connect to the supervisor and complete the handshake
    ///
    /// Returns the link and a receiver of supervisor commands. The receiver
    /// yields `None` once the supervisor side closes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Io` if the connection or handshake write fails.
    pub async fn connect(
        endpoint: &BridgeEndpoint,
        worker_id: WorkerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SupervisorCommand>), ProtocolError> {
        let stream = TcpStream::connect(endpoint.addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let hello = encode_line(&WorkerMessage::Hello {
            worker_id,
            token: endpoint.token.clone(),
        })?;
        write_half.write_all(&hello).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line::<SupervisorCommand>(&line) {
                        Ok(Some(command)) => {
                            if commands_tx.send(command).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%worker_id, %err, "dropping malformed command"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!(%worker_id, %err, "supervisor link read failed");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                worker_id,
                writer: Arc::new(Mutex::new(write_half)),
            },
            commands_rx,
        ))
    }

    /// Send one message to the supervisor
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the write fails.
    pub async fn send(&self, message: &WorkerMessage) -> Result<(), TransportError> {
        let line = encode_line(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Id this link introduced itself with
    #[inline]
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}
