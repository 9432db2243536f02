//! Byte-stream peer shared by the socket transports.
//!
//! Each started peer runs one reader task and one writer task. Outbound
//! messages go through a bounded outbox; inbound messages are framed by the
//! peer's [`Framing`] and pushed to an unbounded inbox.

use super::address::{ConnectionArgs, ParsedAddress};
use super::peer::{ClosedNotifier, ClosedPeer, ConnectionClosedCallback, IncomingMessages, Peer, PeerId};
use super::{json_rpc, newline};
use crate::config::TransportConfig;
use crate::error::{MeshbusError, Result};
use crate::protocol::SerializationProtocol;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Login sent in reply to a JSON-RPC server's prompts.
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub(crate) user: String,
    pub(crate) password: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum Framing {
    /// One message per `\n`-terminated line.
    Newline,
    /// Bare JSON values, `\r\n` terminated on send.
    JsonRpc {
        credentials: Option<Credentials>,
        timeout: Duration,
    },
}

enum StreamState {
    Idle(BoxedReader, BoxedWriter),
    Running,
    Closed,
}

struct StreamInner {
    id: PeerId,
    remote_address: Option<String>,
    framing: Framing,
    state: Mutex<StreamState>,
    outbox_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    outbox_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    closed: ClosedNotifier,
}

/// A peer over a socket split into read and write halves.
pub struct StreamPeer {
    inner: Arc<StreamInner>,
}

impl StreamPeer {
    pub(crate) fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        remote_address: Option<String>,
        framing: Framing,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(TransportConfig::OUTBOX_BACKLOG);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StreamInner {
                id: PeerId::next(),
                remote_address,
                framing,
                state: Mutex::new(StreamState::Idle(reader, writer)),
                outbox_tx: Mutex::new(Some(outbox_tx)),
                outbox_rx: Mutex::new(Some(outbox_rx)),
                inbox_tx: Mutex::new(Some(inbox_tx)),
                inbox_rx: Mutex::new(Some(inbox_rx)),
                reader_task: Mutex::new(None),
                writer_task: Mutex::new(None),
                closed: ClosedNotifier::default(),
            }),
        }
    }
}

impl StreamInner {
    fn label(&self) -> &str {
        self.remote_address.as_deref().unwrap_or("inbound")
    }

    fn frame(&self, message: Bytes) -> Bytes {
        match self.framing {
            Framing::Newline if message.ends_with(b"\n") => message,
            Framing::Newline => {
                let mut framed = BytesMut::with_capacity(message.len() + 1);
                framed.put_slice(&message);
                framed.put_u8(b'\n');
                framed.freeze()
            }
            Framing::JsonRpc { .. } => {
                let mut framed = BytesMut::with_capacity(message.len() + 2);
                framed.put_slice(&message);
                framed.put_slice(b"\r\n");
                framed.freeze()
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        reader: BoxedReader,
        inbox: mpsc::UnboundedSender<Bytes>,
        control: mpsc::UnboundedSender<Bytes>,
    ) {
        let mut reader = BufReader::new(reader);
        let result = match self.framing.clone() {
            Framing::Newline => {
                drop(control);
                newline::read_lines(&mut reader, &inbox, TransportConfig::NEWLINE_MAX_MESSAGE_SIZE)
                    .await
            }
            Framing::JsonRpc {
                credentials,
                timeout,
            } => {
                json_rpc::read_values(&mut reader, &inbox, control, credentials.as_ref(), timeout)
                    .await
            }
        };
        match result {
            Ok(()) => debug!(peer = %self.id, address = self.label(), "Peer stream ended"),
            Err(MeshbusError::Io { message, .. }) => {
                warn!(peer = %self.id, address = self.label(), "Failed to read message: {}", message)
            }
            Err(err) => {
                error!(peer = %self.id, address = self.label(), "Unable to read incoming message, resetting connection: {}", err)
            }
        }
        drop(inbox);
        self.close(false).await;
    }

    async fn close(&self, was_requested: bool) {
        let previous = std::mem::replace(&mut *self.state.lock(), StreamState::Closed);
        match previous {
            StreamState::Closed => return,
            StreamState::Idle(..) => {
                self.outbox_tx.lock().take();
                self.inbox_tx.lock().take();
            }
            StreamState::Running => {
                if was_requested {
                    if let Some(reader) = self.reader_task.lock().take() {
                        reader.abort();
                    }
                }
                // Dropping the sender lets the writer flush what is queued and exit.
                self.outbox_tx.lock().take();
                let writer = self.writer_task.lock().take();
                if let Some(mut writer) = writer {
                    if tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, &mut writer)
                        .await
                        .is_err()
                    {
                        warn!(peer = %self.id, "Writer did not drain in time, aborting");
                        writer.abort();
                    }
                }
            }
        }
        debug!(peer = %self.id, address = self.label(), was_requested, "Peer closed");
        self.closed.notify(ClosedPeer {
            id: self.id,
            remote_address: self.remote_address.clone(),
            was_requested,
        });
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut control: mpsc::UnboundedReceiver<Bytes>,
    mut outbox: mpsc::Receiver<Bytes>,
) {
    // Handshake replies first; the reader drops the control sender once done.
    while let Some(reply) = control.recv().await {
        if let Err(e) = writer.write_all(&reply).await {
            error!("Failed to deliver handshake reply: {}", e);
            let _ = writer.shutdown().await;
            return;
        }
    }
    while let Some(message) = outbox.recv().await {
        if let Err(e) = writer.write_all(&message).await {
            error!("Failed to deliver message: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl Drop for StreamPeer {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader_task.lock().take() {
            reader.abort();
        }
        self.inner.outbox_tx.lock().take();
    }
}

#[async_trait]
impl Peer for StreamPeer {
    fn id(&self) -> PeerId {
        self.inner.id
    }

    fn remote_address(&self) -> Option<&str> {
        self.inner.remote_address.as_deref()
    }

    fn serialization_protocol(&self) -> SerializationProtocol {
        match self.inner.framing {
            Framing::Newline => SerializationProtocol::Json,
            Framing::JsonRpc { .. } => SerializationProtocol::None,
        }
    }

    async fn start(&self) -> Result<()> {
        let (reader, writer) = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, StreamState::Running) {
                StreamState::Idle(reader, writer) => (reader, writer),
                other => {
                    *state = other;
                    return Err(MeshbusError::NoConnection(format!(
                        "Peer {} already started or closed",
                        self.inner.id
                    )));
                }
            }
        };
        let outbox = self.inner.outbox_rx.lock().take();
        let inbox = self.inner.inbox_tx.lock().take();
        let (Some(outbox), Some(inbox)) = (outbox, inbox) else {
            return Err(MeshbusError::NoConnection(
                "Connection to peer has been lost".to_string(),
            ));
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.inner.writer_task.lock() = Some(tokio::spawn(write_loop(writer, control_rx, outbox)));
        *self.inner.reader_task.lock() = Some(tokio::spawn(Arc::clone(&self.inner).read_loop(
            reader, inbox, control_tx,
        )));
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.close(true).await;
    }

    fn enqueue_message(&self, message: Bytes) -> Result<()> {
        let framed = self.inner.frame(message);
        let outbox = self.inner.outbox_tx.lock();
        let Some(tx) = outbox.as_ref() else {
            return Err(MeshbusError::NoConnection(
                "Connection to peer has been lost".to_string(),
            ));
        };
        tx.try_send(framed).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                MeshbusError::SendQueueFull(self.inner.label().to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                MeshbusError::NoConnection("Connection to peer has been lost".to_string())
            }
        })
    }

    fn incoming_messages(&self) -> Option<IncomingMessages> {
        self.inner.inbox_rx.lock().take().map(IncomingMessages::new)
    }

    fn register_connection_closed_callback(&self, callback: ConnectionClosedCallback) {
        self.inner.closed.register(callback);
    }
}

impl std::fmt::Debug for StreamPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPeer")
            .field("id", &self.inner.id)
            .field("remote_address", &self.inner.remote_address)
            .field("framing", &self.inner.framing)
            .finish()
    }
}

/// Connect a TCP or Unix socket for `address`.
pub(crate) async fn connect_stream(
    address: &str,
    parsed: &ParsedAddress,
    timeout: Duration,
) -> Result<(BoxedReader, BoxedWriter)> {
    match &parsed.args {
        ConnectionArgs::Network(args) => {
            let port = args
                .port
                .ok_or_else(|| MeshbusError::invalid_address(address, "missing port"))?;
            if args.host.is_empty() {
                return Err(MeshbusError::invalid_address(address, "missing host"));
            }
            let stream = tokio::time::timeout(
                timeout,
                tokio::net::TcpStream::connect((args.host.as_str(), port)),
            )
            .await
            .map_err(|_| MeshbusError::Timeout(format!("Connecting to {}", address)))??;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        ConnectionArgs::Unix { path } => {
            let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
                .await
                .map_err(|_| MeshbusError::Timeout(format!("Connecting to {}", address)))??;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        ConnectionArgs::Unix { .. } => Err(MeshbusError::Unsupported(
            "Unix sockets are not available on this platform".to_string(),
        )),
        ConnectionArgs::FileDescriptor(_) => Err(MeshbusError::Unsupported(
            "Inherited file descriptors are not supported".to_string(),
        )),
        ConnectionArgs::None => Err(MeshbusError::invalid_address(
            address,
            "no connection arguments",
        )),
    }
}
