//! Newline-delimited transport over TCP (`tcp://`) and Unix sockets (`unix://`).

use super::address::{
    format_address, parse_address, AddressFamily, AddressSpec, ConnectionArgs, MessagingProtocol, ParsedAddress,
};
use super::peer::{Listener, NewPeerCallback, Peer, Transport, TransportOptions};
use super::stream::{connect_stream, BoxedReader, BoxedWriter, Framing, StreamPeer};
use crate::config::TransportConfig;
use crate::error::{MeshbusError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Read `\n`-terminated lines into `inbox` until end of stream.
///
/// Surrounding whitespace is trimmed and blank lines are skipped. A final
/// line without its terminator is discarded.
pub(crate) async fn read_lines<R>(
    reader: &mut R,
    inbox: &mpsc::UnboundedSender<Bytes>,
    max_message_size: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(max_message_size as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if line.last() != Some(&b'\n') {
            if line.len() > max_message_size {
                return Err(MeshbusError::Protocol(format!(
                    "Message exceeds {} bytes",
                    max_message_size
                )));
            }
            if !line.trim_ascii().is_empty() {
                error!("incomplete read: {}", String::from_utf8_lossy(&line));
            }
            return Ok(());
        }
        let message = line.trim_ascii();
        if message.is_empty() {
            continue;
        }
        if inbox.send(Bytes::copy_from_slice(message)).is_err() {
            return Ok(());
        }
    }
}

fn check_address(address: &str) -> Result<ParsedAddress> {
    let parsed = parse_address(address)?;
    if parsed.protocol != MessagingProtocol::NewlineDelimited {
        return Err(MeshbusError::invalid_address(
            address,
            "not a newline-delimited address",
        ));
    }
    if parsed.secure {
        return Err(MeshbusError::Unsupported(
            "SSL support not implemented".to_string(),
        ));
    }
    Ok(parsed)
}

/// Transport for `tcp://` and `unix://` addresses.
#[derive(Debug, Default)]
pub struct NewlineTransport;

impl NewlineTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NewlineTransport {
    async fn start_server(
        &self,
        listen_address: &str,
        on_new_peer: NewPeerCallback,
        options: TransportOptions,
    ) -> Result<Box<dyn Listener>> {
        options.reject_extensions("NewlineDelimitedMessagePeer", true)?;
        let parsed = check_address(listen_address)?;
        if parsed.family == AddressFamily::Packet {
            return Err(MeshbusError::Unsupported(
                "Bluetooth sockets are not supported".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (local_address, unix_path, task) = match &parsed.args {
            ConnectionArgs::Network(args) => {
                let host = if args.host.is_empty() {
                    "0.0.0.0"
                } else {
                    args.host.as_str()
                };
                let listener =
                    tokio::net::TcpListener::bind((host, args.port.unwrap_or(0))).await?;
                let bound = listener.local_addr()?;
                let ip = match bound.ip() {
                    IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    ip => ip,
                };
                let host = match ip {
                    IpAddr::V6(ip) => format!("[{}]", ip),
                    IpAddr::V4(ip) => ip.to_string(),
                };
                let local_address = format_address(&AddressSpec::tcp(host, bound.port()))?;
                info!("Newline-delimited server listening on {}", bound);
                let task = tokio::spawn(accept_tcp(listener, on_new_peer, shutdown_rx));
                (local_address, None, task)
            }
            #[cfg(unix)]
            ConnectionArgs::Unix { path } => {
                remove_stale_socket(path);
                let listener = tokio::net::UnixListener::bind(path)?;
                let local_address =
                    format_address(&AddressSpec::unix(path.to_string_lossy().into_owned()))?;
                info!("Newline-delimited server listening on {}", path.display());
                let task = tokio::spawn(accept_unix(listener, on_new_peer, shutdown_rx));
                (local_address, Some(path.clone()), task)
            }
            #[cfg(not(unix))]
            ConnectionArgs::Unix { .. } => {
                return Err(MeshbusError::Unsupported(
                    "Unix sockets are not available on this platform".to_string(),
                ))
            }
            ConnectionArgs::FileDescriptor(_) => {
                return Err(MeshbusError::Unsupported(
                    "Inherited file descriptors are not supported".to_string(),
                ))
            }
            ConnectionArgs::None => {
                return Err(MeshbusError::invalid_address(
                    listen_address,
                    "no connection arguments",
                ))
            }
        };
        Ok(Box::new(SocketListener {
            local_address,
            unix_path,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }))
    }

    async fn open_connection(
        &self,
        remote_address: &str,
        options: TransportOptions,
    ) -> Result<Arc<dyn Peer>> {
        options.reject_extensions("NewlineDelimitedMessagePeer", false)?;
        let parsed = check_address(remote_address)?;
        if parsed.family == AddressFamily::Packet {
            return Err(MeshbusError::Unsupported(
                "Bluetooth sockets are not supported".to_string(),
            ));
        }
        let timeout = options.timeout.unwrap_or(TransportConfig::CONNECT_TIMEOUT);
        let (reader, writer) = connect_stream(remote_address, &parsed, timeout).await?;
        Ok(Arc::new(StreamPeer::new(
            reader,
            writer,
            Some(remote_address.to_string()),
            Framing::Newline,
        )))
    }
}

fn accepted(on_new_peer: &NewPeerCallback, reader: BoxedReader, writer: BoxedWriter, from: String) {
    let peer: Arc<dyn Peer> = Arc::new(StreamPeer::new(reader, writer, None, Framing::Newline));
    let on_new_peer = Arc::clone(on_new_peer);
    tokio::spawn(async move {
        debug!("Connection from {}", from);
        if let Err(e) = on_new_peer(peer).await {
            debug!("Connection from {} not added: {}", from, e);
        }
    });
}

async fn accept_tcp(
    listener: tokio::net::TcpListener,
    on_new_peer: NewPeerCallback,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Newline-delimited server shutting down");
                break;
            }
            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    accepted(&on_new_peer, Box::new(reader), Box::new(writer), peer_addr.to_string());
                }
                Err(e) => error!("Accept error: {}", e),
            },
        }
    }
}

#[cfg(unix)]
async fn accept_unix(
    listener: tokio::net::UnixListener,
    on_new_peer: NewPeerCallback,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Unix socket server shutting down");
                break;
            }
            accept_result = listener.accept() => match accept_result {
                Ok((stream, _)) => {
                    let (reader, writer) = stream.into_split();
                    accepted(&on_new_peer, Box::new(reader), Box::new(writer), "unix socket".to_string());
                }
                Err(e) => error!("Accept error: {}", e),
            },
        }
    }
}

/// Remove a socket file left behind by a previous process.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) {
    use std::os::unix::fs::FileTypeExt;
    if std::fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_socket()) {
        debug!("Removing stale socket {}", path.display());
        let _ = std::fs::remove_file(path);
    }
}

struct SocketListener {
    local_address: String,
    unix_path: Option<PathBuf>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Listener for SocketListener {
    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn unix_socket_path(&self) -> Option<PathBuf> {
        self.unix_path.clone()
    }

    async fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
