//! Client-only JSON-RPC transport (`json://`).
//!
//! The remote side speaks bare JSON values with no length prefix or
//! delimiter. A value is framed by its first byte (`{`, `[` or `"`) and read
//! up to each candidate closing byte until it parses. A server requiring a
//! login sends `user:` and `password:` prompts and confirms with `connected:`.

use super::address::{parse_address, MessagingProtocol};
use super::peer::{Listener, NewPeerCallback, Peer, Transport, TransportOptions};
use super::stream::{connect_stream, Credentials, Framing, StreamPeer};
use crate::config::TransportConfig;
use crate::error::{MeshbusError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

const PROMPT_DELIMITER: u8 = b':';

/// Answer login prompts, then read JSON values into `inbox`.
pub(crate) async fn read_values<R>(
    reader: &mut R,
    inbox: &mpsc::UnboundedSender<Bytes>,
    control: mpsc::UnboundedSender<Bytes>,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    if let Some(credentials) = credentials {
        tokio::time::timeout(timeout, authenticate(reader, &control, credentials))
            .await
            .map_err(|_| MeshbusError::Timeout("Unable to authenticate user".to_string()))??;
    }
    drop(control);

    loop {
        let mut first = [0u8; 1];
        if reader.read(&mut first).await? == 0 {
            return Ok(());
        }
        if first[0].is_ascii_whitespace() {
            continue;
        }
        let value = tokio::time::timeout(
            timeout,
            read_value(reader, first[0], TransportConfig::JSON_RPC_MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| {
            MeshbusError::Timeout("Failed to read message within timeout".to_string())
        })??;
        if inbox.send(value).is_err() {
            return Ok(());
        }
    }
}

async fn read_value<R>(reader: &mut R, first: u8, max_message_size: usize) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let end = match first {
        b'{' => b'}',
        b'[' => b']',
        b'"' => b'"',
        other => {
            return Err(MeshbusError::Protocol(format!(
                "Invalid start byte {:?}",
                other as char
            )))
        }
    };
    let mut message = vec![first];
    loop {
        if reader.read_until(end, &mut message).await? == 0 {
            return Err(MeshbusError::NoConnection(
                "Connection closed mid-message".to_string(),
            ));
        }
        if message.len() > max_message_size {
            return Err(MeshbusError::Protocol(format!(
                "Message exceeds {} bytes",
                max_message_size
            )));
        }
        match serde_json::from_slice::<serde_json::Value>(&message) {
            Ok(_) => return Ok(Bytes::from(message)),
            // The closing byte was part of a nested value or a string.
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn authenticate<R>(
    reader: &mut R,
    control: &mpsc::UnboundedSender<Bytes>,
    credentials: &Credentials,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut raw = Vec::new();
        if reader.read_until(PROMPT_DELIMITER, &mut raw).await? == 0 {
            return Err(MeshbusError::NoConnection(
                "Connection closed during authentication".to_string(),
            ));
        }
        let reply = match clean_prompt(&raw).as_str() {
            "user" => format!("{}\r\n", credentials.user),
            "password" => format!("{}\r\n", credentials.password.as_deref().unwrap_or_default()),
            "connected" => {
                debug!("JSON-RPC login accepted");
                return Ok(());
            }
            other => {
                error!(prompt = other, "Received unexpected prompt, sending carriage return");
                "\r\n".to_string()
            }
        };
        control
            .send(Bytes::from(reply))
            .map_err(|_| MeshbusError::NoConnection("Writer closed".to_string()))?;
    }
}

/// `"  User:"` -> `"user"`
fn clean_prompt(raw: &[u8]) -> String {
    let mut prompt = String::from_utf8_lossy(raw).trim().to_lowercase();
    prompt.pop();
    prompt
}

#[derive(Debug, Default)]
pub struct JsonRpcTransport;

impl JsonRpcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn start_server(
        &self,
        _listen_address: &str,
        _on_new_peer: NewPeerCallback,
        _options: TransportOptions,
    ) -> Result<Box<dyn Listener>> {
        Err(MeshbusError::Unsupported(
            "JSON-RPC transport is client only".to_string(),
        ))
    }

    async fn open_connection(
        &self,
        remote_address: &str,
        options: TransportOptions,
    ) -> Result<Arc<dyn Peer>> {
        if options.authenticator.is_some() {
            return Err(MeshbusError::Unsupported(
                "Authenticator support in JsonRPCMessagePeer not implemented".to_string(),
            ));
        }
        if options.supported_api_versions.is_some() {
            return Err(MeshbusError::Unsupported(
                "Supported API versions in JsonRPCMessagePeer not implemented".to_string(),
            ));
        }
        if options.cert_file_directory.is_some() {
            return Err(MeshbusError::Unsupported(
                "The certificate file directory is not implemented for JsonRPCMessagePeer"
                    .to_string(),
            ));
        }

        let parsed = parse_address(remote_address)?;
        if parsed.protocol != MessagingProtocol::JsonRpc {
            return Err(MeshbusError::invalid_address(
                remote_address,
                "not a json-rpc address",
            ));
        }
        if parsed.secure {
            return Err(MeshbusError::Unsupported(
                "SSL support not implemented".to_string(),
            ));
        }
        let credentials = parsed.network_args().and_then(|args| {
            args.user.clone().map(|user| Credentials {
                user,
                password: args.password.clone(),
            })
        });

        let timeout = options
            .timeout
            .unwrap_or(TransportConfig::JSON_RPC_MESSAGE_TIMEOUT);
        let (reader, writer) = connect_stream(remote_address, &parsed, timeout).await?;
        Ok(Arc::new(StreamPeer::new(
            reader,
            writer,
            Some(remote_address.to_string()),
            Framing::JsonRpc {
                credentials,
                timeout,
            },
        )))
    }
}
