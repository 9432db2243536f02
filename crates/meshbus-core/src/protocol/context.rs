use super::message::Hello;
use super::serialization::SerializationProtocol;
use serde::Serialize;

/// TLS details of the connection a request arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsInfo {
    pub peer_common_name: Option<String>,
    pub is_validated: bool,
    /// Hex SHA-256 of the peer certificate.
    pub peer_certificate_fingerprint: Option<String>,
}

/// Passed to every request handler alongside its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub peer_hello: Option<Hello>,
    pub tls_info: TlsInfo,
    pub serialization_protocol: SerializationProtocol,
    pub negotiated_api_version: Option<u32>,
}

impl RequestContext {
    /// Name of the calling peer, if it has introduced itself.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_hello.as_ref().map(|hello| hello.name.as_str())
    }
}
