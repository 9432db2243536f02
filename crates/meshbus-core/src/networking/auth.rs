//! Peer authentication policy.
//!
//! Transports that negotiate TLS consult an [`Authenticator`] to decide how a
//! peer proves its identity and whether a presented certificate is trusted.
//! The policy itself (which fingerprints are expected, which hosts use which
//! method) is supplied by the application through [`AuthenticationPolicy`].

use super::address::parse_address;
use crate::error::{MeshbusError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Home id carried by devices that have not been assigned to a home yet.
pub const UNASSIGNED_HOME_ID: &str = "unassigned";

/// Prefix of the connection headers carrying peer identity.
pub const HEADER_PREFIX: &str = "x-meshbus-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationMethod {
    None,
    CertificateSubject,
    CertificateFingerprint,
    Jwt,
}

#[async_trait]
pub trait AuthenticationPolicy: Send + Sync {
    /// Reject peers whose identity cannot be verified at all.
    fn strict(&self) -> bool;

    fn default_authentication_method(&self) -> AuthenticationMethod;

    fn authentication_method_for_host(&self, hostname: &str) -> AuthenticationMethod;

    /// Hex SHA-256 fingerprint expected for `device_id` in `home_id`, if known.
    async fn expected_certificate_fingerprint(
        &self,
        device_id: &str,
        home_id: &str,
    ) -> Option<String>;

    fn accept_client_certificate_as_header(&self) -> bool {
        false
    }

    fn allow_unassigned_home_id(&self) -> bool {
        false
    }
}

pub struct Authenticator {
    policy: Arc<dyn AuthenticationPolicy>,
}

impl Authenticator {
    pub fn new(policy: Arc<dyn AuthenticationPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<dyn AuthenticationPolicy> {
        &self.policy
    }

    /// Check a certificate presented by `device_id` of `home_id` against the
    /// fingerprint the policy expects.
    pub async fn validate_certificate(
        &self,
        device_id: &str,
        home_id: &str,
        certificate: &[u8],
    ) -> bool {
        if home_id == UNASSIGNED_HOME_ID && self.policy.allow_unassigned_home_id() {
            return true;
        }
        match self
            .policy
            .expected_certificate_fingerprint(device_id, home_id)
            .await
        {
            Some(expected) if !expected.is_empty() => {
                certificate_fingerprint(certificate).eq_ignore_ascii_case(&expected)
            }
            _ => false,
        }
    }

    /// Pick the authentication method for a peer.
    ///
    /// Outbound peers (with an address) use no authentication over plaintext
    /// and the per-host method over TLS. Inbound peers presenting an
    /// `authentication_token` connection parameter use JWT.
    pub fn authentication_method_for_peer(
        &self,
        address: Option<&str>,
        connection_params: Option<&HashMap<String, String>>,
    ) -> Result<AuthenticationMethod> {
        let mut method = self.policy.default_authentication_method();
        if let Some(address) = address {
            let parsed = parse_address(address)?;
            if parsed.secure {
                if let Some(host) = parsed.host() {
                    method = self.policy.authentication_method_for_host(host);
                }
            } else {
                method = AuthenticationMethod::None;
            }
        } else if connection_params
            .and_then(|params| params.get("authentication_token"))
            .is_some_and(|token| !token.is_empty())
        {
            method = AuthenticationMethod::Jwt;
        }
        Ok(method)
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("strict", &self.policy.strict())
            .finish()
    }
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn certificate_fingerprint(certificate: &[u8]) -> String {
    hex::encode(Sha256::digest(certificate))
}

/// Split a certificate common name of the form `device_id:home_id`.
pub fn verify_common_name(common_name: &str) -> Result<(String, String)> {
    match common_name.split_once(':') {
        Some((device, home)) if !device.is_empty() && !home.is_empty() && !home.contains(':') => {
            Ok((device.to_string(), home.to_string()))
        }
        _ => Err(MeshbusError::Unauthorized(format!(
            "Invalid common name {:?}",
            common_name
        ))),
    }
}

/// Common name from a `client-cert-subj` header (`/CN=device:home/O=...`),
/// as forwarded by a TLS-terminating proxy.
pub fn common_name_from_headers(headers: &HashMap<String, String>) -> Option<String> {
    let subject = headers.get(&format!("{}client-cert-subj", HEADER_PREFIX))?;
    subject
        .split('/')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "CN")
        .map(|(_, value)| value.to_string())
}

/// Check that a common name matches the `device-id` and `home-id` headers.
pub fn verify_common_name_against_header_ids(
    common_name: &str,
    headers: &HashMap<String, String>,
) -> bool {
    let header = |name: &str| headers.get(&format!("{}{}", HEADER_PREFIX, name));
    let (device_id, home_id) = (header("device-id"), header("home-id"));
    let Ok((cert_device, cert_home)) = verify_common_name(common_name) else {
        error!(common_name, "Malformed common name");
        return false;
    };
    if device_id != Some(&cert_device) {
        error!(?device_id, ?home_id, "Error validating common name: device ID mismatch");
        return false;
    }
    if home_id != Some(&cert_home) {
        error!(?device_id, ?home_id, "Error validating common name: home ID mismatch");
        return false;
    }
    info!(?device_id, ?home_id, "Connection validated");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPolicy {
        fingerprint: Option<String>,
        allow_unassigned: bool,
    }

    #[async_trait]
    impl AuthenticationPolicy for FixedPolicy {
        fn strict(&self) -> bool {
            true
        }

        fn default_authentication_method(&self) -> AuthenticationMethod {
            AuthenticationMethod::CertificateSubject
        }

        fn authentication_method_for_host(&self, hostname: &str) -> AuthenticationMethod {
            if hostname == "cloud.example.com" {
                AuthenticationMethod::CertificateFingerprint
            } else {
                AuthenticationMethod::CertificateSubject
            }
        }

        async fn expected_certificate_fingerprint(&self, _: &str, _: &str) -> Option<String> {
            self.fingerprint.clone()
        }

        fn allow_unassigned_home_id(&self) -> bool {
            self.allow_unassigned
        }
    }

    fn authenticator(fingerprint: Option<String>, allow_unassigned: bool) -> Authenticator {
        Authenticator::new(Arc::new(FixedPolicy {
            fingerprint,
            allow_unassigned,
        }))
    }

    #[tokio::test]
    async fn test_validate_certificate_fingerprint() {
        let cert = b"certificate bytes";
        let auth = authenticator(Some(certificate_fingerprint(cert)), false);
        assert!(auth.validate_certificate("dev", "home", cert).await);
        assert!(!auth.validate_certificate("dev", "home", b"other").await);

        let unknown = authenticator(None, false);
        assert!(!unknown.validate_certificate("dev", "home", cert).await);
    }

    #[tokio::test]
    async fn test_unassigned_home_allowed_by_policy() {
        let auth = authenticator(None, true);
        assert!(
            auth.validate_certificate("dev", UNASSIGNED_HOME_ID, b"anything")
                .await
        );
        assert!(!auth.validate_certificate("dev", "home", b"anything").await);
    }

    #[test]
    fn test_method_selection() {
        let auth = authenticator(None, false);
        assert_eq!(
            auth.authentication_method_for_peer(Some("tcp://host:1"), None)
                .unwrap(),
            AuthenticationMethod::None
        );
        assert_eq!(
            auth.authentication_method_for_peer(Some("tcp+tls://cloud.example.com:443"), None)
                .unwrap(),
            AuthenticationMethod::CertificateFingerprint
        );
        assert_eq!(
            auth.authentication_method_for_peer(None, None).unwrap(),
            AuthenticationMethod::CertificateSubject
        );

        let params = HashMap::from([("authentication_token".to_string(), "jwt".to_string())]);
        assert_eq!(
            auth.authentication_method_for_peer(None, Some(&params))
                .unwrap(),
            AuthenticationMethod::Jwt
        );
    }

    #[test]
    fn test_common_name() {
        assert_eq!(
            verify_common_name("device-1:home-9").unwrap(),
            ("device-1".to_string(), "home-9".to_string())
        );
        assert!(verify_common_name("device-1").is_err());
        assert!(verify_common_name(":home").is_err());
    }

    #[test]
    fn test_header_identity() {
        let headers = HashMap::from([
            (
                "x-meshbus-client-cert-subj".to_string(),
                "/O=Fleet/CN=dev-1:home-2".to_string(),
            ),
            ("x-meshbus-device-id".to_string(), "dev-1".to_string()),
            ("x-meshbus-home-id".to_string(), "home-2".to_string()),
        ]);
        let common_name = common_name_from_headers(&headers).unwrap();
        assert_eq!(common_name, "dev-1:home-2");
        assert!(verify_common_name_against_header_ids(&common_name, &headers));
        assert!(!verify_common_name_against_header_ids("dev-1:home-3", &headers));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let fingerprint = certificate_fingerprint(b"");
        assert_eq!(
            fingerprint,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
