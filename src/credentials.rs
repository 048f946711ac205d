//! Capabilities injected into the connector: PSK lookup, certificate identity and
//! verification, resumption policy and lifecycle notifications.
//!
//! All of them are trait objects shared behind `Arc` and called from any worker,
//! hence the `Send + Sync` bound.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use zeroize::Zeroizing;

use crate::message::AlertDescription;
use crate::registry::{NamedGroup, SignatureAndHashAlgorithm};
use crate::session::Session;

/// Certificate types of RFC 7250.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    X509,
    RawPublicKey,
}

/// Pre-shared key, zeroized on drop.
#[derive(Clone)]
pub struct PskSecret(Zeroizing<Vec<u8>>);

impl PskSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        PskSecret(Zeroizing::new(secret.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PskSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PskSecret(..)")
    }
}

/// Identity and key a client uses toward a server.
#[derive(Debug, Clone)]
pub struct PskCredentials {
    pub identity: Vec<u8>,
    pub secret: PskSecret,
}

/// Lookup of pre-shared keys.
pub trait PskStore: Send + Sync {
    /// Whether the keys may be combined with an ECDHE exchange (RFC 5489).
    fn has_ecdhe_psk_supported(&self) -> bool {
        true
    }

    /// Client side: identity and key to present to `peer`, given the server's hint.
    fn identity(&self, peer: SocketAddr, hint: Option<&[u8]>) -> Option<PskCredentials>;

    /// Server side: key for the identity presented by a client.
    fn secret(&self, identity: &[u8]) -> Option<PskSecret>;
}

/// Provides our certificate chain and signs with the matching private key.
pub trait CertificateProvider: Send + Sync {
    fn supported_certificate_types(&self) -> Vec<CertificateType> {
        vec![CertificateType::X509]
    }

    /// Chain to send for the negotiated type, leaf first.
    fn certificate_chain(&self, certificate_type: CertificateType) -> Option<Vec<Vec<u8>>>;

    /// Signature algorithms the private key supports.
    fn signature_algorithms(&self) -> Vec<SignatureAndHashAlgorithm>;

    /// Groups of the key's curve.
    fn groups(&self) -> Vec<NamedGroup> {
        Vec::new()
    }

    /// Sign `data` with the private key.
    fn sign(&self, algorithm: SignatureAndHashAlgorithm, data: &[u8]) -> Result<Vec<u8>, String>;
}

/// Validates certificate chains presented by servers.
pub trait CertificateVerifier: Send + Sync {
    fn supported_certificate_types(&self) -> Vec<CertificateType> {
        vec![CertificateType::X509]
    }

    /// Validate the chain presented by `peer`. The error becomes the alert sent.
    fn verify_chain(&self, peer: SocketAddr, chain: &[Vec<u8>]) -> Result<(), AlertDescription>;

    /// Verify `signature` over `data` by the leaf of a validated chain.
    fn verify_signature(
        &self,
        chain: &[Vec<u8>],
        algorithm: SignatureAndHashAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> bool;
}

/// Decides whether a known session may be resumed.
pub trait ResumptionVerifier: Send + Sync {
    fn allow_resumption(&self, peer: SocketAddr, session: &Session) -> bool;
}

/// Lifecycle notifications. Push only.
pub trait ConnectionListener: Send + Sync {
    fn on_established(&self, _peer: SocketAddr, _session: &Session, _resumed: bool) {}

    fn on_handshake_failed(&self, _peer: SocketAddr, _alert: Option<AlertDescription>) {}

    fn on_removed(&self, _peer: SocketAddr) {}
}

/// A fixed table of pre-shared keys.
#[derive(Debug, Default, Clone)]
pub struct StaticPskStore {
    keys: HashMap<Vec<u8>, PskSecret>,
    client_identity: Option<Vec<u8>>,
    ecdhe: bool,
}

impl StaticPskStore {
    pub fn new() -> Self {
        StaticPskStore {
            ecdhe: true,
            ..Default::default()
        }
    }

    /// Add a key. The first identity added is the one used as client.
    pub fn with_key(mut self, identity: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) -> Self {
        let identity = identity.into();
        if self.client_identity.is_none() {
            self.client_identity = Some(identity.clone());
        }
        self.keys.insert(identity, PskSecret::new(secret));
        self
    }

    pub fn with_ecdhe(mut self, ecdhe: bool) -> Self {
        self.ecdhe = ecdhe;
        self
    }
}

impl PskStore for StaticPskStore {
    fn has_ecdhe_psk_supported(&self) -> bool {
        self.ecdhe
    }

    fn identity(&self, _peer: SocketAddr, hint: Option<&[u8]>) -> Option<PskCredentials> {
        let identity = match hint {
            Some(h) if self.keys.contains_key(h) => h.to_vec(),
            _ => self.client_identity.clone()?,
        };
        let secret = self.keys.get(&identity)?.clone();
        Some(PskCredentials { identity, secret })
    }

    fn secret(&self, identity: &[u8]) -> Option<PskSecret> {
        self.keys.get(identity).cloned()
    }
}
