use std::fmt;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::message::SessionId;
use crate::registry::{CipherSuite, NamedGroup, SignatureAndHashAlgorithm};

/// The 48 byte master secret, zeroized on drop.
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<[u8; 48]>);

impl MasterSecret {
    pub(crate) fn new(bytes: [u8; 48]) -> Self {
        MasterSecret(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 48] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// How the peer authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// PSK identity presented by the client (or used by us as client).
    Psk(Vec<u8>),
    /// Certificate chain presented by the peer.
    Certificate(Vec<Vec<u8>>),
    /// The peer did not authenticate (an ECDHE_ECDSA client without a certificate).
    Anonymous,
}

/// Negotiated cryptographic context of a connection.
///
/// Immutable once the handshake finishes. A new handshake produces a new
/// `Session` that replaces the previous one.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    cipher_suite: CipherSuite,
    signature_algorithm: Option<SignatureAndHashAlgorithm>,
    group: Option<NamedGroup>,
    peer_identity: PeerIdentity,
    master_secret: MasterSecret,
    extended_master_secret: bool,
    peer_record_size_limit: Option<u16>,
    established: Instant,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        cipher_suite: CipherSuite,
        signature_algorithm: Option<SignatureAndHashAlgorithm>,
        group: Option<NamedGroup>,
        peer_identity: PeerIdentity,
        master_secret: MasterSecret,
        extended_master_secret: bool,
        peer_record_size_limit: Option<u16>,
        established: Instant,
    ) -> Self {
        Session {
            id,
            cipher_suite,
            signature_algorithm,
            group,
            peer_identity,
            master_secret,
            extended_master_secret,
            peer_record_size_limit,
            established,
        }
    }

    /// Session identifier. Empty means the session is not resumable.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_resumable(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn signature_algorithm(&self) -> Option<SignatureAndHashAlgorithm> {
        self.signature_algorithm
    }

    pub fn group(&self) -> Option<NamedGroup> {
        self.group
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.peer_identity
    }

    pub(crate) fn master_secret(&self) -> &MasterSecret {
        &self.master_secret
    }

    /// Master secret derived with RFC 7627.
    pub fn extended_master_secret(&self) -> bool {
        self.extended_master_secret
    }

    /// Record size limit announced by the peer.
    pub fn peer_record_size_limit(&self) -> Option<u16> {
        self.peer_record_size_limit
    }

    /// When the full handshake creating this session finished.
    pub fn established(&self) -> Instant {
        self.established
    }

    /// Same cryptographic context with the limit announced in a resumption handshake.
    pub(crate) fn resumed(&self, peer_record_size_limit: Option<u16>) -> Session {
        Session {
            peer_record_size_limit,
            ..self.clone()
        }
    }
}
