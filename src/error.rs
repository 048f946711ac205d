use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ClientAuthentication;
use crate::message::AlertDescription;
use crate::registry::{CipherSuite, NamedGroup, SignatureAndHashAlgorithm};

/// Errors surfaced to the caller of the connector.
///
/// Malformed or unauthenticated input is never reported here; such records are
/// dropped and counted in the health statistics.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("no connection for peer")]
    UnknownPeer,

    #[error("connection store is full and holds no stale connection")]
    ConnectionRejected,

    #[error("no established connection to peer")]
    NotConnected,

    #[error("handshake aborted: {0}")]
    HandshakeAborted(AlertDescription),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("operation not permitted for the configured role")]
    RoleNotPermitted,

    #[error("connection closed")]
    Closed,

    #[error("application record of {0} bytes exceeds the record limit")]
    MessageTooLarge(usize),
}

/// A rejected configuration, listing every violated constraint at once.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct ConfigError {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: ")?;
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

impl ConfigError {
    pub fn contains(&self, violation: &Violation) -> bool {
        self.violations.contains(violation)
    }
}

/// One violated configuration constraint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("retransmission timeout must be positive")]
    NonPositiveRetransmissionTimeout,

    #[error("max retransmission timeout must be positive")]
    NonPositiveMaxRetransmissionTimeout,

    #[error("retransmission timeout {initial:?} exceeds max retransmission timeout {max:?}")]
    InitialTimeoutAboveMax { initial: Duration, max: Duration },

    #[error("{name} {value} must be within [1.0, 2.0]")]
    FactorOutOfRange { name: &'static str, value: f64 },

    #[error("max retransmissions must be at least 1")]
    NoRetransmissions,

    #[error("back off retransmission {back_off} must be less than max retransmissions {max}")]
    BackOffNotBelowMax { back_off: usize, max: usize },

    #[error("mtu {0} is below 64 bytes")]
    MtuTooSmall(usize),

    #[error("record size limit {0} not within 64..=16384")]
    RecordSizeLimitOutOfRange(u16),

    #[error("max connections must be at least 1")]
    NoConnections,

    #[error("connection id length {0} exceeds 32 bytes")]
    ConnectionIdTooLong(usize),

    #[error("connection id node id requires a connection id length")]
    NodeIdWithoutConnectionId,

    #[error("connection id length {0} too short for node id, at least 5 bytes are required")]
    ConnectionIdTooShortForNodeId(usize),

    #[error("verify peers on resumption threshold {0}% exceeds 100%")]
    ResumptionThresholdOutOfRange(u8),

    #[error("{0} count must be at least 1")]
    NoTasks(&'static str),

    #[error("protocol version {0:#06x} can't be used for HelloVerifyRequests")]
    UnsupportedHelloVerifyVersion(u16),

    #[error("max fragmented handshake message length {0} not within 256..=65536")]
    HandshakeMessageLengthOutOfRange(usize),

    #[error("supported cipher suites must be set either explicitly or implicitly by means of setting the identity or PSK store")]
    NoCipherSuites,

    #[error("cipher suites contain TLS_NULL_WITH_NULL_NULL")]
    NullCipherSuite,

    #[error("cipher suites {0:?} are not supported")]
    UnsupportedCipherSuites(Vec<CipherSuite>),

    #[error("cipher suites {0:?} are not recommended")]
    NotRecommendedCipherSuites(Vec<CipherSuite>),

    #[error("groups {0:?} are not supported")]
    UnsupportedGroups(Vec<NamedGroup>),

    #[error("groups {0:?} are not recommended")]
    NotRecommendedGroups(Vec<NamedGroup>),

    #[error("signature algorithms {0:?} are not supported")]
    UnsupportedSignatureAlgorithms(Vec<SignatureAndHashAlgorithm>),

    #[error("signature algorithms {0:?} are not recommended")]
    NotRecommendedSignatureAlgorithms(Vec<SignatureAndHashAlgorithm>),

    #[error("hello verify request disabled for PSK, but no PSK cipher suite")]
    HelloVerifyWithoutPskSuite,

    #[error("ECC based cipher suites require signature algorithms")]
    NoSignatureAlgorithms,

    #[error("ECC based cipher suites require groups")]
    NoGroups,

    #[error("groups configured without ECC based cipher suite")]
    GroupsWithoutEccSuite,

    #[error("signature algorithms configured without ECC based cipher suite")]
    SignatureAlgorithmsWithoutEccSuite,

    #[error("certificate identity set, but no certificate based cipher suite")]
    IdentityWithoutCertificateSuite,

    #[error("certificate verifier set, but no certificate based cipher suite")]
    VerifierWithoutCertificateSuite,

    #[error("client authentication {0:?} requires a certificate verifier")]
    ClientAuthenticationWithoutVerifier(ClientAuthentication),

    #[error("PSK store set, but no PSK cipher suite")]
    PskStoreWithoutPskSuite,

    #[error("PSK cipher suite {0} requires a PSK store")]
    PskSuiteWithoutPskStore(CipherSuite),

    #[error("ECDHE PSK cipher suite {0} requires a PSK store supporting ECDHE")]
    EcdhePskNotSupportedByStore(CipherSuite),

    #[error("certificate cipher suite {0} requires a certificate identity")]
    CertificateSuiteWithoutIdentity(CipherSuite),

    #[error("certificate cipher suite {0} requires a certificate verifier")]
    CertificateSuiteWithoutVerifier(CipherSuite),
}
