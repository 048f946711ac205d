//! dimpl-connector, a sans-IO DTLS 1.2 connector engine.
//!
//! The [`Connector`] establishes, maintains and tears down DTLS 1.2 sessions
//! with many peers over one datagram socket, as client, server or both:
//!
//! * Full and abbreviated handshakes for PSK, ECDHE_PSK and ECDHE_ECDSA with
//!   AES-GCM, flight retransmission with back-off and fragmentation.
//! * HelloVerifyRequest cookies against spoofed ClientHellos.
//! * Session resumption, extended master secret (RFC 7627), record size
//!   limit (RFC 8449) and connection ids (RFC 9146).
//! * Replay protection and address updates through connection ids.
//!
//! The connector does no I/O. Feed it datagrams and timeouts, act on the
//! [`Output`]s it returns. The [`Driver`] does exactly that on a tokio
//! UDP socket.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Instant;
//! use dimpl_connector::{ConfigParams, Connector, Output, StaticPskStore};
//!
//! let config = ConfigParams {
//!     psk_store: Some(Arc::new(StaticPskStore::new().with_key("client", "secret"))),
//!     ..Default::default()
//! }
//! .build()
//! .unwrap();
//!
//! let connector = Connector::new(Arc::new(config));
//! let peer = "192.0.2.1:5684".parse().unwrap();
//!
//! for output in connector.connect(Instant::now(), peer).unwrap() {
//!     match output {
//!         Output::Transmit { peer, datagram } => { /* socket.send_to(&datagram, peer) */ }
//!         _ => {}
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod buffer;
mod config;
mod connection;
mod connector;
mod credentials;
mod crypto;
mod deferred;
mod driver;
mod error;
mod event;
mod flight;
mod handshake;
mod health;
mod message;
mod policy;
mod record_layer;
mod registry;
mod rng;
mod session;
mod store;
mod timer;
mod types;
mod util;
mod window;

pub use config::{
    ClientAuthentication, Config, ConfigParams, DtlsRole, ExtendedMasterSecretMode, HelloVerifyMode,
};
pub use connector::Connector;
pub use credentials::{CertificateProvider, CertificateType, CertificateVerifier};
pub use credentials::{ConnectionListener, PskCredentials, PskSecret, PskStore};
pub use credentials::{ResumptionVerifier, StaticPskStore};
pub use driver::Driver;
pub use error::{ConfigError, Error, Violation};
pub use event::{CloseReason, Output};
pub use handshake::HandshakeState;
pub use health::{HealthHandler, HealthStats};
pub use message::{AlertDescription, ConnectionId, SessionId};
pub use policy::{derive_cipher_suites, PolicyInput};
pub use registry::{BulkCipher, CipherSuite, CipherSuiteDescriptor, KeyExchange};
pub use registry::{NamedGroup, SignatureAndHashAlgorithm};
pub use session::{PeerIdentity, Session};
pub use types::{HashAlgorithm, ProtocolVersion, SignatureAlgorithm};
