//! Capability registry.
//!
//! Static catalogs of cipher suites, named groups and signature algorithms,
//! each entry flagged as IANA-recommended and as usable at runtime.

mod cipher_suite;
mod group;
mod signature;

pub use cipher_suite::{BulkCipher, CipherSuite, CipherSuiteDescriptor, KeyExchange};
pub use group::NamedGroup;
pub use signature::SignatureAndHashAlgorithm;
