//! Wire codecs for DTLS 1.2 records and handshake messages.
//!
//! Parsers are nom based and borrow from the input. Serializers append to a [`Buf`].
//!
//! [`Buf`]: crate::buffer::Buf

mod alert;
mod certificate;
mod certificate_request;
mod client_hello;
mod extension;
mod finished;
mod handshake;
mod hello_verify;
mod id;
mod key_exchange;
mod random;
mod record;
mod server_hello;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use certificate::Certificate;
pub use certificate_request::{CertificateRequest, CertificateVerify};
pub use client_hello::ClientHello;
pub use extension::{CidCodePoint, Extension, ExtensionsExt};
pub use finished::Finished;
pub use handshake::{serialize_message, Fragment, Header, MessageType};
pub use hello_verify::HelloVerifyRequest;
pub use id::{ConnectionId, Cookie, InvalidLength, SessionId};
pub use key_exchange::{
    signed_params, ClientKeyExchange, DigitallySigned, EcParameters, ServerKeyExchange,
};
pub use random::Random;
pub use record::{serialize_header, Record};
pub use server_hello::ServerHello;
