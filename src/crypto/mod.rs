//! Cryptographic primitives used by the record layer and the handshake.

mod cipher;
mod cookie;
mod ecdhe;
mod hash;
mod prf;

pub(crate) use cipher::{Aad, RecordCipher, AEAD_OVERHEAD};
pub(crate) use cookie::CookieGenerator;
pub(crate) use ecdhe::EphemeralKey;
pub(crate) use hash::Hash;
pub(crate) use prf::{key_block, master_secret, verify_data};
