//! AES-GCM record protection (RFC 5288) and the additional data variants
//! for plain and `tls12_cid` records.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, Nonce};
use tinyvec::TinyVec;

use crate::buffer::Buf;
use crate::types::{ContentType, ProtocolVersion, Sequence};

/// Explicit nonce transmitted in front of each ciphertext.
pub(crate) const EXPLICIT_NONCE_LEN: usize = 8;

const GCM_TAG_LEN: usize = 16;

/// Per record expansion: explicit nonce + tag.
pub(crate) const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + GCM_TAG_LEN;

/// Additional authenticated data of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Aad(TinyVec<[u8; 32]>);

impl Aad {
    /// seq_num ‖ type ‖ version ‖ length
    pub fn plain(content_type: ContentType, sequence: Sequence, length: usize) -> Self {
        let mut aad = TinyVec::new();
        aad.extend_from_slice(&sequence.to_bytes());
        aad.push(content_type.as_u8());
        aad.extend_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
        aad.extend_from_slice(&(length as u16).to_be_bytes());
        Aad(aad)
    }

    /// RFC 9146 §5:
    /// seq_num_placeholder ‖ tls12_cid ‖ cid_length ‖ tls12_cid ‖ version ‖
    /// seq_num ‖ cid ‖ length_of_DTLSInnerPlaintext
    pub fn cid(sequence: Sequence, cid: &[u8], length: usize) -> Self {
        let tls12_cid = ContentType::Tls12Cid.as_u8();
        let mut aad = TinyVec::new();
        aad.extend_from_slice(&[0xff; 8]);
        aad.push(tls12_cid);
        aad.push(cid.len() as u8);
        aad.push(tls12_cid);
        aad.extend_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
        aad.extend_from_slice(&sequence.to_bytes());
        aad.extend_from_slice(cid);
        aad.extend_from_slice(&(length as u16).to_be_bytes());
        Aad(aad)
    }

    /// Pre-standard construction used with the deprecated extension code point:
    /// seq_num ‖ tls12_cid ‖ version ‖ cid ‖ cid_length ‖ length_of_DTLSInnerPlaintext
    pub fn cid_deprecated(sequence: Sequence, cid: &[u8], length: usize) -> Self {
        let mut aad = TinyVec::new();
        aad.extend_from_slice(&sequence.to_bytes());
        aad.push(ContentType::Tls12Cid.as_u8());
        aad.extend_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
        aad.extend_from_slice(cid);
        aad.push(cid.len() as u8);
        aad.extend_from_slice(&(length as u16).to_be_bytes());
        Aad(aad)
    }
}

enum AesGcm {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// Write or read state of one direction of an epoch.
pub(crate) struct RecordCipher {
    aead: AesGcm,
    fixed_iv: [u8; 4],
}

impl RecordCipher {
    pub fn new(key: &[u8], fixed_iv: [u8; 4]) -> Result<Self, String> {
        let aead = match key.len() {
            16 => AesGcm::Aes128(Box::new(Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)))),
            32 => AesGcm::Aes256(Box::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))),
            _ => return Err(format!("Invalid key size for AES-GCM: {}", key.len())),
        };
        Ok(RecordCipher { aead, fixed_iv })
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed_iv);
        nonce[4..].copy_from_slice(explicit);
        nonce
    }

    /// Encrypt `plaintext` into `explicit_nonce ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, aad: &Aad, explicit_nonce: [u8; 8], plaintext: &[u8]) -> Result<Buf, String> {
        let nonce = self.nonce(&explicit_nonce);
        let nonce = Nonce::from_slice(&nonce);

        let mut data = Buf::with_capacity(plaintext.len() + GCM_TAG_LEN);
        data.extend_from_slice(plaintext);

        match &self.aead {
            AesGcm::Aes128(c) => c.encrypt_in_place(nonce, &aad.0, &mut data),
            AesGcm::Aes256(c) => c.encrypt_in_place(nonce, &aad.0, &mut data),
        }
        .map_err(|_| "AES-GCM encryption failed".to_string())?;

        let mut out = Buf::with_capacity(EXPLICIT_NONCE_LEN + data.len());
        out.extend_from_slice(&explicit_nonce);
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Decrypt a record fragment. `aad` is built from the plaintext length,
    /// which is the fragment length minus [`AEAD_OVERHEAD`].
    pub fn decrypt(&self, aad: impl FnOnce(usize) -> Aad, fragment: &[u8]) -> Result<Buf, String> {
        let Some(plaintext_len) = fragment.len().checked_sub(AEAD_OVERHEAD) else {
            return Err(format!("Ciphertext too short: {}", fragment.len()));
        };
        let aad = aad(plaintext_len);
        let nonce = self.nonce(&fragment[..EXPLICIT_NONCE_LEN]);
        let nonce = Nonce::from_slice(&nonce);

        let mut data = Buf::from_slice(&fragment[EXPLICIT_NONCE_LEN..]);
        match &self.aead {
            AesGcm::Aes128(c) => c.decrypt_in_place(nonce, &aad.0, &mut data),
            AesGcm::Aes256(c) => c.decrypt_in_place(nonce, &aad.0, &mut data),
        }
        .map_err(|_| "AES-GCM decryption failed".to_string())?;

        Ok(data)
    }
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.aead {
            AesGcm::Aes128(_) => f.write_str("RecordCipher::Aes128Gcm"),
            AesGcm::Aes256(_) => f.write_str("RecordCipher::Aes256Gcm"),
        }
    }
}
