use sha2::{Digest, Sha256, Sha384};

use crate::types::HashAlgorithm;

/// Running hash over the handshake transcript.
#[derive(Clone)]
pub(crate) enum Hash {
    Sha256(Sha256),
    Sha384(Sha384),
}

impl Hash {
    /// `None` for hashes no supported cipher suite uses as PRF hash.
    pub fn new(algorithm: HashAlgorithm) -> Option<Self> {
        match algorithm {
            HashAlgorithm::SHA256 => Some(Hash::Sha256(Sha256::new())),
            HashAlgorithm::SHA384 => Some(Hash::Sha384(Sha384::new())),
            _ => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hash::Sha256(hasher) => hasher.update(data),
            Hash::Sha384(hasher) => hasher.update(data),
        }
    }

    /// Finalize a copy of the state. The transcript can keep growing afterwards.
    pub fn clone_and_finalize(&self) -> Vec<u8> {
        match self {
            Hash::Sha256(hasher) => hasher.clone().finalize().to_vec(),
            Hash::Sha384(hasher) => hasher.clone().finalize().to_vec(),
        }
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hash::Sha256(_) => f.write_str("Hash::Sha256"),
            Hash::Sha384(_) => f.write_str("Hash::Sha384"),
        }
    }
}
