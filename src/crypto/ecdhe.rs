//! Ephemeral ECDH over x25519, secp256r1 and secp384r1.

use p256::ecdh::EphemeralSecret as P256EphemeralSecret;
use p256::PublicKey as P256PublicKey;
use p384::ecdh::EphemeralSecret as P384EphemeralSecret;
use p384::PublicKey as P384PublicKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::registry::NamedGroup;

/// Our half of an ECDHE exchange.
pub(crate) enum EphemeralKey {
    X25519 {
        secret: x25519_dalek::EphemeralSecret,
        public_key: Vec<u8>,
    },
    P256 {
        secret: P256EphemeralSecret,
        public_key: Vec<u8>,
    },
    P384 {
        secret: P384EphemeralSecret,
        public_key: Vec<u8>,
    },
}

impl EphemeralKey {
    pub fn generate(group: NamedGroup) -> Result<Self, String> {
        match group {
            NamedGroup::X25519 => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let public_key = x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec();
                Ok(EphemeralKey::X25519 { secret, public_key })
            }
            NamedGroup::Secp256r1 => {
                let secret = P256EphemeralSecret::random(&mut OsRng);
                let public_key = P256PublicKey::from(&secret).to_sec1_bytes().to_vec();
                Ok(EphemeralKey::P256 { secret, public_key })
            }
            NamedGroup::Secp384r1 => {
                let secret = P384EphemeralSecret::random(&mut OsRng);
                let public_key = P384PublicKey::from(&secret).to_sec1_bytes().to_vec();
                Ok(EphemeralKey::P384 { secret, public_key })
            }
            _ => Err(format!("Unsupported group: {:?}", group)),
        }
    }

    pub fn group(&self) -> NamedGroup {
        match self {
            EphemeralKey::X25519 { .. } => NamedGroup::X25519,
            EphemeralKey::P256 { .. } => NamedGroup::Secp256r1,
            EphemeralKey::P384 { .. } => NamedGroup::Secp384r1,
        }
    }

    /// Encoded public point to send to the peer.
    pub fn public_key(&self) -> &[u8] {
        match self {
            EphemeralKey::X25519 { public_key, .. }
            | EphemeralKey::P256 { public_key, .. }
            | EphemeralKey::P384 { public_key, .. } => public_key,
        }
    }

    /// Shared secret with the peer's encoded public point.
    pub fn complete(self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, String> {
        match self {
            EphemeralKey::X25519 { secret, .. } => {
                let peer: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| "Invalid X25519 public key".to_string())?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err("Non-contributory X25519 exchange".to_string());
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            EphemeralKey::P256 { secret, .. } => {
                let peer = P256PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| "Invalid P-256 public key".to_string())?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            EphemeralKey::P384 { secret, .. } => {
                let peer = P384PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| "Invalid P-384 public key".to_string())?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("group", &self.group())
            .field("public_key_len", &self.public_key().len())
            .finish_non_exhaustive()
    }
}
