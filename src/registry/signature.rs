use std::fmt;

use nom::IResult;

use crate::buffer::Buf;
use crate::types::{HashAlgorithm, SignatureAlgorithm};

/// A `SignatureAndHashAlgorithm` pair as carried in the `signature_algorithms`
/// extension and in `DigitallySigned` structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureAndHashAlgorithm {
    pub hash: HashAlgorithm,
    pub signature: SignatureAlgorithm,
}

impl SignatureAndHashAlgorithm {
    pub const SHA1_WITH_ECDSA: Self = Self::new(HashAlgorithm::SHA1, SignatureAlgorithm::ECDSA);
    pub const SHA256_WITH_ECDSA: Self =
        Self::new(HashAlgorithm::SHA256, SignatureAlgorithm::ECDSA);
    pub const SHA384_WITH_ECDSA: Self =
        Self::new(HashAlgorithm::SHA384, SignatureAlgorithm::ECDSA);
    pub const SHA512_WITH_ECDSA: Self =
        Self::new(HashAlgorithm::SHA512, SignatureAlgorithm::ECDSA);
    pub const SHA1_WITH_RSA: Self = Self::new(HashAlgorithm::SHA1, SignatureAlgorithm::RSA);
    pub const SHA256_WITH_RSA: Self = Self::new(HashAlgorithm::SHA256, SignatureAlgorithm::RSA);
    pub const SHA384_WITH_RSA: Self = Self::new(HashAlgorithm::SHA384, SignatureAlgorithm::RSA);
    pub const SHA512_WITH_RSA: Self = Self::new(HashAlgorithm::SHA512, SignatureAlgorithm::RSA);
    pub const ED25519: Self = Self::new(HashAlgorithm::Intrinsic, SignatureAlgorithm::ED25519);

    /// Used when the configuration names no signature algorithms but ECC is in use.
    pub const DEFAULT: &'static [SignatureAndHashAlgorithm] =
        &[Self::SHA256_WITH_ECDSA, Self::SHA256_WITH_RSA];

    pub const fn new(hash: HashAlgorithm, signature: SignatureAlgorithm) -> Self {
        Self { hash, signature }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, hash) = HashAlgorithm::parse(input)?;
        let (input, signature) = SignatureAlgorithm::parse(input)?;
        Ok((input, Self { hash, signature }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.hash.as_u8());
        output.push(self.signature.as_u8());
    }

    /// Pairs a signer/verifier can be expected to handle.
    pub fn is_supported(&self) -> bool {
        use HashAlgorithm::*;
        use SignatureAlgorithm::*;
        matches!(
            (self.hash, self.signature),
            (SHA1 | SHA256 | SHA384 | SHA512, ECDSA | RSA) | (Intrinsic, ED25519)
        )
    }

    /// SHA1 based pairs are not recommended.
    pub fn is_recommended(&self) -> bool {
        use HashAlgorithm::*;
        use SignatureAlgorithm::*;
        matches!(
            (self.hash, self.signature),
            (SHA256 | SHA384 | SHA512, ECDSA | RSA) | (Intrinsic, ED25519)
        )
    }
}

impl fmt::Display for SignatureAndHashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}with{:?}", self.hash, self.signature)
    }
}
