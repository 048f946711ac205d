use std::fmt;

use crate::types::HashAlgorithm;

/// Key exchange algorithm of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyExchange {
    /// `TLS_NULL_WITH_NULL_NULL`, never negotiable.
    Null,
    /// Plain pre-shared key.
    Psk,
    /// Ephemeral ECDH authenticated by a pre-shared key.
    EcdhePsk,
    /// Ephemeral ECDH authenticated by an ECDSA certificate.
    EcdheEcdsa,
}

/// Bulk cipher of a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkCipher {
    Null,
    Aes128Gcm,
    Aes256Gcm,
    Aes128Ccm,
    Aes256Ccm,
    Aes128Ccm8,
    Aes256Ccm8,
    Aes128Cbc,
    Aes256Cbc,
}

impl BulkCipher {
    /// Encryption key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            BulkCipher::Null => 0,
            BulkCipher::Aes128Gcm
            | BulkCipher::Aes128Ccm
            | BulkCipher::Aes128Ccm8
            | BulkCipher::Aes128Cbc => 16,
            _ => 32,
        }
    }

    pub fn is_aead(&self) -> bool {
        !matches!(
            self,
            BulkCipher::Null | BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc
        )
    }

    /// Implicit (fixed) IV length taken from the key block.
    pub fn fixed_iv_len(&self) -> usize {
        if self.is_aead() {
            4
        } else {
            0
        }
    }

    /// Per record overhead: explicit nonce/IV plus tag/MAC and padding upper bound.
    pub fn record_overhead(&self, mac_len: usize) -> usize {
        match self {
            BulkCipher::Null => 0,
            BulkCipher::Aes128Ccm8 | BulkCipher::Aes256Ccm8 => 8 + 8,
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => 16 + mac_len + 16,
            _ => 8 + 16,
        }
    }
}

/// Immutable description of a cipher suite in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuiteDescriptor {
    pub name: &'static str,
    pub code: u16,
    pub key_exchange: KeyExchange,
    pub cipher: BulkCipher,
    /// Hash used by the PRF and for the transcript.
    pub prf_hash: HashAlgorithm,
    /// MAC length for non-AEAD ciphers.
    pub mac_len: usize,
    /// Listed as recommended by the IANA registry.
    pub recommended: bool,
    /// Usable with the record protection available at runtime.
    pub supported: bool,
}

macro_rules! cipher_suites {
    ($(
        $(#[$meta:meta])*
        $variant:ident = $code:expr, $kx:ident, $cipher:ident, $hash:ident, $mac:expr, $rec:expr, $sup:expr;
    )*) => {
        /// Cipher suites known to the connector.
        ///
        /// The declaration order is the catalog order used when suites are derived
        /// from the configured credentials.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(non_camel_case_types)]
        pub enum CipherSuite {
            $(
                $(#[$meta])*
                $variant,
            )*
        }

        impl CipherSuite {
            /// The full catalog.
            pub const ALL: &'static [CipherSuite] = &[$(CipherSuite::$variant,)*];

            pub fn descriptor(&self) -> &'static CipherSuiteDescriptor {
                match self {
                    $(
                        CipherSuite::$variant => &CipherSuiteDescriptor {
                            name: stringify!($variant),
                            code: $code,
                            key_exchange: KeyExchange::$kx,
                            cipher: BulkCipher::$cipher,
                            prf_hash: HashAlgorithm::$hash,
                            mac_len: $mac,
                            recommended: $rec,
                            supported: $sup,
                        },
                    )*
                }
            }
        }
    };
}

cipher_suites! {
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 = 0xC02B, EcdheEcdsa, Aes128Gcm, SHA256, 0, true, true;
    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 = 0xC02C, EcdheEcdsa, Aes256Gcm, SHA384, 0, true, true;
    TLS_ECDHE_ECDSA_WITH_AES_128_CCM = 0xC0AC, EcdheEcdsa, Aes128Ccm, SHA256, 0, true, false;
    TLS_ECDHE_ECDSA_WITH_AES_256_CCM = 0xC0AD, EcdheEcdsa, Aes256Ccm, SHA256, 0, true, false;
    TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8 = 0xC0AE, EcdheEcdsa, Aes128Ccm8, SHA256, 0, false, false;
    TLS_ECDHE_ECDSA_WITH_AES_256_CCM_8 = 0xC0AF, EcdheEcdsa, Aes256Ccm8, SHA256, 0, false, false;
    TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256 = 0xC023, EcdheEcdsa, Aes128Cbc, SHA256, 32, false, false;
    TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384 = 0xC024, EcdheEcdsa, Aes256Cbc, SHA384, 48, false, false;
    TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256 = 0xD001, EcdhePsk, Aes128Gcm, SHA256, 0, true, true;
    TLS_ECDHE_PSK_WITH_AES_256_GCM_SHA384 = 0xD002, EcdhePsk, Aes256Gcm, SHA384, 0, true, true;
    TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256 = 0xC037, EcdhePsk, Aes128Cbc, SHA256, 32, false, false;
    TLS_PSK_WITH_AES_128_GCM_SHA256 = 0x00A8, Psk, Aes128Gcm, SHA256, 0, true, true;
    TLS_PSK_WITH_AES_256_GCM_SHA384 = 0x00A9, Psk, Aes256Gcm, SHA384, 0, true, true;
    TLS_PSK_WITH_AES_128_CCM = 0xC0A4, Psk, Aes128Ccm, SHA256, 0, true, false;
    TLS_PSK_WITH_AES_256_CCM = 0xC0A5, Psk, Aes256Ccm, SHA256, 0, true, false;
    TLS_PSK_WITH_AES_128_CCM_8 = 0xC0A8, Psk, Aes128Ccm8, SHA256, 0, false, false;
    TLS_PSK_WITH_AES_256_CCM_8 = 0xC0A9, Psk, Aes256Ccm8, SHA256, 0, false, false;
    TLS_PSK_WITH_AES_128_CBC_SHA256 = 0x00AE, Psk, Aes128Cbc, SHA256, 32, false, false;
    /// Initial state of every connection, never allowed in a configuration.
    TLS_NULL_WITH_NULL_NULL = 0x0000, Null, Null, SHA256, 0, false, false;
}

impl CipherSuite {
    pub fn from_u16(code: u16) -> Option<CipherSuite> {
        Self::ALL.iter().copied().find(|s| s.as_u16() == code)
    }

    pub fn as_u16(&self) -> u16 {
        self.descriptor().code
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn key_exchange(&self) -> KeyExchange {
        self.descriptor().key_exchange
    }

    pub fn is_recommended(&self) -> bool {
        self.descriptor().recommended
    }

    pub fn is_supported(&self) -> bool {
        self.descriptor().supported
    }

    /// Authenticated by a pre-shared key (plain or ECDHE).
    pub fn is_psk_based(&self) -> bool {
        matches!(
            self.key_exchange(),
            KeyExchange::Psk | KeyExchange::EcdhePsk
        )
    }

    /// Uses an ephemeral elliptic curve key exchange.
    pub fn is_ecc_based(&self) -> bool {
        matches!(
            self.key_exchange(),
            KeyExchange::EcdhePsk | KeyExchange::EcdheEcdsa
        )
    }

    /// The server sends a Certificate message for this suite.
    pub fn requires_server_certificate_message(&self) -> bool {
        self.key_exchange() == KeyExchange::EcdheEcdsa
    }

    /// Maximum bytes a record grows by when protected with this suite.
    pub fn record_overhead(&self) -> usize {
        let d = self.descriptor();
        d.cipher.record_overhead(d.mac_len)
    }

    pub fn by_name(name: &str) -> Option<CipherSuite> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Supported suites of the catalog using `key_exchange`, in catalog order.
    pub fn by_key_exchange(recommended_only: bool, key_exchange: KeyExchange) -> Vec<CipherSuite> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.key_exchange() == key_exchange && s.is_supported())
            .filter(|s| !recommended_only || s.is_recommended())
            .collect()
    }

    /// Supported certificate based suites.
    pub fn ecdsa_suites(recommended_only: bool) -> Vec<CipherSuite> {
        Self::by_key_exchange(recommended_only, KeyExchange::EcdheEcdsa)
    }

    pub fn contains_psk_based(suites: &[CipherSuite]) -> bool {
        suites.iter().any(|s| s.is_psk_based())
    }

    pub fn contains_ecc_based(suites: &[CipherSuite]) -> bool {
        suites.iter().any(|s| s.is_ecc_based())
    }

    pub fn contains_certificate_based(suites: &[CipherSuite]) -> bool {
        suites.iter().any(|s| s.requires_server_certificate_message())
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
