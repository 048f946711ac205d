//! Negotiation policy.
//!
//! Configuration time: derive the cipher suites from the configured credentials and
//! validate explicit lists. Handshake time: pick the suite, group and signature
//! algorithm for a ClientHello.

use crate::error::Violation;
use crate::registry::{CipherSuite, KeyExchange, NamedGroup, SignatureAndHashAlgorithm};
use crate::types::SignatureAlgorithm;

/// Credential presence driving the cipher suite derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInput<'a> {
    pub has_certificate_identity: bool,
    pub has_certificate_verifier: bool,
    pub has_psk_store: bool,
    pub psk_supports_ecdhe: bool,
    pub preselected: Option<&'a [CipherSuite]>,
    pub recommended_only: bool,
}

/// Ordered cipher suites acceptable for the configured credentials.
///
/// Certificate suites come first, then ECDHE_PSK (only if the store supports ECDHE),
/// then plain PSK. A preselection intersects the result, keeping preselection order.
pub fn derive_cipher_suites(input: &PolicyInput) -> Result<Vec<CipherSuite>, Violation> {
    let mut derived = Vec::new();

    if input.has_certificate_identity || input.has_certificate_verifier {
        derived.extend(CipherSuite::ecdsa_suites(input.recommended_only));
    }

    if input.has_psk_store {
        if input.psk_supports_ecdhe {
            derived.extend(CipherSuite::by_key_exchange(
                input.recommended_only,
                KeyExchange::EcdhePsk,
            ));
        }
        derived.extend(CipherSuite::by_key_exchange(
            input.recommended_only,
            KeyExchange::Psk,
        ));
    }

    if let Some(preselected) = input.preselected {
        derived = preselected
            .iter()
            .copied()
            .filter(|s| derived.contains(s))
            .collect();
    }

    if derived.is_empty() {
        return Err(Violation::NoCipherSuites);
    }

    Ok(derived)
}

/// Checks an explicitly configured cipher suite list.
pub fn validate_cipher_suites(
    suites: &[CipherSuite],
    recommended_only: bool,
    violations: &mut Vec<Violation>,
) {
    if suites.is_empty() {
        violations.push(Violation::NoCipherSuites);
        return;
    }

    if suites.contains(&CipherSuite::TLS_NULL_WITH_NULL_NULL) {
        violations.push(Violation::NullCipherSuite);
    }

    let unsupported = offending(suites, |s| {
        *s != CipherSuite::TLS_NULL_WITH_NULL_NULL && !s.is_supported()
    });
    if !unsupported.is_empty() {
        violations.push(Violation::UnsupportedCipherSuites(unsupported));
    }

    if recommended_only {
        let not_recommended = offending(suites, |s| {
            *s != CipherSuite::TLS_NULL_WITH_NULL_NULL && !s.is_recommended()
        });
        if !not_recommended.is_empty() {
            violations.push(Violation::NotRecommendedCipherSuites(not_recommended));
        }
    }
}

pub fn validate_groups(
    groups: &[NamedGroup],
    recommended_only: bool,
    violations: &mut Vec<Violation>,
) {
    let unsupported = offending(groups, |g| !g.is_supported());
    if !unsupported.is_empty() {
        violations.push(Violation::UnsupportedGroups(unsupported));
    }
    if recommended_only {
        let not_recommended = offending(groups, |g| !g.is_recommended());
        if !not_recommended.is_empty() {
            violations.push(Violation::NotRecommendedGroups(not_recommended));
        }
    }
}

pub fn validate_signature_algorithms(
    algorithms: &[SignatureAndHashAlgorithm],
    recommended_only: bool,
    violations: &mut Vec<Violation>,
) {
    let unsupported = offending(algorithms, |a| !a.is_supported());
    if !unsupported.is_empty() {
        violations.push(Violation::UnsupportedSignatureAlgorithms(unsupported));
    }
    if recommended_only {
        let not_recommended = offending(algorithms, |a| !a.is_recommended());
        if !not_recommended.is_empty() {
            violations.push(Violation::NotRecommendedSignatureAlgorithms(
                not_recommended,
            ));
        }
    }
}

fn offending<T: Copy>(items: &[T], pred: impl Fn(&T) -> bool) -> Vec<T> {
    items.iter().filter(|i| pred(i)).copied().collect()
}

// ============================================================================
// Handshake time selection
// ============================================================================

/// What the server can authenticate with.
#[derive(Debug, Clone, Copy)]
pub struct ServerCredentials {
    pub has_psk_store: bool,
    pub psk_supports_ecdhe: bool,
    pub has_certificate: bool,
}

impl ServerCredentials {
    fn can_serve(&self, suite: CipherSuite) -> bool {
        match suite.key_exchange() {
            KeyExchange::Psk => self.has_psk_store,
            KeyExchange::EcdhePsk => self.has_psk_store && self.psk_supports_ecdhe,
            KeyExchange::EcdheEcdsa => self.has_certificate,
            KeyExchange::Null => false,
        }
    }
}

/// Our first preferred suite that the client offered, we hold credentials for, and
/// (for ECC suites) for which a common group exists.
pub fn select_cipher_suite(
    ours: &[CipherSuite],
    theirs: &[CipherSuite],
    credentials: &ServerCredentials,
    common_group: Option<NamedGroup>,
) -> Option<CipherSuite> {
    ours.iter().copied().find(|s| {
        theirs.contains(s)
            && credentials.can_serve(*s)
            && (!s.is_ecc_based() || common_group.is_some())
    })
}

/// Our first preferred group the client supports. A client without the
/// `supported_groups` extension gets our first preference.
pub fn select_group(ours: &[NamedGroup], theirs: Option<&[NamedGroup]>) -> Option<NamedGroup> {
    match theirs {
        Some(theirs) => ours.iter().copied().find(|g| theirs.contains(g)),
        None => ours.first().copied(),
    }
}

/// Our first preferred ECDSA signature algorithm that the client accepts and the
/// signing key supports.
pub fn select_signature_algorithm(
    ours: &[SignatureAndHashAlgorithm],
    theirs: Option<&[SignatureAndHashAlgorithm]>,
    key: &[SignatureAndHashAlgorithm],
) -> Option<SignatureAndHashAlgorithm> {
    ours.iter().copied().find(|a| {
        a.signature == SignatureAlgorithm::ECDSA
            && key.contains(a)
            && theirs.map(|t| t.contains(a)).unwrap_or(true)
    })
}
