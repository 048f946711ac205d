use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{
    CertificateProvider, CertificateVerifier, ConnectionListener, PskStore, ResumptionVerifier,
};
use crate::error::{ConfigError, Violation};
use crate::health::HealthHandler;
use crate::policy::{self, PolicyInput};
use crate::registry::{CipherSuite, NamedGroup, SignatureAndHashAlgorithm};
use crate::types::ProtocolVersion;

/// Which side(s) of a handshake the connector may play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    ClientOnly,
    ServerOnly,
    Both,
}

impl DtlsRole {
    pub fn is_client(&self) -> bool {
        *self != DtlsRole::ServerOnly
    }

    pub fn is_server(&self) -> bool {
        *self != DtlsRole::ClientOnly
    }
}

/// When the server answers a ClientHello with a HelloVerifyRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloVerifyMode {
    /// Always challenge (resumption may still skip, see the resumption threshold).
    Always,
    /// Do not challenge clients sharing a PSK suite with us.
    NotForPsk,
    /// Never challenge.
    Disabled,
}

/// Whether a server asks clients of certificate based cipher suites for a
/// certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthentication {
    /// No CertificateRequest is sent.
    None,
    /// A certificate is requested, clients without one are accepted.
    Wanted,
    /// Clients without a certificate fail the handshake.
    Needed,
}

impl ClientAuthentication {
    pub fn requests_certificate(&self) -> bool {
        *self != ClientAuthentication::None
    }
}

/// Use of the extended master secret extension (RFC 7627).
///
/// Ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtendedMasterSecretMode {
    /// Neither offered nor accepted.
    None,
    /// Offered as client, accepted as server, not insisted on.
    Optional,
    /// Offered and used when the peer does. Resumption requires it.
    Enabled,
    /// Handshakes without it fail.
    Required,
}

/// Operator input for a [`Config`].
///
/// A plain value with public fields. Nothing is checked until [`ConfigParams::build`],
/// which either returns a consistent [`Config`] or every violated constraint at once.
#[derive(Clone)]
pub struct ConfigParams {
    pub role: DtlsRole,
    pub retransmission_timeout: Duration,
    pub max_retransmission_timeout: Duration,
    pub retransmission_random_factor: f64,
    pub retransmission_timeout_scale: f64,
    pub additional_timeout_for_ecc: Duration,
    pub max_retransmissions: usize,
    /// `None` means half of `max_retransmissions`. `Some(0)` disables back-off mode.
    pub back_off_retransmission: Option<usize>,
    pub use_early_stop_retransmission: bool,
    pub use_multi_record_messages: Option<bool>,
    pub use_multi_handshake_message_records: Option<bool>,
    pub mtu: usize,
    pub record_size_limit: Option<u16>,
    pub max_connections: usize,
    pub stale_connection_threshold: Duration,
    pub max_deferred_outbound_messages: usize,
    pub max_deferred_inbound_records_size: usize,
    /// Largest handshake message reassembled from fragments.
    pub max_fragmented_handshake_message_length: usize,
    pub verify_peers_on_resumption_threshold: u8,
    pub hello_verify_request: HelloVerifyMode,
    /// Fixed version for HelloVerifyRequests. `None` answers with the client's version.
    pub hello_verify_version: Option<ProtocolVersion>,
    pub use_server_session_id: bool,
    pub client_authentication: ClientAuthentication,
    pub extended_master_secret: ExtendedMasterSecretMode,
    pub connection_id_length: Option<usize>,
    pub connection_id_node_id: Option<u8>,
    pub use_deprecated_cid: bool,
    pub use_anti_replay_filter: bool,
    pub disabled_window: u64,
    pub update_address_using_cid_on_newer_records: bool,
    pub recommended_cipher_suites_only: bool,
    pub recommended_groups_only: bool,
    pub recommended_signature_algorithms_only: bool,
    pub cipher_suites: Vec<CipherSuite>,
    pub preselected_cipher_suites: Option<Vec<CipherSuite>>,
    pub signature_algorithms: Vec<SignatureAndHashAlgorithm>,
    pub groups: Vec<NamedGroup>,
    pub psk_store: Option<Arc<dyn PskStore>>,
    pub certificate_identity: Option<Arc<dyn CertificateProvider>>,
    pub certificate_verifier: Option<Arc<dyn CertificateVerifier>>,
    pub resumption_verifier: Option<Arc<dyn ResumptionVerifier>>,
    pub connection_listener: Option<Arc<dyn ConnectionListener>>,
    pub health_handler: Option<Arc<dyn HealthHandler>>,
    pub health_status_interval: Duration,
    pub receiver_count: usize,
    pub worker_count: usize,
    pub rng_seed: Option<u64>,
}

impl Default for ConfigParams {
    fn default() -> Self {
        ConfigParams {
            role: DtlsRole::Both,
            retransmission_timeout: Duration::from_secs(2),
            max_retransmission_timeout: Duration::from_secs(60),
            retransmission_random_factor: 1.0,
            retransmission_timeout_scale: 2.0,
            additional_timeout_for_ecc: Duration::ZERO,
            max_retransmissions: 4,
            back_off_retransmission: None,
            use_early_stop_retransmission: true,
            use_multi_record_messages: None,
            use_multi_handshake_message_records: None,
            mtu: 1280,
            record_size_limit: None,
            max_connections: 150_000,
            stale_connection_threshold: Duration::from_secs(30 * 60),
            max_deferred_outbound_messages: 10,
            max_deferred_inbound_records_size: 8192,
            max_fragmented_handshake_message_length: 8192,
            verify_peers_on_resumption_threshold: 30,
            hello_verify_request: HelloVerifyMode::Always,
            hello_verify_version: None,
            use_server_session_id: true,
            client_authentication: ClientAuthentication::None,
            extended_master_secret: ExtendedMasterSecretMode::Enabled,
            connection_id_length: None,
            connection_id_node_id: None,
            use_deprecated_cid: false,
            use_anti_replay_filter: true,
            disabled_window: 0,
            update_address_using_cid_on_newer_records: true,
            recommended_cipher_suites_only: true,
            recommended_groups_only: true,
            recommended_signature_algorithms_only: true,
            cipher_suites: Vec::new(),
            preselected_cipher_suites: None,
            signature_algorithms: Vec::new(),
            groups: Vec::new(),
            psk_store: None,
            certificate_identity: None,
            certificate_verifier: None,
            resumption_verifier: None,
            connection_listener: None,
            health_handler: None,
            health_status_interval: Duration::from_secs(60),
            receiver_count: 1,
            worker_count: 4,
            rng_seed: None,
        }
    }
}

impl ConfigParams {
    /// Validate all fields and cross-field rules at once.
    ///
    /// Cipher suites, signature algorithms and groups not given explicitly are
    /// derived from the configured credentials.
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut violations = Vec::new();

        self.check_timing(&mut violations);
        self.check_limits(&mut violations);

        let cipher_suites = self.resolve_cipher_suites(&mut violations);
        self.check_credentials(&cipher_suites, &mut violations);

        let (signature_algorithms, groups) =
            self.resolve_ecc_parameters(&cipher_suites, &mut violations);

        if !violations.is_empty() {
            return Err(ConfigError { violations });
        }

        let back_off_retransmission = self
            .back_off_retransmission
            .unwrap_or(self.max_retransmissions / 2);

        Ok(Config {
            cipher_suites,
            signature_algorithms,
            groups,
            back_off_retransmission,
            params: self,
        })
    }

    fn check_timing(&self, violations: &mut Vec<Violation>) {
        if self.retransmission_timeout.is_zero() {
            violations.push(Violation::NonPositiveRetransmissionTimeout);
        }
        if self.max_retransmission_timeout.is_zero() {
            violations.push(Violation::NonPositiveMaxRetransmissionTimeout);
        }
        if self.retransmission_timeout > self.max_retransmission_timeout {
            violations.push(Violation::InitialTimeoutAboveMax {
                initial: self.retransmission_timeout,
                max: self.max_retransmission_timeout,
            });
        }
        for (name, value) in [
            ("retransmission random factor", self.retransmission_random_factor),
            ("retransmission timeout scale", self.retransmission_timeout_scale),
        ] {
            if !(1.0..=2.0).contains(&value) {
                violations.push(Violation::FactorOutOfRange { name, value });
            }
        }
        if self.max_retransmissions == 0 {
            violations.push(Violation::NoRetransmissions);
        }
        if let Some(back_off) = self.back_off_retransmission {
            if back_off > 0 && back_off >= self.max_retransmissions {
                violations.push(Violation::BackOffNotBelowMax {
                    back_off,
                    max: self.max_retransmissions,
                });
            }
        }
    }

    fn check_limits(&self, violations: &mut Vec<Violation>) {
        if self.mtu < 64 {
            violations.push(Violation::MtuTooSmall(self.mtu));
        }
        if let Some(limit) = self.record_size_limit {
            if !(64..=16384).contains(&limit) {
                violations.push(Violation::RecordSizeLimitOutOfRange(limit));
            }
        }
        if self.max_connections == 0 {
            violations.push(Violation::NoConnections);
        }
        match (self.connection_id_length, self.connection_id_node_id) {
            (Some(len), _) if len > 32 => {
                violations.push(Violation::ConnectionIdTooLong(len));
            }
            (Some(len), Some(_)) if len < 5 => {
                violations.push(Violation::ConnectionIdTooShortForNodeId(len));
            }
            (None, Some(_)) => violations.push(Violation::NodeIdWithoutConnectionId),
            _ => {}
        }
        if let Some(version) = self.hello_verify_version {
            if !matches!(version, ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2) {
                violations.push(Violation::UnsupportedHelloVerifyVersion(version.as_u16()));
            }
        }
        if !(256..=65536).contains(&self.max_fragmented_handshake_message_length) {
            violations.push(Violation::HandshakeMessageLengthOutOfRange(
                self.max_fragmented_handshake_message_length,
            ));
        }
        if self.verify_peers_on_resumption_threshold > 100 {
            violations.push(Violation::ResumptionThresholdOutOfRange(
                self.verify_peers_on_resumption_threshold,
            ));
        }
        if self.receiver_count == 0 {
            violations.push(Violation::NoTasks("receiver"));
        }
        if self.worker_count == 0 {
            violations.push(Violation::NoTasks("worker"));
        }
    }

    fn resolve_cipher_suites(&self, violations: &mut Vec<Violation>) -> Vec<CipherSuite> {
        if !self.cipher_suites.is_empty() {
            policy::validate_cipher_suites(
                &self.cipher_suites,
                self.recommended_cipher_suites_only,
                violations,
            );
            return self.cipher_suites.clone();
        }

        let input = PolicyInput {
            has_certificate_identity: self.certificate_identity.is_some(),
            has_certificate_verifier: self.certificate_verifier.is_some(),
            has_psk_store: self.psk_store.is_some(),
            psk_supports_ecdhe: self
                .psk_store
                .as_ref()
                .map(|s| s.has_ecdhe_psk_supported())
                .unwrap_or(false),
            preselected: self.preselected_cipher_suites.as_deref(),
            recommended_only: self.recommended_cipher_suites_only,
        };

        match policy::derive_cipher_suites(&input) {
            Ok(suites) => suites,
            Err(v) => {
                violations.push(v);
                Vec::new()
            }
        }
    }

    fn check_credentials(&self, suites: &[CipherSuite], violations: &mut Vec<Violation>) {
        if suites.is_empty() {
            return;
        }

        let has_psk_suite = CipherSuite::contains_psk_based(suites);
        let has_certificate_suite = CipherSuite::contains_certificate_based(suites);

        if self.hello_verify_request != HelloVerifyMode::Always && !has_psk_suite {
            violations.push(Violation::HelloVerifyWithoutPskSuite);
        }

        for suite in suites.iter().copied() {
            if suite.is_psk_based() {
                match &self.psk_store {
                    None => violations.push(Violation::PskSuiteWithoutPskStore(suite)),
                    Some(store) if suite.is_ecc_based() && !store.has_ecdhe_psk_supported() => {
                        violations.push(Violation::EcdhePskNotSupportedByStore(suite))
                    }
                    _ => {}
                }
            }
            if suite.requires_server_certificate_message() {
                if self.role == DtlsRole::ClientOnly {
                    if self.certificate_verifier.is_none() {
                        violations.push(Violation::CertificateSuiteWithoutVerifier(suite));
                    }
                } else if self.certificate_identity.is_none() {
                    violations.push(Violation::CertificateSuiteWithoutIdentity(suite));
                }
            }
        }

        if has_certificate_suite
            && self.role.is_server()
            && self.client_authentication.requests_certificate()
            && self.certificate_verifier.is_none()
        {
            violations.push(Violation::ClientAuthenticationWithoutVerifier(
                self.client_authentication,
            ));
        }

        if self.psk_store.is_some() && !has_psk_suite {
            violations.push(Violation::PskStoreWithoutPskSuite);
        }
        if !has_certificate_suite {
            if self.certificate_identity.is_some() {
                violations.push(Violation::IdentityWithoutCertificateSuite);
            }
            if self.certificate_verifier.is_some() {
                violations.push(Violation::VerifierWithoutCertificateSuite);
            }
        }
    }

    fn resolve_ecc_parameters(
        &self,
        suites: &[CipherSuite],
        violations: &mut Vec<Violation>,
    ) -> (Vec<SignatureAndHashAlgorithm>, Vec<NamedGroup>) {
        if !CipherSuite::contains_ecc_based(suites) {
            if !suites.is_empty() {
                if !self.groups.is_empty() {
                    violations.push(Violation::GroupsWithoutEccSuite);
                }
                if !self.signature_algorithms.is_empty() {
                    violations.push(Violation::SignatureAlgorithmsWithoutEccSuite);
                }
            }
            return (Vec::new(), Vec::new());
        }

        let identity = self.certificate_identity.as_ref();

        let signature_algorithms = if self.signature_algorithms.is_empty() {
            let mut algs = SignatureAndHashAlgorithm::DEFAULT.to_vec();
            for a in identity.map(|i| i.signature_algorithms()).unwrap_or_default() {
                if a.is_supported() && !algs.contains(&a) {
                    algs.push(a);
                }
            }
            algs
        } else {
            self.signature_algorithms.clone()
        };
        policy::validate_signature_algorithms(
            &signature_algorithms,
            self.recommended_signature_algorithms_only,
            violations,
        );

        let groups = if self.groups.is_empty() {
            let mut groups = NamedGroup::preferred().to_vec();
            for g in identity.map(|i| i.groups()).unwrap_or_default() {
                if g.is_supported() && !groups.contains(&g) {
                    groups.push(g);
                }
            }
            groups
        } else {
            self.groups.clone()
        };
        policy::validate_groups(&groups, self.recommended_groups_only, violations);

        if signature_algorithms.is_empty() {
            violations.push(Violation::NoSignatureAlgorithms);
        }
        if groups.is_empty() {
            violations.push(Violation::NoGroups);
        }

        (signature_algorithms, groups)
    }
}

/// Validated, immutable connector configuration.
///
/// Obtained from [`ConfigParams::build`] and shared as `Arc<Config>`.
#[derive(Clone)]
pub struct Config {
    params: ConfigParams,
    cipher_suites: Vec<CipherSuite>,
    signature_algorithms: Vec<SignatureAndHashAlgorithm>,
    groups: Vec<NamedGroup>,
    back_off_retransmission: usize,
}

impl Config {
    #[inline(always)]
    pub fn role(&self) -> DtlsRole {
        self.params.role
    }

    /// Initial timeout of a flight, before randomization.
    #[inline(always)]
    pub fn retransmission_timeout(&self) -> Duration {
        self.params.retransmission_timeout
    }

    /// Upper bound of any flight timeout.
    #[inline(always)]
    pub fn max_retransmission_timeout(&self) -> Duration {
        self.params.max_retransmission_timeout
    }

    /// The initial timeout is multiplied by a random value in `[1.0, factor]`.
    #[inline(always)]
    pub fn retransmission_random_factor(&self) -> f64 {
        self.params.retransmission_random_factor
    }

    /// Multiplier applied to the timeout per retransmission.
    #[inline(always)]
    pub fn retransmission_timeout_scale(&self) -> f64 {
        self.params.retransmission_timeout_scale
    }

    /// Added to the initial timeout of flights involving ECC operations on the peer.
    #[inline(always)]
    pub fn additional_timeout_for_ecc(&self) -> Duration {
        self.params.additional_timeout_for_ecc
    }

    #[inline(always)]
    pub fn max_retransmissions(&self) -> usize {
        self.params.max_retransmissions
    }

    /// Retransmission attempt from which flights are sent in back-off mode. 0 disables.
    #[inline(always)]
    pub fn back_off_retransmission(&self) -> usize {
        self.back_off_retransmission
    }

    #[inline(always)]
    pub fn use_early_stop_retransmission(&self) -> bool {
        self.params.use_early_stop_retransmission
    }

    #[inline(always)]
    pub fn use_multi_record_messages(&self) -> Option<bool> {
        self.params.use_multi_record_messages
    }

    #[inline(always)]
    pub fn use_multi_handshake_message_records(&self) -> Option<bool> {
        self.params.use_multi_handshake_message_records
    }

    /// Largest datagram produced outside back-off mode.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.params.mtu
    }

    /// Record size limit we announce (RFC 8449).
    #[inline(always)]
    pub fn record_size_limit(&self) -> Option<u16> {
        self.params.record_size_limit
    }

    #[inline(always)]
    pub fn max_connections(&self) -> usize {
        self.params.max_connections
    }

    /// Idle time after which a connection may be evicted for a new one.
    #[inline(always)]
    pub fn stale_connection_threshold(&self) -> Duration {
        self.params.stale_connection_threshold
    }

    #[inline(always)]
    pub fn max_deferred_outbound_messages(&self) -> usize {
        self.params.max_deferred_outbound_messages
    }

    #[inline(always)]
    pub fn max_deferred_inbound_records_size(&self) -> usize {
        self.params.max_deferred_inbound_records_size
    }

    #[inline(always)]
    pub fn max_fragmented_handshake_message_length(&self) -> usize {
        self.params.max_fragmented_handshake_message_length
    }

    /// Percentage of `max_connections` pending unverified resumptions may reach
    /// before resumptions are challenged as well. 0 always challenges.
    #[inline(always)]
    pub fn verify_peers_on_resumption_threshold(&self) -> u8 {
        self.params.verify_peers_on_resumption_threshold
    }

    #[inline(always)]
    pub fn hello_verify_request(&self) -> HelloVerifyMode {
        self.params.hello_verify_request
    }

    #[inline(always)]
    pub fn hello_verify_version(&self) -> Option<ProtocolVersion> {
        self.params.hello_verify_version
    }

    #[inline(always)]
    pub fn use_server_session_id(&self) -> bool {
        self.params.use_server_session_id
    }

    /// Only used as server, with certificate based cipher suites.
    #[inline(always)]
    pub fn client_authentication(&self) -> ClientAuthentication {
        self.params.client_authentication
    }

    #[inline(always)]
    pub fn extended_master_secret(&self) -> ExtendedMasterSecretMode {
        self.params.extended_master_secret
    }

    /// Length of the connection ids we issue. `None` disables CID support.
    #[inline(always)]
    pub fn connection_id_length(&self) -> Option<usize> {
        self.params.connection_id_length
    }

    #[inline(always)]
    pub fn connection_id_node_id(&self) -> Option<u8> {
        self.params.connection_id_node_id
    }

    #[inline(always)]
    pub fn use_deprecated_cid(&self) -> bool {
        self.params.use_deprecated_cid
    }

    #[inline(always)]
    pub fn use_anti_replay_filter(&self) -> bool {
        self.params.use_anti_replay_filter
    }

    /// Extra margin below the replay window in which unseen records are still accepted.
    #[inline(always)]
    pub fn disabled_window(&self) -> u64 {
        self.params.disabled_window
    }

    #[inline(always)]
    pub fn update_address_using_cid_on_newer_records(&self) -> bool {
        self.params.update_address_using_cid_on_newer_records
    }

    /// Cipher suites in preference order.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    /// Signature algorithms in preference order. Empty without ECC suites.
    #[inline(always)]
    pub fn signature_algorithms(&self) -> &[SignatureAndHashAlgorithm] {
        &self.signature_algorithms
    }

    /// Groups in preference order. Empty without ECC suites.
    #[inline(always)]
    pub fn groups(&self) -> &[NamedGroup] {
        &self.groups
    }

    #[inline(always)]
    pub fn psk_store(&self) -> Option<&Arc<dyn PskStore>> {
        self.params.psk_store.as_ref()
    }

    #[inline(always)]
    pub fn certificate_identity(&self) -> Option<&Arc<dyn CertificateProvider>> {
        self.params.certificate_identity.as_ref()
    }

    #[inline(always)]
    pub fn certificate_verifier(&self) -> Option<&Arc<dyn CertificateVerifier>> {
        self.params.certificate_verifier.as_ref()
    }

    #[inline(always)]
    pub fn resumption_verifier(&self) -> Option<&Arc<dyn ResumptionVerifier>> {
        self.params.resumption_verifier.as_ref()
    }

    #[inline(always)]
    pub fn connection_listener(&self) -> Option<&Arc<dyn ConnectionListener>> {
        self.params.connection_listener.as_ref()
    }

    #[inline(always)]
    pub fn health_handler(&self) -> Option<&Arc<dyn HealthHandler>> {
        self.params.health_handler.as_ref()
    }

    #[inline(always)]
    pub fn health_status_interval(&self) -> Duration {
        self.params.health_status_interval
    }

    #[inline(always)]
    pub fn receiver_count(&self) -> usize {
        self.params.receiver_count
    }

    #[inline(always)]
    pub fn worker_count(&self) -> usize {
        self.params.worker_count
    }

    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.params.rng_seed
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.params.role)
            .field("cipher_suites", &self.cipher_suites)
            .field("groups", &self.groups)
            .field("signature_algorithms", &self.signature_algorithms)
            .field("mtu", &self.params.mtu)
            .field("max_connections", &self.params.max_connections)
            .field("connection_id_length", &self.params.connection_id_length)
            .field("psk_store", &self.params.psk_store.is_some())
            .field("certificate_identity", &self.params.certificate_identity.is_some())
            .field("certificate_verifier", &self.params.certificate_verifier.is_some())
            .finish_non_exhaustive()
    }
}
