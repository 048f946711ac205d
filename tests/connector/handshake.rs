use std::sync::Arc;
use std::time::Duration;

use dimpl_connector::{
    AlertDescription, CertificateProvider, CipherSuite, ClientAuthentication, CloseReason,
    ConfigParams, DtlsRole, ExtendedMasterSecretMode, HandshakeState, HealthHandler, HealthStats,
    HelloVerifyMode, Output, PeerIdentity, ProtocolVersion, StaticPskStore,
};
use parking_lot::Mutex;

use crate::common::*;

#[test]
fn psk_handshake_with_cookie_exchange() {
    let mut pair = Pair::psk();
    pair.connect();

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));
    assert_eq!(pair.server.stats().hello_verify_requests, 1);
    assert_eq!(pair.server.stats().handshakes_succeeded, 1);
    assert_eq!(pair.client.stats().handshakes_succeeded, 1);

    // The first datagram the server answers is the HelloVerifyRequest.
    let first_reply = pair
        .delivered
        .iter()
        .find(|(d, _)| *d == Direction::ToClient)
        .map(|(_, dg)| dg.clone())
        .unwrap();
    assert_eq!(first_handshake_type(&first_reply), Some(HELLO_VERIFY_REQUEST));

    let client_session = pair.client.session(pair.server_addr).unwrap();
    let server_session = pair.server.session(pair.client_addr).unwrap();
    assert!(!client_session.id().is_empty());
    assert_eq!(client_session.id(), server_session.id());
    assert_eq!(client_session.cipher_suite(), server_session.cipher_suite());
    assert!(client_session.extended_master_secret());
    assert_eq!(server_session.peer_identity(), &PeerIdentity::Psk(b"client-1".to_vec()));

    assert!(pair.server.find_session(server_session.id()).is_some());
    assert_eq!(
        pair.client.handshake_state(pair.server_addr),
        Some(HandshakeState::Complete)
    );
    assert_eq!(
        pair.server.handshake_state(pair.client_addr),
        Some(HandshakeState::Complete)
    );
}

#[test]
fn explicit_psk_suites() {
    for suite in [
        CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256,
        CipherSuite::TLS_PSK_WITH_AES_256_GCM_SHA384,
        CipherSuite::TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256,
    ] {
        let mut pair = Pair::new(
            psk_client(|p| p.cipher_suites = vec![suite]),
            psk_server(|p| p.cipher_suites = vec![suite]),
        );
        pair.connect();

        assert_eq!(pair.client_connected(), Some(false), "{}", suite);
        let session = pair.client.session(pair.server_addr).unwrap();
        assert_eq!(session.cipher_suite(), suite);
        assert_eq!(session.group().is_some(), suite.is_ecc_based(), "{}", suite);

        pair.send_from_client(b"over the wire");
        assert_eq!(received(&pair.server_events), vec![b"over the wire".to_vec()]);
    }
}

fn ecdsa_pair(trusted: Vec<u8>) -> Pair {
    let identity = Arc::new(EcdsaIdentity::new(7));
    let client = ConfigParams {
        role: DtlsRole::ClientOnly,
        certificate_verifier: Some(Arc::new(PinnedVerifier { trusted })),
        rng_seed: Some(1),
        ..Default::default()
    };
    let server = ConfigParams {
        role: DtlsRole::ServerOnly,
        certificate_identity: Some(identity),
        rng_seed: Some(2),
        ..Default::default()
    };
    Pair::new(client, server)
}

#[test]
fn ecdhe_ecdsa_handshake() {
    let certificate = EcdsaIdentity::new(7).certificate();
    let mut pair = ecdsa_pair(certificate.clone());
    pair.connect();

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));

    let session = pair.client.session(pair.server_addr).unwrap();
    assert_eq!(
        session.cipher_suite(),
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    );
    assert_eq!(session.peer_identity(), &PeerIdentity::Certificate(vec![certificate]));
    assert!(session.signature_algorithm().is_some());

    pair.send_from_server(b"signed and sealed");
    assert_eq!(received(&pair.client_events), vec![b"signed and sealed".to_vec()]);
}

#[test]
fn untrusted_certificate_aborts() {
    let mut pair = ecdsa_pair(vec![1, 2, 3]);
    pair.connect();

    assert_eq!(pair.client_connected(), None);
    assert_eq!(
        closed(&pair.client_events),
        Some(CloseReason::HandshakeFailed(AlertDescription::BadCertificate))
    );
    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::PeerAlert(AlertDescription::BadCertificate))
    );
    assert_eq!(pair.client.stats().connections, 0);
    assert_eq!(pair.server.stats().connections, 0);
    assert_eq!(pair.client.stats().handshakes_failed, 1);
}

/// Certificate handshake where the server asks for a client certificate.
/// `client_identity` is the seed of the client's key, `trusted` what the
/// server accepts.
fn mutual_pair(mode: ClientAuthentication, client_identity: Option<u8>, trusted: Vec<u8>) -> Pair {
    let server_identity = EcdsaIdentity::new(7);
    let client = ConfigParams {
        role: DtlsRole::ClientOnly,
        certificate_identity: client_identity
            .map(|seed| Arc::new(EcdsaIdentity::new(seed)) as Arc<dyn CertificateProvider>),
        certificate_verifier: Some(Arc::new(PinnedVerifier {
            trusted: server_identity.certificate(),
        })),
        rng_seed: Some(1),
        ..Default::default()
    };
    let server = ConfigParams {
        role: DtlsRole::ServerOnly,
        certificate_identity: Some(Arc::new(server_identity)),
        certificate_verifier: Some(Arc::new(PinnedVerifier { trusted })),
        client_authentication: mode,
        rng_seed: Some(2),
        ..Default::default()
    };
    Pair::new(client, server)
}

#[test]
fn no_client_authentication_by_default() {
    let mut pair = mutual_pair(ClientAuthentication::None, Some(9), EcdsaIdentity::new(9).certificate());
    pair.connect();

    assert_eq!(pair.server_connected(), Some(false));
    let session = pair.server.session(pair.client_addr).unwrap();
    assert_eq!(session.peer_identity(), &PeerIdentity::Anonymous);
}

#[test]
fn wanted_client_certificate_is_verified() {
    let certificate = EcdsaIdentity::new(9).certificate();
    let mut pair = mutual_pair(ClientAuthentication::Wanted, Some(9), certificate.clone());
    pair.connect();

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));
    let session = pair.server.session(pair.client_addr).unwrap();
    assert_eq!(session.peer_identity(), &PeerIdentity::Certificate(vec![certificate]));

    pair.send_from_client(b"mutually authenticated");
    assert_eq!(received(&pair.server_events), vec![b"mutually authenticated".to_vec()]);
}

#[test]
fn wanted_accepts_client_without_certificate() {
    let mut pair = mutual_pair(ClientAuthentication::Wanted, None, EcdsaIdentity::new(9).certificate());
    pair.connect();

    assert_eq!(pair.client_connected(), Some(false));
    assert_eq!(pair.server_connected(), Some(false));
    let session = pair.server.session(pair.client_addr).unwrap();
    assert_eq!(session.peer_identity(), &PeerIdentity::Anonymous);
}

#[test]
fn needed_client_certificate() {
    let certificate = EcdsaIdentity::new(9).certificate();
    let mut pair = mutual_pair(ClientAuthentication::Needed, Some(9), certificate.clone());
    pair.connect();

    assert_eq!(pair.server_connected(), Some(false));
    let session = pair.server.session(pair.client_addr).unwrap();
    assert_eq!(session.peer_identity(), &PeerIdentity::Certificate(vec![certificate]));
}

#[test]
fn needed_rejects_client_without_certificate() {
    let mut pair = mutual_pair(ClientAuthentication::Needed, None, EcdsaIdentity::new(9).certificate());
    pair.connect();

    assert_eq!(pair.client_connected(), None);
    assert_eq!(pair.server_connected(), None);
    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::HandshakeFailed(AlertDescription::HandshakeFailure))
    );
    assert_eq!(pair.server.stats().connections, 0);
    assert_eq!(pair.server.stats().handshakes_failed, 1);
}

#[test]
fn untrusted_client_certificate_aborts() {
    let mut pair = mutual_pair(ClientAuthentication::Needed, Some(9), EcdsaIdentity::new(3).certificate());
    pair.connect();

    assert_eq!(pair.server_connected(), None);
    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::HandshakeFailed(AlertDescription::BadCertificate))
    );
    assert_eq!(
        closed(&pair.client_events),
        Some(CloseReason::PeerAlert(AlertDescription::BadCertificate))
    );
}

#[test]
fn unknown_psk_identity() {
    let server = psk_server(|p| {
        p.psk_store = Some(Arc::new(StaticPskStore::new().with_key("someone-else", "secret-1")));
    });
    let mut pair = Pair::new(psk_client(|_| {}), server);
    pair.connect();

    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::HandshakeFailed(AlertDescription::UnknownPskIdentity))
    );
    assert_eq!(
        closed(&pair.client_events),
        Some(CloseReason::PeerAlert(AlertDescription::UnknownPskIdentity))
    );
}

#[test]
fn wrong_psk_secret_fails_finished() {
    let server = psk_server(|p| {
        p.psk_store = Some(Arc::new(StaticPskStore::new().with_key("client-1", "not-the-secret")));
    });
    let mut pair = Pair::new(psk_client(|_| {}), server);
    pair.connect();

    // The client Finished does not authenticate under the server's keys.
    assert_eq!(pair.server_connected(), None);
    assert_eq!(pair.client_connected(), None);
    assert_ne!(
        pair.server.handshake_state(pair.client_addr),
        Some(HandshakeState::Complete)
    );
    assert!(pair.server.stats().records_dropped >= 1);
}

#[test]
fn extended_master_secret_required() {
    let client = psk_client(|p| p.extended_master_secret = ExtendedMasterSecretMode::None);
    let server = psk_server(|p| p.extended_master_secret = ExtendedMasterSecretMode::Required);
    let mut pair = Pair::new(client, server);
    pair.connect();

    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::HandshakeFailed(AlertDescription::HandshakeFailure))
    );
    assert_eq!(
        closed(&pair.client_events),
        Some(CloseReason::PeerAlert(AlertDescription::HandshakeFailure))
    );
}

#[test]
fn handshake_without_extended_master_secret() {
    let client = psk_client(|p| p.extended_master_secret = ExtendedMasterSecretMode::Optional);
    let server = psk_server(|p| p.extended_master_secret = ExtendedMasterSecretMode::None);
    let mut pair = Pair::new(client, server);
    pair.connect();

    assert_eq!(pair.client_connected(), Some(false));
    let session = pair.client.session(pair.server_addr).unwrap();
    assert!(!session.extended_master_secret());
}

#[test]
fn no_cookie_for_psk_clients() {
    let server = psk_server(|p| p.hello_verify_request = HelloVerifyMode::NotForPsk);
    let mut pair = Pair::new(psk_client(|_| {}), server);
    pair.connect();

    assert_eq!(pair.server_connected(), Some(false));
    assert_eq!(pair.server.stats().hello_verify_requests, 0);
}

#[test]
fn hello_verify_request_version() {
    for (fixed, expected) in [(None, [0xFE, 0xFD]), (Some(ProtocolVersion::DTLS1_0), [0xFE, 0xFF])] {
        let server = psk_server(|p| p.hello_verify_version = fixed);
        let mut pair = Pair::new(psk_client(|_| {}), server);
        pair.connect();
        assert_eq!(pair.client_connected(), Some(false));

        let hvr = pair
            .delivered
            .iter()
            .map(|(_, dg)| dg)
            .find(|dg| first_handshake_type(dg) == Some(HELLO_VERIFY_REQUEST))
            .unwrap();
        // Record header, handshake header, then the version.
        assert_eq!(hvr[25..27], expected);
    }
}

#[test]
fn resumption_skips_cookie_exchange() {
    let mut pair = Pair::psk();
    pair.connect();
    let first = pair.client.session(pair.server_addr).unwrap();

    pair.client_events.clear();
    pair.server_events.clear();
    pair.advance(Duration::from_secs(1));

    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    assert_eq!(closed(&out), Some(CloseReason::Evicted));
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &transmits(&out)[0]);

    // Until the resumption completes the server keeps the first connection.
    assert_eq!(closed(&out), None);
    assert_eq!(pair.server.stats().connections, 2);
    assert_eq!(
        pair.server.session(pair.client_addr).map(|s| *s.id()),
        Some(*first.id())
    );
    assert!(pair.server.find_session(first.id()).is_some());

    pair.pump(out, Direction::ToClient);

    assert_eq!(pair.client_connected(), Some(true));
    assert_eq!(pair.server_connected(), Some(true));
    assert_eq!(pair.server.stats().hello_verify_requests, 1);

    let resumed = pair.client.session(pair.server_addr).unwrap();
    assert_eq!(resumed.id(), first.id());
    assert_eq!(resumed.cipher_suite(), first.cipher_suite());

    // The server swapped connections without reporting a close.
    assert_eq!(closed(&pair.server_events), None);
    assert_eq!(pair.client.stats().connections, 1);
    assert_eq!(pair.server.stats().connections, 1);
    assert!(pair.server.find_session(first.id()).is_some());

    pair.send_from_client(b"after resumption");
    assert_eq!(received(&pair.server_events), vec![b"after resumption".to_vec()]);
}

#[test]
fn abandoned_resumption_keeps_established_connection() {
    let mut pair = Pair::psk();
    pair.connect();
    let first = pair.server.session(pair.client_addr).unwrap();

    // Sent before the client started over, still on its way.
    let out = pair.client.send(pair.now, pair.server_addr, b"late".to_vec()).unwrap();
    let late = transmits(&out);

    // Only the resumption hello reaches the server.
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &transmits(&out)[0]);
    assert!(!transmits(&out).is_empty());
    assert_eq!(closed(&out), None);
    assert_eq!(pair.server.stats().connections, 2);

    let out = pair.server.handle_datagram(pair.now, pair.client_addr, &late[0]);
    assert_eq!(received(&out), vec![b"late".to_vec()]);

    for _ in 0..200 {
        pair.advance_filtered(Duration::from_secs(1), |_, _| false);
    }

    assert_eq!(
        closed(&pair.server_events),
        Some(CloseReason::RetransmissionsExhausted)
    );
    assert_eq!(pair.server.stats().connections, 1);
    assert_eq!(
        pair.server.session(pair.client_addr).map(|s| *s.id()),
        Some(*first.id())
    );
    assert!(pair.server.find_session(first.id()).is_some());

    let out = pair
        .server
        .send(pair.now, pair.client_addr, b"still here".to_vec())
        .unwrap();
    assert_eq!(transmits(&out).len(), 1);
}

#[test]
fn zero_threshold_challenges_resumption() {
    let server = psk_server(|p| p.verify_peers_on_resumption_threshold = 0);
    let mut pair = Pair::new(psk_client(|_| {}), server);
    pair.connect();
    pair.connect();

    assert_eq!(pair.client_connected(), Some(true));
    assert_eq!(pair.server.stats().hello_verify_requests, 2);
}

#[test]
fn connect_while_handshaking_is_ignored() {
    let mut pair = Pair::psk();
    let out = pair.client.connect(pair.now, pair.server_addr).unwrap();
    assert_eq!(transmits(&out).len(), 1);

    let again = pair.client.connect(pair.now, pair.server_addr).unwrap();
    assert!(again.is_empty());
    assert_eq!(pair.client.stats().handshakes_started, 1);

    pair.pump(out, Direction::ToServer);
    assert_eq!(pair.client_connected(), Some(false));
}

#[test]
fn listener_sees_lifecycle() {
    let client_listener = Arc::new(RecordingListener::default());
    let server_listener = Arc::new(RecordingListener::default());
    let client = psk_client(|p| p.connection_listener = Some(client_listener.clone()));
    let server = psk_server(|p| p.connection_listener = Some(server_listener.clone()));
    let mut pair = Pair::new(client, server);
    pair.connect();

    let out = pair.client.close(pair.now, pair.server_addr).unwrap();
    pair.pump(out, Direction::ToServer);

    let server_addr = pair.server_addr;
    let client_addr = pair.client_addr;
    assert_eq!(
        *client_listener.events.lock(),
        vec![
            Event::Established {
                peer: server_addr,
                resumed: false
            },
            Event::Removed { peer: server_addr },
        ]
    );
    assert_eq!(
        *server_listener.events.lock(),
        vec![
            Event::Established {
                peer: client_addr,
                resumed: false
            },
            Event::Removed { peer: client_addr },
        ]
    );
}

#[test]
fn listener_sees_failure() {
    let listener = Arc::new(RecordingListener::default());
    let client = psk_client(|p| {
        p.extended_master_secret = ExtendedMasterSecretMode::None;
        p.connection_listener = Some(listener.clone());
    });
    let server = psk_server(|p| p.extended_master_secret = ExtendedMasterSecretMode::Required);
    let mut pair = Pair::new(client, server);
    pair.connect();

    let events = listener.events.lock();
    assert!(events.contains(&Event::Failed {
        peer: pair.server_addr,
        alert: Some(AlertDescription::HandshakeFailure)
    }));
    assert!(events.contains(&Event::Removed { peer: pair.server_addr }));
}

#[derive(Default)]
struct RecordingHealth {
    reports: Mutex<Vec<HealthStats>>,
}

impl HealthHandler for RecordingHealth {
    fn report(&self, stats: &HealthStats) {
        self.reports.lock().push(stats.clone());
    }
}

#[test]
fn health_reports_follow_interval() {
    let health = Arc::new(RecordingHealth::default());
    let server = psk_server(|p| {
        p.health_handler = Some(health.clone());
        p.health_status_interval = Duration::from_secs(10);
    });
    let mut pair = Pair::new(psk_client(|_| {}), server);
    pair.connect();
    assert!(health.reports.lock().is_empty());

    pair.advance(Duration::from_secs(5));
    assert!(health.reports.lock().is_empty());

    pair.advance(Duration::from_secs(6));
    let reports = health.reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].connections, 1);
    assert_eq!(reports[0].handshakes_succeeded, 1);
    assert_eq!(reports[0].hello_verify_requests, 1);
}

#[test]
fn invalid_configuration_lists_every_violation() {
    let params = ConfigParams {
        role: DtlsRole::ServerOnly,
        mtu: 10,
        max_retransmissions: 0,
        ..Default::default()
    };
    let err = params.build().unwrap_err();
    assert!(err.violations.len() >= 3, "{}", err);
}

#[test]
fn handshake_reports_only_connected() {
    let mut pair = Pair::psk();
    pair.connect();
    assert!(pair
        .server_events
        .iter()
        .all(|o| matches!(o, Output::Connected { .. })));
}
