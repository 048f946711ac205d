//! Shared helpers for connector integration tests.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dimpl_connector::{
    AlertDescription, CertificateProvider, CertificateType, CertificateVerifier, CloseReason,
    ConfigParams, ConnectionListener, Connector, DtlsRole, NamedGroup, Output, Session,
    SignatureAndHashAlgorithm, StaticPskStore,
};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{DerSignature, Signature, SigningKey, VerifyingKey};
use parking_lot::Mutex;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn client_addr() -> SocketAddr {
    addr("10.0.0.1:40000")
}

pub fn server_addr() -> SocketAddr {
    addr("10.0.0.2:5684")
}

pub fn psk_store() -> Arc<StaticPskStore> {
    Arc::new(StaticPskStore::new().with_key("client-1", "secret-1"))
}

/// Client configuration with a PSK identity.
pub fn psk_client(f: impl FnOnce(&mut ConfigParams)) -> ConfigParams {
    let mut params = ConfigParams {
        role: DtlsRole::ClientOnly,
        psk_store: Some(psk_store()),
        rng_seed: Some(1),
        ..Default::default()
    };
    f(&mut params);
    params
}

/// Server configuration knowing the client's PSK.
pub fn psk_server(f: impl FnOnce(&mut ConfigParams)) -> ConfigParams {
    let mut params = ConfigParams {
        role: DtlsRole::ServerOnly,
        psk_store: Some(psk_store()),
        rng_seed: Some(2),
        ..Default::default()
    };
    f(&mut params);
    params
}

pub fn connector(params: ConfigParams) -> Connector {
    Connector::new(Arc::new(params.build().expect("valid config")))
}

// ----------------------------------------------------------------------
// Certificates
// ----------------------------------------------------------------------

/// An ECDSA P-256 identity whose "certificate" is the SEC1 public key.
pub struct EcdsaIdentity {
    key: SigningKey,
}

impl EcdsaIdentity {
    pub fn new(seed: u8) -> Self {
        let key = SigningKey::from_slice(&[seed; 32]).expect("valid scalar");
        EcdsaIdentity { key }
    }

    pub fn certificate(&self) -> Vec<u8> {
        p256::PublicKey::from(self.key.verifying_key()).to_sec1_bytes().to_vec()
    }
}

impl CertificateProvider for EcdsaIdentity {
    fn certificate_chain(&self, _certificate_type: CertificateType) -> Option<Vec<Vec<u8>>> {
        Some(vec![self.certificate()])
    }

    fn signature_algorithms(&self) -> Vec<SignatureAndHashAlgorithm> {
        vec![SignatureAndHashAlgorithm::SHA256_WITH_ECDSA]
    }

    fn groups(&self) -> Vec<NamedGroup> {
        vec![NamedGroup::Secp256r1]
    }

    fn sign(&self, algorithm: SignatureAndHashAlgorithm, data: &[u8]) -> Result<Vec<u8>, String> {
        if algorithm != SignatureAndHashAlgorithm::SHA256_WITH_ECDSA {
            return Err(format!("unsupported {:?}", algorithm));
        }
        let signature: DerSignature = self.key.sign(data);
        Ok(signature.as_bytes().to_vec())
    }
}

/// Trusts exactly one certificate.
pub struct PinnedVerifier {
    pub trusted: Vec<u8>,
}

impl CertificateVerifier for PinnedVerifier {
    fn verify_chain(&self, _peer: SocketAddr, chain: &[Vec<u8>]) -> Result<(), AlertDescription> {
        match chain.first() {
            Some(leaf) if *leaf == self.trusted => Ok(()),
            _ => Err(AlertDescription::BadCertificate),
        }
    }

    fn verify_signature(
        &self,
        chain: &[Vec<u8>],
        _algorithm: SignatureAndHashAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> bool {
        let Some(leaf) = chain.first() else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_sec1_bytes(leaf) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(signature) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }
}

// ----------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Established { peer: SocketAddr, resumed: bool },
    Failed { peer: SocketAddr, alert: Option<AlertDescription> },
    Removed { peer: SocketAddr },
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<Event>>,
}

impl ConnectionListener for RecordingListener {
    fn on_established(&self, peer: SocketAddr, _session: &Session, resumed: bool) {
        self.events.lock().push(Event::Established { peer, resumed });
    }

    fn on_handshake_failed(&self, peer: SocketAddr, alert: Option<AlertDescription>) {
        self.events.lock().push(Event::Failed { peer, alert });
    }

    fn on_removed(&self, peer: SocketAddr) {
        self.events.lock().push(Event::Removed { peer });
    }
}

// ----------------------------------------------------------------------
// Two connectors on a virtual network
// ----------------------------------------------------------------------

/// Which way a datagram travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

pub struct Pair {
    pub client: Connector,
    pub server: Connector,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub now: Instant,
    /// Non-transmit outputs of the client.
    pub client_events: Vec<Output>,
    /// Non-transmit outputs of the server.
    pub server_events: Vec<Output>,
    /// Datagrams delivered so far, per direction.
    pub delivered: Vec<(Direction, Vec<u8>)>,
}

impl Pair {
    pub fn new(client: ConfigParams, server: ConfigParams) -> Self {
        init_log();
        Pair {
            client: connector(client),
            server: connector(server),
            client_addr: client_addr(),
            server_addr: server_addr(),
            now: Instant::now(),
            client_events: Vec::new(),
            server_events: Vec::new(),
            delivered: Vec::new(),
        }
    }

    pub fn psk() -> Self {
        Pair::new(psk_client(|_| {}), psk_server(|_| {}))
    }

    /// Start a handshake and run it to the end without losses.
    pub fn connect(&mut self) {
        let out = self.client.connect(self.now, self.server_addr).expect("connect");
        self.pump(out, Direction::ToServer);
    }

    /// Deliver `outputs` of one side and everything they trigger.
    pub fn pump(&mut self, outputs: Vec<Output>, from: Direction) {
        self.pump_filtered(outputs, from, |_, _| true);
    }

    /// Like [`Pair::pump`], dropping datagrams for which `deliver` is false.
    pub fn pump_filtered(
        &mut self,
        outputs: Vec<Output>,
        from: Direction,
        mut deliver: impl FnMut(Direction, &[u8]) -> bool,
    ) {
        let mut queue: Vec<(Direction, Vec<u8>)> = Vec::new();
        self.collect(outputs, from, &mut queue);

        let mut rounds = 0;
        while !queue.is_empty() {
            rounds += 1;
            assert!(rounds < 1000, "datagram ping-pong does not settle");

            let (direction, datagram) = queue.remove(0);
            if !deliver(direction, &datagram) {
                continue;
            }
            self.delivered.push((direction, datagram.clone()));
            let out = match direction {
                Direction::ToServer => self.server.handle_datagram(self.now, self.client_addr, &datagram),
                Direction::ToClient => self.client.handle_datagram(self.now, self.server_addr, &datagram),
            };
            let reply = match direction {
                Direction::ToServer => Direction::ToClient,
                Direction::ToClient => Direction::ToServer,
            };
            self.collect(out, reply, &mut queue);
        }
    }

    fn collect(&mut self, outputs: Vec<Output>, direction: Direction, queue: &mut Vec<(Direction, Vec<u8>)>) {
        for output in outputs {
            match output {
                Output::Transmit { datagram, .. } => queue.push((direction, datagram)),
                other => match direction {
                    Direction::ToServer => self.client_events.push(other),
                    Direction::ToClient => self.server_events.push(other),
                },
            }
        }
    }

    /// Move time forward and fire due timers on both sides.
    pub fn advance(&mut self, by: Duration) {
        self.advance_filtered(by, |_, _| true);
    }

    pub fn advance_filtered(&mut self, by: Duration, mut deliver: impl FnMut(Direction, &[u8]) -> bool) {
        self.now += by;
        let out = self.client.handle_timeout(self.now);
        self.pump_filtered(out, Direction::ToServer, &mut deliver);
        let out = self.server.handle_timeout(self.now);
        self.pump_filtered(out, Direction::ToClient, &mut deliver);
    }

    pub fn client_connected(&self) -> Option<bool> {
        connected(&self.client_events)
    }

    pub fn server_connected(&self) -> Option<bool> {
        connected(&self.server_events)
    }

    pub fn send_from_client(&mut self, data: &[u8]) {
        let out = self
            .client
            .send(self.now, self.server_addr, data.to_vec())
            .expect("client send");
        self.pump(out, Direction::ToServer);
    }

    pub fn send_from_server(&mut self, data: &[u8]) {
        let out = self
            .server
            .send(self.now, self.client_addr, data.to_vec())
            .expect("server send");
        self.pump(out, Direction::ToClient);
    }
}

/// `Some(resumed)` of the latest `Connected` among `events`.
pub fn connected(events: &[Output]) -> Option<bool> {
    events.iter().rev().find_map(|e| match e {
        Output::Connected { resumed, .. } => Some(*resumed),
        _ => None,
    })
}

pub fn closed(events: &[Output]) -> Option<CloseReason> {
    events.iter().rev().find_map(|e| match e {
        Output::Closed { reason, .. } => Some(*reason),
        _ => None,
    })
}

pub fn received(events: &[Output]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            Output::ApplicationData { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

pub fn transmits(outputs: &[Output]) -> Vec<Vec<u8>> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Transmit { datagram, .. } => Some(datagram.clone()),
            _ => None,
        })
        .collect()
}

/// Record header fields of every record in a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecHdr {
    pub ctype: u8,
    pub epoch: u16,
    pub seq: u64,
}

pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;
pub const CONTENT_TLS12_CID: u8 = 25;

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const HELLO_VERIFY_REQUEST: u8 = 3;
pub const CLIENT_KEY_EXCHANGE: u8 = 16;

/// Parse plaintext record headers. Records with a connection id are skipped
/// after their header since their length is unknown here.
pub fn parse_records(datagram: &[u8]) -> Vec<RecHdr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        let seq = u64::from_be_bytes(seq_bytes);
        out.push(RecHdr { ctype, epoch, seq });
        if ctype == CONTENT_TLS12_CID {
            break;
        }
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        i += 13 + len;
    }
    out
}

/// First handshake message type of a datagram, if it starts with a plaintext
/// handshake record.
pub fn first_handshake_type(datagram: &[u8]) -> Option<u8> {
    if datagram.len() > 13 && datagram[0] == CONTENT_HANDSHAKE && datagram[3..5] == [0, 0] {
        Some(datagram[13])
    } else {
        None
    }
}
