//! Client side of the DTLS 1.2 handshake.
//!
//! ```text
//! Flight 1  ClientHello                       -->
//! Flight 2                                    <-- HelloVerifyRequest
//! Flight 3  ClientHello (with cookie)         -->
//! Flight 4                                    <-- ServerHello
//!                                                 [Certificate]
//!                                                 [ServerKeyExchange]
//!                                                 [CertificateRequest]
//!                                                 ServerHelloDone
//! Flight 5  [Certificate]
//!           ClientKeyExchange
//!           [CertificateVerify]
//!           ChangeCipherSpec
//!           Finished                          -->
//! Flight 6                                    <-- ChangeCipherSpec
//!                                                 Finished
//! ```
//!
//! Resuming a session shortens this to ServerHello, ChangeCipherSpec and
//! Finished from the server, answered by our ChangeCipherSpec and Finished.

use std::fmt;

use zeroize::Zeroizing;

use super::engine::{Engine, Message};
use super::{unexpected, Context, Established, HandshakeState};
use crate::buffer::Buf;
use crate::config::ExtendedMasterSecretMode;
use crate::credentials::CertificateType;
use crate::crypto::EphemeralKey;
use crate::error::Error;
use crate::message::{
    signed_params, AlertDescription, Certificate, CertificateRequest, CertificateVerify, CidCodePoint,
    ClientHello, ClientKeyExchange, ConnectionId, Cookie, DigitallySigned, Extension, ExtensionsExt, Finished, HelloVerifyRequest, MessageType,
    Random, ServerHello, ServerKeyExchange, SessionId,
};
use crate::policy::select_signature_algorithm;
use crate::record_layer::RecordLayer;
use crate::registry::{CipherSuite, KeyExchange, NamedGroup, SignatureAndHashAlgorithm};
use crate::rng::SeededRng;
use crate::session::{PeerIdentity, Session};
use crate::types::ProtocolVersion;
use crate::util::parse_exact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ServerHello,
    Certificate,
    ServerKeyExchange,
    ServerHelloDone,
    Finished,
    Done,
}

pub(crate) struct ClientHandshake {
    pub(super) engine: Engine,
    pub(super) established: Option<Established>,

    step: Step,
    hello: ClientHello,
    resume: Option<Session>,
    abbreviated: bool,

    /// Connection id we asked the server to use toward us.
    offered_cid: Option<ConnectionId>,
    cid_code_point: CidCodePoint,

    session_id: SessionId,
    server_chain: Option<Vec<Vec<u8>>>,
    server_params: Option<ServerKeyExchange>,
    signature_algorithm: Option<SignatureAndHashAlgorithm>,
    group: Option<NamedGroup>,
    psk_identity: Option<Vec<u8>>,
    certificate_request: Option<CertificateRequest>,
}

impl ClientHandshake {
    /// Send the first ClientHello, offering to resume `resume` if given.
    pub fn start(
        ctx: &Context,
        layer: &mut RecordLayer,
        resume: Option<Session>,
        rng: SeededRng,
        out: &mut Vec<Buf>,
    ) -> Result<Self, Error> {
        let config = ctx.config;
        let ems_mode = config.extended_master_secret();

        // Sessions without the extended master secret are only resumed when
        // the configuration tolerates that.
        let resume = resume.filter(|s| {
            s.is_resumable()
                && (s.extended_master_secret() || ems_mode < ExtendedMasterSecretMode::Enabled)
        });

        let suites = config.cipher_suites();
        let mut extensions = Vec::new();

        if CipherSuite::contains_ecc_based(suites) {
            extensions.push(Extension::SupportedGroups(config.groups().to_vec()));
            extensions.push(Extension::EcPointFormats(vec![
                Extension::UNCOMPRESSED_POINT_FORMAT,
            ]));
        }
        if CipherSuite::contains_certificate_based(suites) {
            extensions.push(Extension::SignatureAlgorithms(
                config.signature_algorithms().to_vec(),
            ));
        }
        if ems_mode != ExtendedMasterSecretMode::None {
            extensions.push(Extension::ExtendedMasterSecret);
        }
        if let Some(limit) = config.record_size_limit() {
            extensions.push(Extension::RecordSizeLimit(limit));
        }

        let cid_code_point = if config.use_deprecated_cid() {
            CidCodePoint::Deprecated
        } else {
            CidCodePoint::Standard
        };
        let offered_cid = config
            .connection_id_length()
            .map(|len| ConnectionId::random_for_node(len, config.connection_id_node_id()));
        if let Some(cid) = offered_cid {
            extensions.push(Extension::ConnectionId(cid_code_point, cid));
        }

        let session_id = resume.as_ref().map(|s| *s.id()).unwrap_or_else(SessionId::empty);
        let hello = ClientHello::new(Random::new(), session_id, Cookie::empty(), suites, extensions);

        let mut engine = Engine::new(true, ctx.config, rng);
        engine.client_random = Some(hello.random);

        let mut client = ClientHandshake {
            engine,
            established: None,
            step: Step::ServerHello,
            hello,
            resume,
            abbreviated: false,
            offered_cid,
            cid_code_point,
            session_id: SessionId::empty(),
            server_chain: None,
            server_params: None,
            signature_algorithm: None,
            group: None,
            psk_identity: None,
            certificate_request: None,
        };

        debug!(
            "Start handshake with {}{}",
            ctx.peer,
            if client.resume.is_some() { " (resumption)" } else { "" }
        );

        client.send_client_hello(ctx, layer, 1, out)?;
        Ok(client)
    }

    fn send_client_hello(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        flight: u8,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        let mut body = Buf::new();
        self.hello.serialize(&mut body);

        self.engine.begin_flight(flight, ctx.now);
        self.engine.push_message(0, MessageType::ClientHello, body);
        self.engine.send_flight(ctx, layer, true, false, out)?;
        self.engine.state = if flight == 1 {
            HandshakeState::WaitFlight
        } else {
            HandshakeState::AwaitVerify
        };
        Ok(())
    }

    pub(super) fn process(&mut self, ctx: &Context, layer: &mut RecordLayer, out: &mut Vec<Buf>) -> Result<(), Error> {
        while let Some(message) = self.engine.next_message() {
            self.handle_message(ctx, layer, message, out)?;
            if self.engine.state.is_terminal() {
                break;
            }
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        message: Message,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        trace!("Client received {:?} seq {}", message.msg_type, message.message_seq);

        // Only Finished is protected.
        let expected_epoch = if message.msg_type == MessageType::Finished { 1 } else { 0 };

        match (self.step, message.msg_type) {
            _ if message.epoch != expected_epoch => unexpected(&mut self.engine, self.step, message),
            (Step::ServerHello, MessageType::HelloVerifyRequest) => {
                self.on_hello_verify_request(ctx, layer, message, out)
            }
            (Step::ServerHello, MessageType::ServerHello) => self.on_server_hello(ctx, layer, message),
            (Step::Certificate, MessageType::Certificate) => self.on_certificate(ctx, message),
            (Step::ServerKeyExchange, MessageType::ServerKeyExchange) => {
                self.on_server_key_exchange(ctx, message)
            }
            (Step::ServerHelloDone, MessageType::ServerKeyExchange)
                if self.engine.suite()?.key_exchange() == KeyExchange::Psk
                    && self.server_params.is_none() =>
            {
                // Plain PSK: the key exchange message only carries an optional hint.
                self.on_server_key_exchange(ctx, message)
            }
            (Step::ServerHelloDone, MessageType::CertificateRequest)
                if self.engine.suite()?.key_exchange() == KeyExchange::EcdheEcdsa
                    && self.certificate_request.is_none() =>
            {
                self.on_certificate_request(message)
            }
            (Step::ServerHelloDone, MessageType::ServerHelloDone) => {
                self.on_server_hello_done(ctx, layer, message, out)
            }
            (Step::Finished, MessageType::Finished) => self.on_finished(ctx, layer, message, out),
            (step, _) => unexpected(&mut self.engine, step, message),
        }
    }

    fn on_hello_verify_request(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        message: Message,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        let Some(hvr) = parse_exact(&message.body, HelloVerifyRequest::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        if !hvr.has_acceptable_version() {
            return Err(Error::HandshakeAborted(AlertDescription::ProtocolVersion));
        }
        self.engine.peer_flight_started(&message);
        debug!("HelloVerifyRequest from {}, cookie of {} bytes", ctx.peer, hvr.cookie.len());

        // Neither the first ClientHello nor the HelloVerifyRequest are part
        // of the handshake hash.
        self.engine.reset_transcript();
        self.hello.cookie = hvr.cookie;
        self.send_client_hello(ctx, layer, 3, out)
    }

    fn on_server_hello(&mut self, ctx: &Context, layer: &mut RecordLayer, message: Message) -> Result<(), Error> {
        let Some(hello) = parse_exact(&message.body, ServerHello::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };

        if hello.server_version != ProtocolVersion::DTLS1_2 {
            return Err(Error::HandshakeAborted(AlertDescription::ProtocolVersion));
        }
        let suite = hello.cipher_suite;
        if !ctx.config.cipher_suites().contains(&suite) {
            debug!("Server selected {} which we did not offer", suite);
            return Err(Error::HandshakeAborted(AlertDescription::IllegalParameter));
        }

        self.engine.peer_flight_started(&message);
        self.engine.add_to_transcript(&message);
        self.engine.suite = Some(suite);
        self.engine.server_random = Some(hello.random);

        let ems_mode = ctx.config.extended_master_secret();
        let ems = hello.extensions.has_extended_master_secret();
        if ems && ems_mode == ExtendedMasterSecretMode::None {
            return Err(Error::HandshakeAborted(AlertDescription::UnsupportedExtension));
        }
        if !ems && ems_mode == ExtendedMasterSecretMode::Required {
            debug!("Server does not support the extended master secret");
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        }
        self.engine.extended_master_secret = ems;
        self.engine.peer_record_size_limit = hello.extensions.record_size_limit();

        match (hello.extensions.connection_id(), self.offered_cid) {
            (Some((code_point, cid)), Some(ours)) => {
                if code_point != self.cid_code_point {
                    return Err(Error::HandshakeAborted(AlertDescription::IllegalParameter));
                }
                layer.set_connection_ids(Some(ours), Some(cid), code_point);
            }
            (Some(_), None) => {
                return Err(Error::HandshakeAborted(AlertDescription::UnsupportedExtension));
            }
            (None, _) => {}
        }

        self.session_id = hello.session_id;

        let resumed = self
            .resume
            .as_ref()
            .filter(|s| !hello.session_id.is_empty() && *s.id() == hello.session_id);

        if let Some(session) = resumed {
            if session.cipher_suite() != suite {
                return Err(Error::HandshakeAborted(AlertDescription::IllegalParameter));
            }
            if session.extended_master_secret() != ems {
                return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
            }
            debug!("Resuming session {}", session.id());
            self.abbreviated = true;
            self.engine.master_secret = Some(session.master_secret().clone());
            self.engine.install_keys(layer)?;
            self.step = Step::Finished;
        } else {
            self.step = match suite.key_exchange() {
                KeyExchange::EcdheEcdsa => Step::Certificate,
                KeyExchange::EcdhePsk => Step::ServerKeyExchange,
                _ => Step::ServerHelloDone,
            };
        }

        self.engine.state = HandshakeState::WaitFlight;
        Ok(())
    }

    fn on_certificate(&mut self, ctx: &Context, message: Message) -> Result<(), Error> {
        let Some(certificate) = parse_exact(&message.body, Certificate::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        self.engine.add_to_transcript(&message);

        if certificate.chain.is_empty() {
            return Err(Error::HandshakeAborted(AlertDescription::BadCertificate));
        }
        let Some(verifier) = ctx.config.certificate_verifier() else {
            return Err(Error::HandshakeAborted(AlertDescription::BadCertificate));
        };
        verifier
            .verify_chain(ctx.peer, &certificate.chain)
            .map_err(Error::HandshakeAborted)?;

        self.server_chain = Some(certificate.chain);
        self.step = Step::ServerKeyExchange;
        Ok(())
    }

    fn on_server_key_exchange(&mut self, ctx: &Context, message: Message) -> Result<(), Error> {
        let key_exchange = self.engine.suite()?.key_exchange();
        let Some(ske) = parse_exact(&message.body, |i| ServerKeyExchange::parse(i, key_exchange))
        else {
            self.engine.discard(&message);
            return Ok(());
        };
        self.engine.add_to_transcript(&message);

        if let Some(params) = ske.params() {
            if !ctx.config.groups().contains(&params.group) {
                debug!("Server chose group {:?} which we did not offer", params.group);
                return Err(Error::HandshakeAborted(AlertDescription::IllegalParameter));
            }
            self.group = Some(params.group);
        }

        if let ServerKeyExchange::EcdheEcdsa { params, signed } = &ske {
            if !ctx.config.signature_algorithms().contains(&signed.algorithm) {
                return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
            }
            let (Some(chain), Some(verifier)) = (&self.server_chain, ctx.config.certificate_verifier())
            else {
                return Err(Error::HandshakeAborted(AlertDescription::BadCertificate));
            };
            let (client_random, server_random) = self.randoms()?;
            let data = signed_params(&client_random, &server_random, params);
            if !verifier.verify_signature(chain, signed.algorithm, &data, &signed.signature) {
                debug!("ServerKeyExchange signature does not verify");
                return Err(Error::HandshakeAborted(AlertDescription::DecryptError));
            }
            self.signature_algorithm = Some(signed.algorithm);
        }

        self.server_params = Some(ske);
        self.step = Step::ServerHelloDone;
        Ok(())
    }

    fn on_certificate_request(&mut self, message: Message) -> Result<(), Error> {
        let Some(request) = parse_exact(&message.body, CertificateRequest::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        self.engine.add_to_transcript(&message);
        debug!("Server requests a certificate");
        self.certificate_request = Some(request);
        Ok(())
    }

    /// Chain and signature algorithm answering the server's CertificateRequest.
    /// An empty chain when we have nothing it accepts.
    fn client_certificate(&self, ctx: &Context) -> (Vec<Vec<u8>>, Option<SignatureAndHashAlgorithm>) {
        let (Some(request), Some(provider)) = (&self.certificate_request, ctx.config.certificate_identity())
        else {
            return (Vec::new(), None);
        };
        if !request.accepts_ecdsa() {
            return (Vec::new(), None);
        }
        let algorithm = select_signature_algorithm(
            ctx.config.signature_algorithms(),
            Some(&request.signature_algorithms),
            &provider.signature_algorithms(),
        );
        let chain = provider
            .certificate_chain(CertificateType::X509)
            .filter(|c| !c.is_empty());
        match (chain, algorithm) {
            (Some(chain), Some(algorithm)) => (chain, Some(algorithm)),
            _ => {
                debug!("No certificate for the server's request");
                (Vec::new(), None)
            }
        }
    }

    fn on_server_hello_done(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        message: Message,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        if !message.body.is_empty() {
            self.engine.discard(&message);
            return Ok(());
        }
        self.engine.add_to_transcript(&message);

        let suite = self.engine.suite()?;
        let key_exchange = suite.key_exchange();

        // Our ephemeral key and the shared secret, for the ECDHE exchanges.
        let ecdhe = match self.server_params.as_ref().and_then(|p| p.params()) {
            Some(params) => {
                let key = EphemeralKey::generate(params.group).map_err(Error::Crypto)?;
                let public = key.public_key().to_vec();
                let shared = key
                    .complete(&params.public)
                    .map_err(|_| Error::HandshakeAborted(AlertDescription::IllegalParameter))?;
                Some((public, shared))
            }
            None if key_exchange == KeyExchange::Psk => None,
            None => return Err(Error::HandshakeAborted(AlertDescription::UnexpectedMessage)),
        };

        let (cke, pre_master_secret) = match (key_exchange, ecdhe) {
            (KeyExchange::EcdheEcdsa, Some((public, shared))) => {
                (ClientKeyExchange::EcdheEcdsa { public }, shared)
            }
            (KeyExchange::Psk, None) => {
                let credentials = self.psk_credentials(ctx)?;
                let other = Zeroizing::new(vec![0u8; credentials.secret.as_bytes().len()]);
                let pms = psk_pre_master_secret(&other, credentials.secret.as_bytes());
                (ClientKeyExchange::Psk { identity: credentials.identity }, pms)
            }
            (KeyExchange::EcdhePsk, Some((public, shared))) => {
                let credentials = self.psk_credentials(ctx)?;
                let pms = psk_pre_master_secret(&shared, credentials.secret.as_bytes());
                (
                    ClientKeyExchange::EcdhePsk {
                        identity: credentials.identity,
                        public,
                    },
                    pms,
                )
            }
            _ => return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure)),
        };
        self.psk_identity = cke.identity().map(|i| i.to_vec());

        self.engine.begin_flight(5, ctx.now);

        let mut signing = None;
        if self.certificate_request.is_some() {
            let (chain, algorithm) = self.client_certificate(ctx);
            if !chain.is_empty() {
                signing = algorithm;
            }
            let mut body = Buf::new();
            Certificate { chain }.serialize(&mut body);
            self.engine.push_message(0, MessageType::Certificate, body);
        }

        let mut body = Buf::new();
        cke.serialize(&mut body);
        self.engine.push_message(0, MessageType::ClientKeyExchange, body);

        // With the extended master secret the session hash ends here.
        self.engine.derive_master_secret(&pre_master_secret)?;
        self.engine.install_keys(layer)?;

        if let (Some(algorithm), Some(provider)) = (signing, ctx.config.certificate_identity()) {
            let signature = provider
                .sign(algorithm, self.engine.transcript())
                .map_err(Error::Crypto)?;
            let mut body = Buf::new();
            CertificateVerify {
                signed: DigitallySigned { algorithm, signature },
            }
            .serialize(&mut body);
            self.engine.push_message(0, MessageType::CertificateVerify, body);
        }

        self.engine.push_change_cipher_spec(0);
        layer.activate_write()?;

        let verify_data = self.engine.verify_data(true)?;
        let mut body = Buf::new();
        Finished::new(verify_data).serialize(&mut body);
        self.engine.push_message(1, MessageType::Finished, body);

        self.engine.send_flight(ctx, layer, true, suite.is_ecc_based(), out)?;
        self.engine.state = HandshakeState::WaitFlight;
        self.step = Step::Finished;
        Ok(())
    }

    fn on_finished(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        message: Message,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        let Some(finished) = parse_exact(&message.body, Finished::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        self.engine.peer_flight_started(&message);
        self.engine.stop_flight_timer();

        self.engine.check_peer_finished(&finished.verify_data)?;
        self.engine.add_to_transcript(&message);

        if self.abbreviated {
            // Our ChangeCipherSpec and Finished close the abbreviated handshake.
            self.engine.begin_flight(3, ctx.now);
            self.engine.push_change_cipher_spec(0);
            layer.activate_write()?;
            let verify_data = self.engine.verify_data(true)?;
            let mut body = Buf::new();
            Finished::new(verify_data).serialize(&mut body);
            self.engine.push_message(1, MessageType::Finished, body);
            self.engine.send_flight(ctx, layer, false, false, out)?;
        }

        self.complete(ctx)
    }

    fn complete(&mut self, ctx: &Context) -> Result<(), Error> {
        let session = match (&self.resume, self.abbreviated) {
            (Some(resumed), true) => resumed.resumed(self.engine.peer_record_size_limit),
            _ => {
                let Some(master_secret) = self.engine.master_secret.clone() else {
                    return Err(Error::Crypto("No master secret".to_string()));
                };
                let peer_identity = match (&self.server_chain, &self.psk_identity) {
                    (Some(chain), _) => PeerIdentity::Certificate(chain.clone()),
                    (None, Some(identity)) => PeerIdentity::Psk(identity.clone()),
                    (None, None) => PeerIdentity::Anonymous,
                };
                Session::new(
                    self.session_id,
                    self.engine.suite()?,
                    self.signature_algorithm,
                    self.group,
                    peer_identity,
                    master_secret,
                    self.engine.extended_master_secret,
                    self.engine.peer_record_size_limit,
                    ctx.now,
                )
            }
        };

        info!(
            "Handshake with {} complete: {}{}",
            ctx.peer,
            session.cipher_suite(),
            if self.abbreviated { " (resumed)" } else { "" }
        );

        self.step = Step::Done;
        self.engine.state = HandshakeState::Complete;
        self.established = Some(Established {
            session,
            resumed: self.abbreviated,
        });
        Ok(())
    }

    fn psk_credentials(&self, ctx: &Context) -> Result<crate::credentials::PskCredentials, Error> {
        let hint = self.server_params.as_ref().and_then(|p| p.hint());
        ctx.config
            .psk_store()
            .and_then(|store| store.identity(ctx.peer, hint))
            .ok_or_else(|| {
                debug!("No PSK identity for {}", ctx.peer);
                Error::HandshakeAborted(AlertDescription::HandshakeFailure)
            })
    }

    fn randoms(&self) -> Result<([u8; 32], [u8; 32]), Error> {
        match (&self.engine.client_random, &self.engine.server_random) {
            (Some(c), Some(s)) => Ok((c.to_bytes(), s.to_bytes())),
            _ => Err(Error::Crypto("Randoms not exchanged".to_string())),
        }
    }
}

/// RFC 4279 §2 / RFC 5489 §2: `uint16 len ‖ other ‖ uint16 len ‖ psk`.
pub(super) fn psk_pre_master_secret(other: &[u8], psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(4 + other.len() + psk.len()));
    out.extend_from_slice(&(other.len() as u16).to_be_bytes());
    out.extend_from_slice(other);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}

impl fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("engine", &self.engine)
            .field("step", &self.step)
            .field("abbreviated", &self.abbreviated)
            .finish_non_exhaustive()
    }
}
