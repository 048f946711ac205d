//! Server side of the DTLS 1.2 handshake.
//!
//! The cookie exchange happens before any state exists, see the connector.
//! A `ServerHandshake` is created from a ClientHello that passed it.

use std::fmt;

use super::client::psk_pre_master_secret;
use super::engine::{Engine, Message};
use super::{unexpected, Context, Established, HandshakeState};
use crate::buffer::Buf;
use crate::config::{ClientAuthentication, ExtendedMasterSecretMode};
use crate::credentials::CertificateType;
use crate::crypto::EphemeralKey;
use crate::error::Error;
use crate::message::{
    signed_params, AlertDescription, Certificate, CertificateRequest, CertificateVerify, CidCodePoint,
    ClientHello, ClientKeyExchange, ConnectionId, DigitallySigned, EcParameters, Extension, ExtensionsExt, Finished, MessageType,
    Random, ServerHello, ServerKeyExchange, SessionId,
};
use crate::policy::{select_cipher_suite, select_group, select_signature_algorithm, ServerCredentials};
use crate::record_layer::RecordLayer;
use crate::registry::{CipherSuite, KeyExchange, NamedGroup, SignatureAndHashAlgorithm};
use crate::rng::SeededRng;
use crate::session::{PeerIdentity, Session};
use crate::types::{ProtocolVersion, SignatureAlgorithm};
use crate::util::parse_exact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// A CertificateRequest went out, the client's Certificate comes first.
    Certificate,
    ClientKeyExchange,
    CertificateVerify,
    Finished,
    Done,
}

pub(crate) struct ServerHandshake {
    pub(super) engine: Engine,
    pub(super) established: Option<Established>,

    step: Step,
    random: Random,
    session_id: SessionId,
    resumed: Option<Session>,

    group: Option<NamedGroup>,
    signature_algorithm: Option<SignatureAndHashAlgorithm>,
    ephemeral: Option<EphemeralKey>,
    psk_identity: Option<Vec<u8>>,
    certificate_requested: bool,
    client_chain: Option<Vec<Vec<u8>>>,
}

/// What the server agreed to in its ServerHello.
struct Negotiated {
    suite: CipherSuite,
    extensions: Vec<Extension>,
}

impl ServerHandshake {
    /// Answer `hello`, a ClientHello with message_seq `message_seq` and body
    /// `body`. `resumable` is the session the client asked for, if it may be
    /// resumed.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        ctx: &Context,
        layer: &mut RecordLayer,
        hello: &ClientHello,
        message_seq: u16,
        body: &[u8],
        resumable: Option<Session>,
        rng: SeededRng,
        out: &mut Vec<Buf>,
    ) -> Result<Self, Error> {
        if hello.client_version != ProtocolVersion::DTLS1_2 {
            debug!("Client {} offers {}", ctx.peer, hello.client_version);
            return Err(Error::HandshakeAborted(AlertDescription::ProtocolVersion));
        }

        let mut engine = Engine::new(false, ctx.config, rng);
        engine.start_with(&Message {
            msg_type: MessageType::ClientHello,
            message_seq,
            epoch: 0,
            body: Buf::from_slice(body),
        });
        engine.client_random = Some(hello.random);

        let mut server = ServerHandshake {
            engine,
            established: None,
            step: Step::ClientKeyExchange,
            random: Random::new(),
            session_id: SessionId::empty(),
            resumed: None,
            group: None,
            signature_algorithm: None,
            ephemeral: None,
            psk_identity: None,
            certificate_requested: false,
            client_chain: None,
        };
        server.engine.server_random = Some(server.random);

        let ems_mode = ctx.config.extended_master_secret();
        let client_ems = hello.extensions.has_extended_master_secret();
        if !client_ems && ems_mode == ExtendedMasterSecretMode::Required {
            debug!("Client {} lacks the extended master secret", ctx.peer);
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        }
        server.engine.extended_master_secret = client_ems && ems_mode != ExtendedMasterSecretMode::None;
        server.engine.peer_record_size_limit = hello.extensions.record_size_limit();

        let resumable = match resumable {
            Some(session) => server.check_resumption(ctx, hello, session)?,
            None => None,
        };

        match resumable {
            Some(session) => server.start_abbreviated(ctx, layer, hello, session, out)?,
            None => server.start_full(ctx, layer, hello, out)?,
        }

        Ok(server)
    }

    /// Whether `session` can be resumed with this hello. RFC 7627 §5.3.
    fn check_resumption(
        &self,
        ctx: &Context,
        hello: &ClientHello,
        session: Session,
    ) -> Result<Option<Session>, Error> {
        let suite = session.cipher_suite();
        if !hello.cipher_suites.contains(&suite.as_u16()) || !ctx.config.cipher_suites().contains(&suite) {
            debug!("Session {} suite {} not offered, full handshake", session.id(), suite);
            return Ok(None);
        }
        let client_ems = hello.extensions.has_extended_master_secret();
        if session.extended_master_secret() && !client_ems {
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        }
        let ems_mode = ctx.config.extended_master_secret();
        if !session.extended_master_secret() && (client_ems || ems_mode >= ExtendedMasterSecretMode::Enabled) {
            debug!("Session {} without extended master secret, full handshake", session.id());
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Extensions both handshakes answer the same way.
    fn common_extensions(&self, ctx: &Context, layer: &mut RecordLayer, hello: &ClientHello) -> Vec<Extension> {
        let config = ctx.config;
        let mut extensions = Vec::new();

        if self.engine.extended_master_secret {
            extensions.push(Extension::ExtendedMasterSecret);
        }

        if hello.extensions.record_size_limit().is_some() {
            if let Some(limit) = config.record_size_limit() {
                extensions.push(Extension::RecordSizeLimit(limit));
            }
        }

        if let (Some((code_point, theirs)), Some(len)) =
            (hello.extensions.connection_id(), config.connection_id_length())
        {
            if code_point == CidCodePoint::Standard || config.use_deprecated_cid() {
                let ours = ConnectionId::random_for_node(len, config.connection_id_node_id());
                layer.set_connection_ids(Some(ours), Some(theirs), code_point);
                extensions.push(Extension::ConnectionId(code_point, ours));
            }
        }

        extensions
    }

    fn start_abbreviated(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        hello: &ClientHello,
        session: Session,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        debug!("Resuming session {} with {}", session.id(), ctx.peer);

        let suite = session.cipher_suite();
        self.engine.suite = Some(suite);
        self.session_id = *session.id();
        self.engine.master_secret = Some(session.master_secret().clone());
        self.engine.extended_master_secret = session.extended_master_secret();

        let negotiated = Negotiated {
            suite,
            extensions: self.common_extensions(ctx, layer, hello),
        };

        self.engine.begin_flight(2, ctx.now);
        self.push_server_hello(&negotiated);

        self.engine.install_keys(layer)?;
        self.engine.push_change_cipher_spec(0);
        layer.activate_write()?;

        let verify_data = self.engine.verify_data(false)?;
        let mut body = Buf::new();
        Finished::new(verify_data).serialize(&mut body);
        self.engine.push_message(1, MessageType::Finished, body);

        self.engine.send_flight(ctx, layer, true, false, out)?;
        self.engine.state = HandshakeState::WaitFlight;
        self.step = Step::Finished;
        self.resumed = Some(session);
        Ok(())
    }

    fn start_full(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        hello: &ClientHello,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        let config = ctx.config;
        let provider = config.certificate_identity();

        let group = select_group(config.groups(), hello.extensions.supported_groups());
        let signature_algorithm = provider.and_then(|p| {
            select_signature_algorithm(
                config.signature_algorithms(),
                hello.extensions.signature_algorithms(),
                &p.signature_algorithms(),
            )
        });
        let credentials = ServerCredentials {
            has_psk_store: config.psk_store().is_some(),
            psk_supports_ecdhe: config
                .psk_store()
                .map(|s| s.has_ecdhe_psk_supported())
                .unwrap_or(false),
            has_certificate: provider.is_some() && signature_algorithm.is_some(),
        };

        let Some(suite) = select_cipher_suite(
            config.cipher_suites(),
            &hello.offered_suites(),
            &credentials,
            group,
        ) else {
            debug!("No common cipher suite with {}", ctx.peer);
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        };
        debug!("Selected {} for {}", suite, ctx.peer);

        self.engine.suite = Some(suite);
        if suite.is_ecc_based() {
            self.group = group;
        }
        if suite.key_exchange() == KeyExchange::EcdheEcdsa {
            self.signature_algorithm = signature_algorithm;
        }
        if config.use_server_session_id() {
            self.session_id = SessionId::random(32);
        }

        let mut extensions = self.common_extensions(ctx, layer, hello);
        if suite.is_ecc_based() && hello.extensions.ec_point_formats().is_some() {
            extensions.push(Extension::EcPointFormats(vec![
                Extension::UNCOMPRESSED_POINT_FORMAT,
            ]));
        }
        let negotiated = Negotiated { suite, extensions };

        self.engine.begin_flight(4, ctx.now);
        self.push_server_hello(&negotiated);

        if suite.requires_server_certificate_message() {
            let chain = provider
                .and_then(|p| p.certificate_chain(CertificateType::X509))
                .filter(|c| !c.is_empty())
                .ok_or(Error::HandshakeAborted(AlertDescription::HandshakeFailure))?;
            let mut body = Buf::new();
            Certificate { chain }.serialize(&mut body);
            self.engine.push_message(0, MessageType::Certificate, body);
        }

        if let Some(ske) = self.server_key_exchange(ctx, suite)? {
            let mut body = Buf::new();
            ske.serialize(&mut body);
            self.engine.push_message(0, MessageType::ServerKeyExchange, body);
        }

        if suite.key_exchange() == KeyExchange::EcdheEcdsa && config.client_authentication().requests_certificate() {
            let algorithms = config
                .signature_algorithms()
                .iter()
                .copied()
                .filter(|a| a.signature == SignatureAlgorithm::ECDSA)
                .collect();
            let mut body = Buf::new();
            CertificateRequest::ecdsa(algorithms).serialize(&mut body);
            self.engine.push_message(0, MessageType::CertificateRequest, body);
            self.certificate_requested = true;
        }

        self.engine.push_message(0, MessageType::ServerHelloDone, Buf::new());
        self.engine.send_flight(ctx, layer, true, suite.is_ecc_based(), out)?;
        self.engine.state = HandshakeState::WaitFlight;
        self.step = if self.certificate_requested {
            Step::Certificate
        } else {
            Step::ClientKeyExchange
        };
        Ok(())
    }

    fn push_server_hello(&mut self, negotiated: &Negotiated) {
        let hello = ServerHello::new(
            self.random,
            self.session_id,
            negotiated.suite,
            negotiated.extensions.clone(),
        );
        let mut body = Buf::new();
        hello.serialize(&mut body);
        self.engine.push_message(0, MessageType::ServerHello, body);
    }

    /// Plain PSK sends no ServerKeyExchange, we have no hint to give.
    fn server_key_exchange(&mut self, ctx: &Context, suite: CipherSuite) -> Result<Option<ServerKeyExchange>, Error> {
        let key_exchange = suite.key_exchange();
        if key_exchange == KeyExchange::Psk {
            return Ok(None);
        }

        let Some(group) = self.group else {
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        };
        let key = EphemeralKey::generate(group).map_err(Error::Crypto)?;
        let params = EcParameters {
            group,
            public: key.public_key().to_vec(),
        };
        self.ephemeral = Some(key);

        let ske = match key_exchange {
            KeyExchange::EcdhePsk => ServerKeyExchange::EcdhePsk {
                hint: Vec::new(),
                params,
            },
            KeyExchange::EcdheEcdsa => {
                let (Some(algorithm), Some(provider)) =
                    (self.signature_algorithm, ctx.config.certificate_identity())
                else {
                    return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
                };
                let (Some(client_random), Some(server_random)) =
                    (&self.engine.client_random, &self.engine.server_random)
                else {
                    return Err(Error::Crypto("Randoms not exchanged".to_string()));
                };
                let data = signed_params(&client_random.to_bytes(), &server_random.to_bytes(), &params);
                let signature = provider.sign(algorithm, &data).map_err(Error::Crypto)?;
                ServerKeyExchange::EcdheEcdsa {
                    params,
                    signed: DigitallySigned {
                        algorithm,
                        signature,
                    },
                }
            }
            _ => return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure)),
        };
        Ok(Some(ske))
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
        trace!("Server received {:?} seq {}", message.msg_type, message.message_seq);

        let expected_epoch = if message.msg_type == MessageType::Finished { 1 } else { 0 };

        match (self.step, message.msg_type) {
            _ if message.epoch != expected_epoch => unexpected(&mut self.engine, self.step, message),
            (Step::Certificate, MessageType::Certificate) => self.on_certificate(ctx, message),
            // Clients with nothing to offer still answer with an empty chain,
            // a missing Certificate is only tolerated when it is optional.
            (Step::Certificate, MessageType::ClientKeyExchange)
                if ctx.config.client_authentication() == ClientAuthentication::Wanted =>
            {
                self.on_client_key_exchange(ctx, layer, message)
            }
            (Step::ClientKeyExchange, MessageType::ClientKeyExchange) => {
                self.on_client_key_exchange(ctx, layer, message)
            }
            (Step::CertificateVerify, MessageType::CertificateVerify) => {
                self.on_certificate_verify(ctx, message)
            }
            (Step::Finished, MessageType::Finished) => self.on_finished(ctx, layer, message, out),
            (step, _) => unexpected(&mut self.engine, step, message),
        }
    }

    /// The client's answer to our CertificateRequest. An empty chain declines it.
    fn on_certificate(&mut self, ctx: &Context, message: Message) -> Result<(), Error> {
        let Some(certificate) = parse_exact(&message.body, Certificate::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        self.engine.peer_flight_started(&message);
        self.engine.add_to_transcript(&message);
        self.step = Step::ClientKeyExchange;

        if certificate.chain.is_empty() {
            if ctx.config.client_authentication() == ClientAuthentication::Needed {
                debug!("Client {} declined to authenticate", ctx.peer);
                return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
            }
            return Ok(());
        }

        let Some(verifier) = ctx.config.certificate_verifier() else {
            return Err(Error::HandshakeAborted(AlertDescription::BadCertificate));
        };
        verifier
            .verify_chain(ctx.peer, &certificate.chain)
            .map_err(Error::HandshakeAborted)?;
        self.client_chain = Some(certificate.chain);
        Ok(())
    }

    fn on_client_key_exchange(&mut self, ctx: &Context, layer: &mut RecordLayer, message: Message) -> Result<(), Error> {
        let key_exchange = self.engine.suite()?.key_exchange();
        let Some(cke) = parse_exact(&message.body, |i| ClientKeyExchange::parse(i, key_exchange))
        else {
            self.engine.discard(&message);
            return Ok(());
        };
        // A Certificate message already opened the client's flight.
        if self.step == Step::Certificate || !self.certificate_requested {
            self.engine.peer_flight_started(&message);
        }
        self.engine.add_to_transcript(&message);

        let psk = match cke.identity() {
            Some(identity) => {
                let secret = ctx
                    .config
                    .psk_store()
                    .and_then(|store| store.secret(identity))
                    .ok_or_else(|| {
                        debug!(
                            "Unknown PSK identity {:?} from {}",
                            String::from_utf8_lossy(identity),
                            ctx.peer
                        );
                        Error::HandshakeAborted(AlertDescription::UnknownPskIdentity)
                    })?;
                self.psk_identity = Some(identity.to_vec());
                Some(secret)
            }
            None => None,
        };

        let shared = match cke.public() {
            Some(public) => {
                let Some(key) = self.ephemeral.take() else {
                    return Err(Error::HandshakeAborted(AlertDescription::UnexpectedMessage));
                };
                let shared = key
                    .complete(public)
                    .map_err(|_| Error::HandshakeAborted(AlertDescription::IllegalParameter))?;
                Some(shared)
            }
            None => None,
        };

        let pre_master_secret = match (psk, shared) {
            (Some(psk), Some(shared)) => psk_pre_master_secret(&shared, psk.as_bytes()),
            (Some(psk), None) => {
                let zeros = vec![0u8; psk.as_bytes().len()];
                psk_pre_master_secret(&zeros, psk.as_bytes())
            }
            (None, Some(shared)) => shared,
            (None, None) => return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure)),
        };

        self.engine.derive_master_secret(&pre_master_secret)?;
        self.engine.install_keys(layer)?;
        self.step = if self.client_chain.is_some() {
            Step::CertificateVerify
        } else {
            Step::Finished
        };
        Ok(())
    }

    fn on_certificate_verify(&mut self, ctx: &Context, message: Message) -> Result<(), Error> {
        let Some(cv) = parse_exact(&message.body, CertificateVerify::parse) else {
            self.engine.discard(&message);
            return Ok(());
        };
        let algorithm = cv.signed.algorithm;
        if !ctx.config.signature_algorithms().contains(&algorithm) {
            debug!("Client {} signed with {} which we did not request", ctx.peer, algorithm);
            return Err(Error::HandshakeAborted(AlertDescription::HandshakeFailure));
        }
        let (Some(chain), Some(verifier)) = (&self.client_chain, ctx.config.certificate_verifier()) else {
            return Err(Error::HandshakeAborted(AlertDescription::UnexpectedMessage));
        };
        if !verifier.verify_signature(chain, algorithm, self.engine.transcript(), &cv.signed.signature) {
            debug!("CertificateVerify of {} does not verify", ctx.peer);
            return Err(Error::HandshakeAborted(AlertDescription::DecryptError));
        }

        self.engine.add_to_transcript(&message);
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
        if self.resumed.is_some() {
            self.engine.peer_flight_started(&message);
        }
        self.engine.stop_flight_timer();

        self.engine.check_peer_finished(&finished.verify_data)?;
        self.engine.add_to_transcript(&message);

        if self.resumed.is_none() {
            self.engine.begin_flight(6, ctx.now);
            self.engine.push_change_cipher_spec(0);
            layer.activate_write()?;
            let verify_data = self.engine.verify_data(false)?;
            let mut body = Buf::new();
            Finished::new(verify_data).serialize(&mut body);
            self.engine.push_message(1, MessageType::Finished, body);
            self.engine.send_flight(ctx, layer, false, false, out)?;
        }

        self.complete(ctx)
    }

    fn complete(&mut self, ctx: &Context) -> Result<(), Error> {
        let peer_record_size_limit = self.engine.peer_record_size_limit;
        let (session, resumed) = match &self.resumed {
            Some(session) => (session.resumed(peer_record_size_limit), true),
            None => {
                let Some(master_secret) = self.engine.master_secret.clone() else {
                    return Err(Error::Crypto("No master secret".to_string()));
                };
                let peer_identity = match (&self.client_chain, &self.psk_identity) {
                    (Some(chain), _) => PeerIdentity::Certificate(chain.clone()),
                    (None, Some(identity)) => PeerIdentity::Psk(identity.clone()),
                    (None, None) => PeerIdentity::Anonymous,
                };
                let session = Session::new(
                    self.session_id,
                    self.engine.suite()?,
                    self.signature_algorithm,
                    self.group,
                    peer_identity,
                    master_secret,
                    self.engine.extended_master_secret,
                    peer_record_size_limit,
                    ctx.now,
                );
                (session, false)
            }
        };

        info!(
            "Handshake with {} complete: {}{}",
            ctx.peer,
            session.cipher_suite(),
            if resumed { " (resumed)" } else { "" }
        );

        self.step = Step::Done;
        self.engine.state = HandshakeState::Complete;
        self.established = Some(Established { session, resumed });
        Ok(())
    }
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("engine", &self.engine)
            .field("step", &self.step)
            .field("session_id", &self.session_id)
            .field("resumed", &self.resumed.is_some())
            .finish_non_exhaustive()
    }
}
