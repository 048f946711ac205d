//! Machinery shared by the client and server handshakes: message sequence
//! numbers, fragment reassembly, transcript, flights and key derivation.

use std::collections::BTreeMap;
use std::time::Instant;

use super::{Context, HandshakeState};
use crate::buffer::Buf;
use crate::config::Config;
use crate::crypto::{self, Hash, RecordCipher};
use crate::error::Error;
use crate::flight::{Flight, PackLimits};
use crate::message::{serialize_message, AlertDescription, Fragment, MessageType, Random};
use crate::record_layer::RecordLayer;
use crate::registry::CipherSuite;
use crate::rng::SeededRng;
use crate::session::MasterSecret;
use crate::timer::RetransmissionTimer;

/// Handshake messages further ahead than this are not buffered.
const MAX_MESSAGES_AHEAD: u16 = 16;

/// One reassembled inbound handshake message.
#[derive(Debug)]
pub(crate) struct Message {
    pub msg_type: MessageType,
    pub message_seq: u16,
    pub epoch: u16,
    pub body: Buf,
}

/// What an inbound fragment turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// Part of a message we still wait for.
    Buffered,
    /// Part of a message already processed, the peer is retransmitting.
    Duplicate { starts_flight: bool },
    /// Too far ahead, inconsistent or oversized.
    Ignored,
}

#[derive(Debug)]
struct Partial {
    msg_type: MessageType,
    epoch: u16,
    length: u32,
    body: Vec<u8>,
    /// Sorted, non-overlapping received byte ranges.
    ranges: Vec<(u32, u32)>,
}

impl Partial {
    fn add(&mut self, offset: u32, data: &[u8]) {
        let end = offset + data.len() as u32;
        self.body[offset as usize..end as usize].copy_from_slice(data);

        self.ranges.push((offset, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for (s, e) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    fn is_complete(&self) -> bool {
        self.length == 0 || self.ranges.first() == Some(&(0, self.length))
    }
}

pub(crate) struct Engine {
    is_client: bool,
    pub state: HandshakeState,

    /// message_seq of the next message we send.
    next_send_seq: u16,
    /// message_seq of the next message we process.
    next_recv_seq: u16,
    /// message_seq of the first message of the peer's last complete flight.
    peer_flight_start: u16,

    incoming: BTreeMap<u16, Partial>,

    /// All handshake messages so far, unfragmented, in order.
    transcript: Buf,

    flight: Option<Flight>,
    flight_deadline: Option<Instant>,

    /// Largest handshake message body reassembled.
    max_message_len: u32,
    /// Stop our flight timer on the first accepted message of the peer's next flight.
    early_stop: bool,

    pub rng: SeededRng,

    pub suite: Option<CipherSuite>,
    pub client_random: Option<Random>,
    pub server_random: Option<Random>,
    pub master_secret: Option<MasterSecret>,
    pub extended_master_secret: bool,
    pub peer_record_size_limit: Option<u16>,
}

impl Engine {
    pub fn new(is_client: bool, config: &Config, rng: SeededRng) -> Self {
        Engine {
            is_client,
            state: HandshakeState::Start,
            next_send_seq: 0,
            next_recv_seq: 0,
            peer_flight_start: 0,
            incoming: BTreeMap::new(),
            transcript: Buf::new(),
            flight: None,
            flight_deadline: None,
            max_message_len: u32::try_from(config.max_fragmented_handshake_message_length()).unwrap_or(u32::MAX),
            early_stop: config.use_early_stop_retransmission(),
            rng,
            suite: None,
            client_random: None,
            server_random: None,
            master_secret: None,
            extended_master_secret: false,
            peer_record_size_limit: None,
        }
    }

    /// Take `first` as the peer's opening message (server side). Our replies
    /// continue its message_seq.
    pub fn start_with(&mut self, first: &Message) {
        self.next_recv_seq = first.message_seq + 1;
        self.next_send_seq = first.message_seq;
        self.peer_flight_start = first.message_seq;
        self.add_to_transcript(first);
    }

    /// The ClientHello and HelloVerifyRequest of a cookie exchange are not
    /// part of the transcript.
    pub fn reset_transcript(&mut self) {
        self.transcript.clear();
    }

    /// Handshake messages so far, as signed by a CertificateVerify.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub fn transcript_hash(&self) -> Result<Hash, Error> {
        let suite = self.suite()?;
        let mut hash = Hash::new(suite.descriptor().prf_hash)
            .ok_or_else(|| Error::Crypto(format!("No transcript hash for {}", suite)))?;
        hash.update(&self.transcript);
        Ok(hash)
    }

    pub fn suite(&self) -> Result<CipherSuite, Error> {
        self.suite
            .ok_or_else(|| Error::Crypto("No cipher suite negotiated".to_string()))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn insert_fragment(&mut self, epoch: u16, fragment: &Fragment) -> Received {
        let header = &fragment.header;
        let seq = header.message_seq;

        if seq < self.next_recv_seq {
            return Received::Duplicate {
                starts_flight: seq == self.peer_flight_start && header.fragment_offset == 0,
            };
        }
        if seq - self.next_recv_seq >= MAX_MESSAGES_AHEAD {
            return Received::Ignored;
        }
        if header.length > self.max_message_len {
            debug!("Drop {:?} of {} bytes, limit {}", header.msg_type, header.length, self.max_message_len);
            return Received::Ignored;
        }

        let partial = self.incoming.entry(seq).or_insert_with(|| Partial {
            msg_type: header.msg_type,
            epoch,
            length: header.length,
            body: vec![0; header.length as usize],
            ranges: Vec::new(),
        });

        if partial.msg_type != header.msg_type || partial.length != header.length || partial.epoch != epoch {
            trace!("Inconsistent fragment of message {}", seq);
            return Received::Ignored;
        }

        partial.add(header.fragment_offset, fragment.body);
        Received::Buffered
    }

    /// The next message in sequence, if fully received.
    pub fn next_message(&mut self) -> Option<Message> {
        let complete = self
            .incoming
            .get(&self.next_recv_seq)
            .map(|p| p.is_complete())
            .unwrap_or(false);
        if !complete {
            return None;
        }
        let seq = self.next_recv_seq;
        let partial = self.incoming.remove(&seq)?;
        self.next_recv_seq += 1;
        Some(Message {
            msg_type: partial.msg_type,
            message_seq: seq,
            epoch: partial.epoch,
            body: Buf::from(partial.body),
        })
    }

    /// Give up on a message that failed to parse. A retransmitted copy is
    /// accepted again.
    pub fn discard(&mut self, message: &Message) {
        trace!("Discard malformed {:?} seq {}", message.msg_type, message.message_seq);
        self.next_recv_seq = message.message_seq;
    }

    /// Mark `message` as the start of the peer's current flight.
    ///
    /// Only called once `message` was parsed and accepted. With early stop
    /// this ends the retransmission of our flight.
    pub fn peer_flight_started(&mut self, message: &Message) {
        self.peer_flight_start = message.message_seq;
        if self.early_stop {
            self.stop_flight_timer();
        }
    }

    pub fn add_to_transcript(&mut self, message: &Message) {
        let full = serialize_message(message.msg_type, message.message_seq, &message.body);
        self.transcript.extend_from_slice(&full);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    pub fn begin_flight(&mut self, number: u8, now: Instant) {
        debug!("Begin flight {}", number);
        self.flight = Some(Flight::new(number, now));
        self.flight_deadline = None;
    }

    /// Append a handshake message to the current flight and the transcript.
    pub fn push_message(&mut self, epoch: u16, msg_type: MessageType, body: Buf) {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;

        let full = serialize_message(msg_type, seq, &body);
        self.transcript.extend_from_slice(&full);

        if let Some(flight) = &mut self.flight {
            flight.push_handshake(epoch, msg_type, seq, body);
        }
    }

    pub fn push_change_cipher_spec(&mut self, epoch: u16) {
        if let Some(flight) = &mut self.flight {
            flight.push_change_cipher_spec(epoch);
        }
    }

    /// Transmit the current flight.
    ///
    /// A flight that expects an answer gets a retransmission timer. The last
    /// flight of a handshake is only kept to answer retransmissions.
    pub fn send_flight(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        expects_answer: bool,
        peer_does_ecc: bool,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        let Some(flight) = &mut self.flight else {
            return Ok(());
        };
        if expects_answer {
            let timer = RetransmissionTimer::new(ctx.config, peer_does_ecc, &mut self.rng);
            self.flight_deadline = Some(ctx.now + timer.rto());
            flight.set_timer(timer);
        } else {
            flight.stop_timer();
            self.flight_deadline = None;
        }

        let limits = limits(ctx.config, self.peer_record_size_limit, false);
        out.extend(flight.datagrams(layer, &limits)?);
        Ok(())
    }

    /// Retransmit the current flight without touching its timer.
    pub fn resend_flight(&mut self, config: &Config, layer: &mut RecordLayer, out: &mut Vec<Buf>) -> Result<(), Error> {
        let Some(flight) = &self.flight else {
            return Ok(());
        };
        let back_off = flight.timer().map(|t| t.is_back_off()).unwrap_or(false);
        debug!("Resend flight {}", flight.number());
        let limits = limits(config, self.peer_record_size_limit, back_off);
        out.extend(flight.datagrams(layer, &limits)?);
        Ok(())
    }

    /// Stop retransmitting the current flight, the peer's answer is arriving.
    pub fn stop_flight_timer(&mut self) {
        if let Some(flight) = &mut self.flight {
            if flight.timer().is_some() {
                debug!("Stop retransmission of flight {}", flight.number());
            }
            flight.stop_timer();
        }
        self.flight_deadline = None;
    }

    pub fn flight_number(&self) -> Option<u8> {
        self.flight.as_ref().map(|f| f.number())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.flight_deadline
    }

    /// Retransmission timer fired. False when the retransmissions are exhausted.
    pub fn handle_timeout(
        &mut self,
        now: Instant,
        config: &Config,
        layer: &mut RecordLayer,
        out: &mut Vec<Buf>,
    ) -> Result<bool, Error> {
        let Some(deadline) = self.flight_deadline else {
            return Ok(true);
        };
        if now < deadline {
            return Ok(true);
        }
        let Some(timer) = self.flight.as_mut().and_then(|f| f.timer_mut()) else {
            self.flight_deadline = None;
            return Ok(true);
        };
        if !timer.can_retry() {
            debug!("Retransmissions exhausted after {} attempts", timer.attempt());
            self.flight_deadline = None;
            return Ok(false);
        }
        timer.next_attempt();
        let rto = timer.rto();
        let attempt = timer.attempt();
        if timer.is_back_off() {
            debug!("Back off mode at attempt {}", attempt);
        }
        self.flight_deadline = Some(now + rto);
        self.state = HandshakeState::Retransmit;
        self.resend_flight(config, layer, out)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn randoms(&self) -> Result<([u8; 32], [u8; 32]), Error> {
        match (&self.client_random, &self.server_random) {
            (Some(c), Some(s)) => Ok((c.to_bytes(), s.to_bytes())),
            _ => Err(Error::Crypto("Randoms not exchanged".to_string())),
        }
    }

    /// Master secret from the premaster secret. With the extended master
    /// secret the transcript must end with the ClientKeyExchange.
    pub fn derive_master_secret(&mut self, pre_master_secret: &[u8]) -> Result<(), Error> {
        let suite = self.suite()?;
        let hash = suite.descriptor().prf_hash;
        let (client_random, server_random) = self.randoms()?;

        let session_hash = if self.extended_master_secret {
            Some(self.transcript_hash()?.clone_and_finalize())
        } else {
            None
        };

        let master_secret = crypto::master_secret(
            pre_master_secret,
            &client_random,
            &server_random,
            session_hash.as_deref(),
            hash,
        )
        .map_err(Error::Crypto)?;
        self.master_secret = Some(master_secret);
        Ok(())
    }

    /// Derive the record keys and stage them in the record layer.
    pub fn install_keys(&mut self, layer: &mut RecordLayer) -> Result<(), Error> {
        let suite = self.suite()?;
        let descriptor = suite.descriptor();
        let (client_random, server_random) = self.randoms()?;
        let Some(master_secret) = &self.master_secret else {
            return Err(Error::Crypto("No master secret".to_string()));
        };

        let block = crypto::key_block(
            master_secret,
            &client_random,
            &server_random,
            descriptor.cipher.key_len(),
            descriptor.prf_hash,
        )
        .map_err(Error::Crypto)?;

        let client = RecordCipher::new(&block.client_write_key, block.client_write_iv).map_err(Error::Crypto)?;
        let server = RecordCipher::new(&block.server_write_key, block.server_write_iv).map_err(Error::Crypto)?;

        if self.is_client {
            layer.set_pending(server, client);
        } else {
            layer.set_pending(client, server);
        }
        Ok(())
    }

    /// verify_data of the `client` or server Finished over the transcript so far.
    pub fn verify_data(&self, client: bool) -> Result<[u8; 12], Error> {
        let suite = self.suite()?;
        let Some(master_secret) = &self.master_secret else {
            return Err(Error::Crypto("No master secret".to_string()));
        };
        let transcript = self.transcript_hash()?;
        crypto::verify_data(master_secret, client, &transcript, suite.descriptor().prf_hash)
            .map_err(Error::Crypto)
    }

    /// Check a Finished received from the peer.
    pub fn check_peer_finished(&self, verify_data: &[u8; 12]) -> Result<(), Error> {
        let expected = self.verify_data(!self.is_client)?;
        if expected != *verify_data {
            return Err(Error::HandshakeAborted(AlertDescription::DecryptError));
        }
        Ok(())
    }
}

fn limits(config: &Config, peer_record_size_limit: Option<u16>, back_off: bool) -> PackLimits {
    let record_size_limit = match (peer_record_size_limit, config.record_size_limit()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    PackLimits {
        mtu: config.mtu(),
        back_off,
        record_size_limit,
        multi_record: config.use_multi_record_messages(),
        multi_handshake: config.use_multi_handshake_message_records(),
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("is_client", &self.is_client)
            .field("state", &self.state)
            .field("next_send_seq", &self.next_send_seq)
            .field("next_recv_seq", &self.next_recv_seq)
            .field("suite", &self.suite)
            .field("flight", &self.flight_number())
            .finish_non_exhaustive()
    }
}
