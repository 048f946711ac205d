//! State of one peer relationship: record layer, current session, an ongoing
//! handshake and the traffic waiting for it.
//!
//! A `Connection` never touches the store. What the store has to learn is
//! reported back in [`Effects`] and applied by the connector.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buf;
use crate::config::Config;
use crate::deferred::{DeferredInbound, DeferredOutbound};
use crate::error::Error;
use crate::event::{CloseReason, Output};
use crate::handshake::{alert_for, ClientHandshake, Context, Handshake, HandshakeState, ServerHandshake};
use crate::health::Health;
use crate::message::{Alert, AlertDescription, AlertLevel, ClientHello, ConnectionId, Random, Record};
use crate::record_layer::{AddressTracker, Opened, RecordLayer};
use crate::rng::SeededRng;
use crate::session::Session;
use crate::store::ConnKey;
use crate::types::{ContentType, Sequence};

/// What the connector has to apply to the store after a call.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// At least one record was authenticated.
    pub active: bool,
    /// The newest authenticated record so far arrived in this call.
    pub newest_record: bool,
    /// A handshake completed with this session.
    pub established: Option<Session>,
    /// A handshake ended, successfully or not.
    pub handshake_ended: bool,
    /// The connection is finished and must leave the store.
    pub closed: bool,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.active |= other.active;
        self.newest_record |= other.newest_record;
        self.handshake_ended |= other.handshake_ended;
        self.closed |= other.closed;
        if other.established.is_some() {
            self.established = other.established;
        }
    }
}

pub(crate) struct Connection {
    key: ConnKey,
    peer: SocketAddr,
    config: Arc<Config>,
    health: Arc<Health>,

    layer: RecordLayer,
    address_tracker: AddressTracker,

    session: Option<Session>,
    handshake: Option<Handshake>,
    /// Random of the ClientHello that started the current server handshake.
    client_random: Option<Random>,

    deferred_out: DeferredOutbound,
    deferred_in: DeferredInbound,

    /// Connection id last reported to the store.
    published_cid: Option<ConnectionId>,
    /// Deadline last handed to the timer heap and its generation.
    scheduled: Option<Instant>,
    timer_generation: u64,

    rng: SeededRng,
    is_server: bool,
    closed: bool,
    last_activity: Instant,
}

impl Connection {
    pub fn new(key: ConnKey, peer: SocketAddr, config: Arc<Config>, health: Arc<Health>, now: Instant) -> Self {
        let layer = RecordLayer::new(config.use_anti_replay_filter(), config.disabled_window());
        Connection {
            key,
            peer,
            layer,
            address_tracker: AddressTracker::default(),
            session: None,
            handshake: None,
            client_random: None,
            deferred_out: DeferredOutbound::new(config.max_deferred_outbound_messages()),
            deferred_in: DeferredInbound::new(config.max_deferred_inbound_records_size()),
            published_cid: None,
            scheduled: None,
            timer_generation: 0,
            rng: SeededRng::new(config.rng_seed().map(|s| s ^ key)),
            is_server: false,
            closed: false,
            last_activity: now,
            config,
            health,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = peer;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn handshake_state(&self) -> Option<HandshakeState> {
        self.handshake.as_ref().map(|h| h.state())
    }

    pub fn is_established(&self) -> bool {
        self.session.is_some() && self.layer.write_epoch() > 0
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshake
            .as_ref()
            .map(|h| !h.state().is_terminal())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The connection id to index this connection by, if it changed since the
    /// last call.
    pub fn take_cid_update(&mut self) -> Option<Option<ConnectionId>> {
        let current = if self.closed { None } else { self.read_cid() };
        if current == self.published_cid {
            return None;
        }
        self.published_cid = current;
        Some(current)
    }

    /// A deadline to put on the timer heap, if it moved since the last call.
    /// Entries of earlier generations become stale.
    pub fn reschedule(&mut self) -> Option<(Instant, u64)> {
        let deadline = if self.closed { None } else { self.deadline() };
        if deadline == self.scheduled {
            return None;
        }
        self.scheduled = deadline;
        self.timer_generation += 1;
        deadline.map(|d| (d, self.timer_generation))
    }

    pub fn timer_due(&self, generation: u64, now: Instant) -> bool {
        generation == self.timer_generation && self.scheduled.map(|d| d <= now).unwrap_or(false)
    }

    pub fn read_cid(&self) -> Option<ConnectionId> {
        self.layer.read_cid().copied()
    }

    pub fn client_random(&self) -> Option<Random> {
        self.client_random
    }

    /// Next retransmission deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.handshake.as_ref().and_then(|h| h.deadline())
    }

    fn handshake_rng(&mut self) -> SeededRng {
        let seed = self.config.rng_seed().map(|_| self.rng.random());
        SeededRng::new(seed)
    }

    // ------------------------------------------------------------------
    // Handshake start
    // ------------------------------------------------------------------

    /// Start a client handshake, resuming `resume` if possible.
    pub fn start_client(&mut self, now: Instant, resume: Option<Session>, out: &mut Vec<Output>) -> Effects {
        self.health.handshakes_started();
        let rng = self.handshake_rng();
        let mut datagrams = Vec::new();
        let ctx = Context {
            config: &self.config,
            peer: self.peer,
            now,
        };
        let result = ClientHandshake::start(&ctx, &mut self.layer, resume, rng, &mut datagrams);
        self.transmit(datagrams, out);
        match result {
            Ok(client) => {
                self.handshake = Some(Handshake::Client(Box::new(client)));
                Effects::default()
            }
            Err(e) => self.fail_handshake(e, out),
        }
    }

    /// Answer a ClientHello that passed the address check.
    #[allow(clippy::too_many_arguments)]
    pub fn start_server(
        &mut self,
        now: Instant,
        hello: &ClientHello,
        message_seq: u16,
        body: &[u8],
        record_sequence: Sequence,
        resumable: Option<Session>,
        out: &mut Vec<Output>,
    ) -> Effects {
        self.health.handshakes_started();
        self.is_server = true;
        self.client_random = Some(hello.random);
        self.layer.mark(record_sequence);
        self.layer.start_epoch_0_at(record_sequence.sequence_number);
        self.last_activity = now;

        let rng = self.handshake_rng();
        let mut datagrams = Vec::new();
        let ctx = Context {
            config: &self.config,
            peer: self.peer,
            now,
        };
        let result = ServerHandshake::start(
            &ctx,
            &mut self.layer,
            hello,
            message_seq,
            body,
            resumable,
            rng,
            &mut datagrams,
        );
        self.transmit(datagrams, out);
        match result {
            Ok(server) => {
                self.handshake = Some(Handshake::Server(Box::new(server)));
                Effects {
                    active: true,
                    ..Default::default()
                }
            }
            Err(e) => self.fail_handshake(e, out),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn handle_record(&mut self, now: Instant, record: &Record, out: &mut Vec<Output>) -> Effects {
        if self.closed {
            return Effects::default();
        }
        let read_epoch = self.layer.read_epoch();
        let was_handshaking = self.is_handshaking();

        let mut effects = self.handle_one(now, record, out);

        // Keys for a new epoch, or a completed handshake, may unlock held records.
        let unlocked = self.layer.read_epoch() != read_epoch || (was_handshaking && !self.is_handshaking());
        if unlocked && !self.closed && !self.deferred_in.is_empty() {
            effects.merge(self.replay_deferred(now, out));
        }
        effects
    }

    fn replay_deferred(&mut self, now: Instant, out: &mut Vec<Output>) -> Effects {
        let mut effects = Effects::default();
        let cid_len = self.config.connection_id_length();
        let held = self.deferred_in.take();
        trace!("Replay {} deferred records", held.len());
        for raw in held {
            if self.closed {
                break;
            }
            let Ok((_, record)) = Record::parse(&raw, cid_len) else {
                continue;
            };
            effects.merge(self.handle_one(now, &record, out));
        }
        effects
    }

    fn handle_one(&mut self, now: Instant, record: &Record, out: &mut Vec<Output>) -> Effects {
        let mut effects = Effects::default();

        // A retransmitted flight of the peer partly lives in the epoch we left.
        if record.sequence.epoch == 0
            && self.layer.read_epoch() == 1
            && record.content_type == ContentType::Handshake
        {
            if let Some(handshake) = &mut self.handshake {
                let mut datagrams = Vec::new();
                let ctx = Context {
                    config: &self.config,
                    peer: self.peer,
                    now,
                };
                let r = handshake.handle_old_epoch(&ctx, &mut self.layer, record.fragment, &mut datagrams);
                let resent = !datagrams.is_empty();
                self.transmit(datagrams, out);
                if resent {
                    self.health.retransmissions();
                }
                if let Err(e) = r {
                    return self.fail_handshake(e, out);
                }
            }
            return effects;
        }

        let (content_type, sequence, data) = match self.layer.open(record) {
            Opened::Record {
                content_type,
                sequence,
                data,
            } => (content_type, sequence, data),
            Opened::Future => {
                self.defer(record);
                return effects;
            }
            Opened::Dropped(reason) => {
                trace!("Drop record {} from {}: {}", record.sequence, self.peer, reason);
                self.health.records_dropped();
                return effects;
            }
        };

        if content_type == ContentType::ApplicationData && !self.can_receive_application_data() {
            // Arrived ahead of the Finished that completes the handshake.
            self.defer(record);
            return effects;
        }

        self.layer.mark(sequence);
        self.health.records_received();
        self.last_activity = now;
        effects.active = true;
        effects.newest_record = self.address_tracker.observe(sequence);

        match content_type {
            ContentType::Handshake => effects.merge(self.on_handshake(now, sequence.epoch, &data, out)),
            ContentType::ChangeCipherSpec => {
                if data[..] != [1] {
                    self.health.records_dropped();
                    return effects;
                }
                effects.merge(self.on_change_cipher_spec(now, out));
            }
            ContentType::Alert => effects.merge(self.on_alert(now, &data, out)),
            ContentType::ApplicationData => {
                out.push(Output::ApplicationData {
                    peer: self.peer,
                    data: data.into_vec(),
                });
            }
            other => {
                trace!("Ignore record of type {:?}", other);
            }
        }
        effects
    }

    fn can_receive_application_data(&self) -> bool {
        self.session.is_some() && self.layer.read_epoch() > 0 && !self.is_handshaking()
    }

    fn defer(&mut self, record: &Record) {
        if !self.is_handshaking() {
            trace!("Drop record {} without a handshake to wait for", record.sequence);
            self.health.records_dropped();
            return;
        }
        if !self.deferred_in.push(record.raw) {
            debug!("Deferred inbound records full, drop {}", record.sequence);
            self.health.records_dropped();
        }
    }

    fn on_handshake(&mut self, now: Instant, epoch: u16, data: &[u8], out: &mut Vec<Output>) -> Effects {
        let Some(handshake) = &mut self.handshake else {
            trace!("Handshake record from {} without a handshake", self.peer);
            return Effects::default();
        };
        let mut datagrams = Vec::new();
        let ctx = Context {
            config: &self.config,
            peer: self.peer,
            now,
        };
        let result = handshake.handle_handshake(&ctx, &mut self.layer, epoch, data, &mut datagrams);
        self.after_handshake_input(result, datagrams, out)
    }

    fn on_change_cipher_spec(&mut self, now: Instant, out: &mut Vec<Output>) -> Effects {
        let Some(handshake) = &mut self.handshake else {
            return Effects::default();
        };
        let mut datagrams = Vec::new();
        let ctx = Context {
            config: &self.config,
            peer: self.peer,
            now,
        };
        let result = handshake.handle_change_cipher_spec(&ctx, &mut self.layer, &mut datagrams);
        self.after_handshake_input(result, datagrams, out)
    }

    fn after_handshake_input(
        &mut self,
        result: Result<(), Error>,
        datagrams: Vec<Buf>,
        out: &mut Vec<Output>,
    ) -> Effects {
        self.transmit(datagrams, out);
        if let Err(e) = result {
            return self.fail_handshake(e, out);
        }

        let Some(established) = self.handshake.as_mut().and_then(|h| h.take_established()) else {
            return Effects::default();
        };

        self.health.handshakes_succeeded();
        if let Some(listener) = self.config.connection_listener() {
            listener.on_established(self.peer, &established.session, established.resumed);
        }
        out.push(Output::Connected {
            peer: self.peer,
            session_id: *established.session.id(),
            resumed: established.resumed,
        });
        self.session = Some(established.session.clone());

        // Application data submitted during the handshake.
        let pending: Vec<Vec<u8>> = self.deferred_out.drain().collect();
        for data in pending {
            if let Err(e) = self.send_application_data(&data, out) {
                debug!("Drop deferred message to {}: {}", self.peer, e);
            }
        }

        Effects {
            established: Some(established.session),
            handshake_ended: true,
            ..Default::default()
        }
    }

    fn on_alert(&mut self, now: Instant, data: &[u8], out: &mut Vec<Output>) -> Effects {
        let Ok((_, alert)) = Alert::parse(data) else {
            self.health.records_dropped();
            return Effects::default();
        };

        if alert.description == AlertDescription::CloseNotify {
            debug!("close_notify from {}", self.peer);
            self.send_alert(Alert::close_notify(), out);
            return self.close(now, CloseReason::PeerClosed, out);
        }
        if alert.level == AlertLevel::Fatal {
            debug!("Fatal alert {} from {}", alert.description, self.peer);
            let handshaking = self.is_handshaking();
            if handshaking {
                self.health.handshakes_failed();
                if let Some(listener) = self.config.connection_listener() {
                    listener.on_handshake_failed(self.peer, Some(alert.description));
                }
            }
            let mut effects = self.close(now, CloseReason::PeerAlert(alert.description), out);
            effects.handshake_ended = handshaking;
            return effects;
        }
        trace!("Ignore warning alert {} from {}", alert.description, self.peer);
        Effects::default()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Output>) -> Effects {
        if self.closed {
            return Effects::default();
        }
        let Some(handshake) = &mut self.handshake else {
            return Effects::default();
        };
        let mut datagrams = Vec::new();
        let result = handshake.handle_timeout(now, &self.config, &mut self.layer, &mut datagrams);
        let resent = !datagrams.is_empty();
        self.transmit(datagrams, out);

        match result {
            Ok(true) => {
                if resent {
                    self.health.retransmissions();
                }
                Effects::default()
            }
            Ok(false) => {
                debug!("Handshake with {} timed out", self.peer);
                self.health.handshakes_failed();
                if let Some(listener) = self.config.connection_listener() {
                    listener.on_handshake_failed(self.peer, None);
                }
                let mut effects = self.close(now, CloseReason::RetransmissionsExhausted, out);
                effects.handshake_ended = true;
                effects
            }
            Err(e) => self.fail_handshake(e, out),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send or, while a handshake runs, defer application data.
    pub fn send(&mut self, data: Vec<u8>, out: &mut Vec<Output>) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.is_handshaking() || !self.is_established() {
            let limit = self.max_application_data();
            if data.len() > limit {
                return Err(Error::MessageTooLarge(data.len()));
            }
            if let Some(dropped) = self.deferred_out.push(data) {
                debug!("Deferred outbound messages full for {}, drop oldest", self.peer);
                self.health.deferred_dropped();
                out.push(Output::DeferredDropped {
                    peer: self.peer,
                    data: dropped,
                });
            }
            return Ok(());
        }
        self.send_application_data(&data, out)
    }

    fn max_application_data(&self) -> usize {
        let peer_limit = self.session.as_ref().and_then(|s| s.peer_record_size_limit());
        self.layer.max_plaintext(self.config.mtu(), peer_limit)
    }

    fn send_application_data(&mut self, data: &[u8], out: &mut Vec<Output>) -> Result<(), Error> {
        let limit = self.max_application_data();
        if data.len() > limit {
            return Err(Error::MessageTooLarge(data.len()));
        }
        let record = self.layer.seal_current(ContentType::ApplicationData, data)?;
        self.transmit(vec![record], out);
        Ok(())
    }

    /// Close with close_notify.
    pub fn close_locally(&mut self, now: Instant, out: &mut Vec<Output>) -> Effects {
        if self.closed {
            return Effects::default();
        }
        self.send_alert(Alert::close_notify(), out);
        self.close(now, CloseReason::LocalClose, out)
    }

    /// Drop the connection without telling the peer.
    pub fn evict(&mut self, now: Instant, out: &mut Vec<Output>) {
        if !self.closed {
            self.close(now, CloseReason::Evicted, out);
        }
    }

    /// Replaced by a resumed connection to the same peer. The association
    /// lives on there, so nothing is reported.
    pub fn retire(&mut self) {
        if let Some(handshake) = &mut self.handshake {
            if !handshake.state().is_terminal() {
                handshake.abort();
            }
        }
        self.closed = true;
    }

    fn fail_handshake(&mut self, error: Error, out: &mut Vec<Output>) -> Effects {
        let alert = alert_for(&error);
        debug!("Handshake with {} failed: {}", self.peer, error);
        self.health.handshakes_failed();
        if let Some(listener) = self.config.connection_listener() {
            listener.on_handshake_failed(self.peer, Some(alert));
        }
        self.send_alert(Alert::fatal(alert), out);
        if let Some(handshake) = &mut self.handshake {
            handshake.abort();
        }
        let mut effects = self.close(self.last_activity, CloseReason::HandshakeFailed(alert), out);
        effects.handshake_ended = true;
        effects
    }

    fn close(&mut self, now: Instant, reason: CloseReason, out: &mut Vec<Output>) -> Effects {
        self.closed = true;
        self.last_activity = self.last_activity.max(now);
        if let Some(handshake) = &mut self.handshake {
            if !handshake.state().is_terminal() {
                handshake.abort();
            }
        }
        out.push(Output::Closed {
            peer: self.peer,
            reason,
        });
        Effects {
            closed: true,
            ..Default::default()
        }
    }

    fn send_alert(&mut self, alert: Alert, out: &mut Vec<Output>) {
        let mut body = Buf::new();
        alert.serialize(&mut body);
        match self.layer.seal_current(ContentType::Alert, &body) {
            Ok(record) => self.transmit(vec![record], out),
            Err(e) => debug!("Cannot send alert to {}: {}", self.peer, e),
        }
    }

    fn transmit(&self, datagrams: Vec<Buf>, out: &mut Vec<Output>) {
        for datagram in datagrams {
            self.health.records_sent();
            out.push(Output::Transmit {
                peer: self.peer,
                datagram: datagram.into_vec(),
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("session", &self.session.as_ref().map(|s| *s.id()))
            .field("handshake", &self.handshake)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
