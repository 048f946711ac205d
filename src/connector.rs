//! Sans-IO DTLS 1.2 connector.
//!
//! The [`Connector`] demultiplexes datagrams to connections, answers new
//! ClientHellos with a stateless cookie challenge when required, keeps the
//! retransmission timers and reports statistics. It never touches a socket or
//! reads the clock: every call takes `now` and returns the [`Output`]s the
//! caller has to act on.
//!
//! All methods take `&self`. Unrelated connections can be driven from several
//! threads at once, each connection is serialized by its own lock.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::Buf;
use crate::config::Config;
use crate::connection::{Connection, Effects};
use crate::crypto::CookieGenerator;
use crate::error::Error;
use crate::event::Output;
use crate::handshake::dos::{self, HelloFacts, Verdict};
use crate::handshake::HandshakeState;
use crate::health::{Health, HealthStats};
use crate::message::{serialize_header, serialize_message, ClientHello, Fragment};
use crate::message::{HelloVerifyRequest, MessageType, Record};
use crate::session::Session;
use crate::store::{ConnKey, ConnectionStore, Removed};
use crate::types::ContentType;
use crate::util::parse_exact;

#[derive(Debug, Default)]
struct Timers {
    /// Min-heap of `(deadline, connection, generation)`.
    heap: BinaryHeap<Reverse<(Instant, ConnKey, u64)>>,
    next_health_report: Option<Instant>,
}

/// DTLS 1.2 client and server engine.
pub struct Connector {
    config: Arc<Config>,
    store: ConnectionStore<Connection>,
    cookies: CookieGenerator,
    health: Arc<Health>,
    timers: Mutex<Timers>,
}

impl Connector {
    pub fn new(config: Arc<Config>) -> Self {
        let store = ConnectionStore::new(config.max_connections(), config.stale_connection_threshold());
        Connector {
            store,
            cookies: CookieGenerator::new(),
            health: Arc::new(Health::default()),
            timers: Mutex::new(Timers::default()),
            config,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Start a handshake with `peer`.
    ///
    /// A session established earlier with `peer` is offered for resumption.
    /// Does nothing while a handshake with `peer` is already running.
    pub fn connect(&self, now: Instant, peer: SocketAddr) -> Result<Vec<Output>, Error> {
        if !self.config.role().is_client() {
            return Err(Error::RoleNotPermitted);
        }
        let mut out = Vec::new();
        self.arm_health_report(now);
        self.connect_into(now, peer, &mut out)?;
        Ok(out)
    }

    fn connect_into(&self, now: Instant, peer: SocketAddr, out: &mut Vec<Output>) -> Result<(), Error> {
        let mut resume = None;
        if let Some((_, existing)) = self.store.find_by_address(peer) {
            let existing = existing.lock();
            if existing.is_handshaking() {
                debug!("Handshake with {} already in progress", peer);
                return Ok(());
            }
            resume = existing.session().filter(|s| s.is_resumable()).cloned();
        }

        let (key, connection) = self.insert(now, peer, false, out)?;
        let mut conn = connection.lock();
        debug!("Connect to {} ({})", peer, if resume.is_some() { "resume" } else { "full" });
        let effects = conn.start_client(now, resume, out);
        self.apply(now, key, &mut conn, effects);
        Ok(())
    }

    /// Send application data to `peer`.
    ///
    /// Data for a peer still handshaking is deferred. A client without a
    /// connection to `peer` connects first.
    pub fn send(&self, now: Instant, peer: SocketAddr, data: Vec<u8>) -> Result<Vec<Output>, Error> {
        let mut out = Vec::new();
        let found = match self.store.find_by_address(peer) {
            Some(found) => found,
            None if self.config.role().is_client() => {
                self.connect_into(now, peer, &mut out)?;
                self.store.find_by_address(peer).ok_or(Error::NotConnected)?
            }
            None => return Err(Error::NotConnected),
        };

        // An established connection keeps carrying data while a resumption runs.
        let (key, connection) = self.store.predecessor(found.0).unwrap_or(found);
        let mut conn = connection.lock();
        conn.send(data, &mut out)?;
        self.apply(now, key, &mut conn, Effects::default());
        Ok(out)
    }

    /// Close the connection to `peer` with close_notify.
    pub fn close(&self, now: Instant, peer: SocketAddr) -> Result<Vec<Output>, Error> {
        let (key, connection) = self.store.find_by_address(peer).ok_or(Error::UnknownPeer)?;
        let parked = self.store.predecessor(key);
        let mut out = Vec::new();
        for (key, connection) in parked.into_iter().chain(Some((key, connection))) {
            let mut conn = connection.lock();
            let effects = conn.close_locally(now, &mut out);
            self.apply(now, key, &mut conn, effects);
        }
        Ok(out)
    }

    /// The session currently established with `peer`.
    ///
    /// While a resumption with `peer` runs, that is the session of the
    /// connection it would replace.
    pub fn session(&self, peer: SocketAddr) -> Option<Session> {
        let found = self.store.find_by_address(peer)?;
        let (_, connection) = self.store.predecessor(found.0).unwrap_or(found);
        let conn = connection.lock();
        conn.session().cloned()
    }

    /// State of the latest handshake with `peer`.
    pub fn handshake_state(&self, peer: SocketAddr) -> Option<HandshakeState> {
        let (_, connection) = self.store.find_by_address(peer)?;
        let conn = connection.lock();
        conn.handshake_state()
    }

    /// A cached server session, as used for resumption.
    pub fn find_session(&self, id: &crate::message::SessionId) -> Option<Session> {
        self.store.find_session(id)
    }

    pub fn stats(&self) -> HealthStats {
        self.health.snapshot(self.store.len())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process one datagram received from `peer`.
    pub fn handle_datagram(&self, now: Instant, peer: SocketAddr, datagram: &[u8]) -> Vec<Output> {
        let mut out = Vec::new();
        self.arm_health_report(now);
        let records = Record::parse_datagram(datagram, self.config.connection_id_length());
        if records.is_empty() {
            trace!("Drop unparseable datagram from {}", peer);
            self.health.records_dropped();
        }
        for record in records {
            self.handle_record(now, peer, &record, &mut out);
        }
        out
    }

    fn handle_record(&self, now: Instant, peer: SocketAddr, record: &Record, out: &mut Vec<Output>) {
        let (found, by_cid) = match &record.cid {
            Some(cid) => (self.store.find_by_cid(cid), true),
            None => (self.store.find_by_address(peer), false),
        };

        if record.content_type == ContentType::Handshake && record.sequence.epoch == 0 && !by_cid {
            if let Ok((_, fragment)) = Fragment::parse(record.fragment) {
                if fragment.header.msg_type == MessageType::ClientHello {
                    self.on_client_hello(now, peer, record, &fragment, found, out);
                    return;
                }
            }
        }

        let Some((key, connection)) = found else {
            trace!("Drop record {} from unknown peer {}", record.sequence, peer);
            self.health.records_dropped();
            return;
        };

        // Protected records go to a parked connection first. Only those it
        // fails to authenticate belong to the resumption.
        if !by_cid && record.sequence.epoch > 0 {
            if let Some((parked_key, parked)) = self.store.predecessor(key) {
                let mut conn = parked.lock();
                let effects = conn.handle_record(now, record, out);
                let authenticated = effects.active;
                self.apply(now, parked_key, &mut conn, effects);
                if authenticated {
                    return;
                }
            }
        }

        let (displaced, settled) = {
            let mut conn = connection.lock();
            let effects = conn.handle_record(now, record, out);

            // Only authenticated records newer than every earlier one move the connection.
            let mut displaced = None;
            if by_cid
                && effects.newest_record
                && !conn.is_closed()
                && conn.peer() != peer
                && self.config.update_address_using_cid_on_newer_records()
            {
                debug!("Connection {} moves from {} to {}", key, conn.peer(), peer);
                displaced = self.store.update_address(key, peer);
                conn.set_peer(peer);
            }
            let settled = self.apply(now, key, &mut conn, effects);
            (displaced, settled)
        };

        if let Some(removed) = displaced {
            self.discard(now, removed, out);
        }
        if let Some(removed) = settled {
            debug!("Resumption with {} replaced connection {}", peer, removed.key);
            removed.connection.lock().retire();
        }
    }

    fn on_client_hello(
        &self,
        now: Instant,
        peer: SocketAddr,
        record: &Record,
        fragment: &Fragment,
        existing: Option<(ConnKey, Arc<Mutex<Connection>>)>,
        out: &mut Vec<Output>,
    ) {
        if !self.config.role().is_server() {
            trace!("Drop ClientHello from {}, not a server", peer);
            self.health.records_dropped();
            return;
        }

        let hello = if fragment.header.is_fragment() {
            None
        } else {
            parse_exact(fragment.body, ClientHello::parse)
        };

        // Retransmissions of the hello that started the current handshake.
        if let Some((key, connection)) = &existing {
            let mut conn = connection.lock();
            let same = match &hello {
                Some(hello) => conn.client_random() == Some(hello.random),
                None => conn.is_handshaking(),
            };
            if same {
                let effects = conn.handle_record(now, record, out);
                self.apply(now, *key, &mut conn, effects);
                return;
            }
        }

        let Some(hello) = hello else {
            trace!("Drop fragmented or malformed ClientHello from {}", peer);
            self.health.records_dropped();
            return;
        };

        let resumable = self.store.find_session(&hello.session_id).filter(|session| {
            self.config
                .resumption_verifier()
                .map(|v| v.allow_resumption(peer, session))
                .unwrap_or(true)
        });
        let address_session = self.store.address_session(peer);
        let facts = HelloFacts {
            cookie_valid: !hello.cookie.is_empty() && self.cookies.verify(now, peer, &hello),
            shares_psk_suite: hello
                .offered_suites()
                .iter()
                .any(|s| s.is_psk_based() && self.config.cipher_suites().contains(s)),
            resumable: resumable.is_some(),
            address_session: address_session.as_ref(),
            pending_unverified: self.store.pending_unverified_resumptions(),
        };

        match dos::decide(&self.config, &hello, &facts) {
            Verdict::Challenge => self.send_hello_verify_request(now, peer, record, fragment, &hello, out),
            Verdict::Proceed { verified } => {
                if !verified {
                    debug!("Resumption from {} skips the address check", peer);
                }
                let Ok((key, connection)) = self.insert(now, peer, !verified, out) else {
                    return;
                };
                let mut conn = connection.lock();
                let effects = conn.start_server(
                    now,
                    &hello,
                    fragment.header.message_seq,
                    fragment.body,
                    record.sequence,
                    resumable,
                    out,
                );
                self.apply(now, key, &mut conn, effects);
            }
        }
    }

    fn send_hello_verify_request(
        &self,
        now: Instant,
        peer: SocketAddr,
        record: &Record,
        fragment: &Fragment,
        hello: &ClientHello,
        out: &mut Vec<Output>,
    ) {
        let cookie = self.cookies.generate(now, peer, hello);
        let mut body = Buf::new();
        HelloVerifyRequest::reply_to(hello.client_version, self.config.hello_verify_version(), cookie)
            .serialize(&mut body);
        let message = serialize_message(MessageType::HelloVerifyRequest, fragment.header.message_seq, &body);

        let mut datagram = Buf::with_capacity(Record::HEADER_LEN + message.len());
        serialize_header(&mut datagram, ContentType::Handshake, record.sequence, None, message.len());
        datagram.extend_from_slice(&message);

        trace!("HelloVerifyRequest to {}", peer);
        self.health.hello_verify_requests();
        self.health.records_sent();
        out.push(Output::Transmit {
            peer,
            datagram: datagram.into_vec(),
        });
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// The next instant [`Connector::handle_timeout`] has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let timers = self.timers.lock();
        let next = timers.heap.peek().map(|Reverse((deadline, _, _))| *deadline);
        match (next, timers.next_health_report) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Retransmit flights whose timers expired and push due statistics.
    pub fn handle_timeout(&self, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();

        let (due, report) = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, key, generation))) = timers.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                timers.heap.pop();
                due.push((key, generation));
            }
            let report = self.health_report_due(&mut timers, now);
            (due, report)
        };

        for (key, generation) in due {
            // Gone connections leave stale entries behind.
            let Some(connection) = self.store.get(key) else {
                continue;
            };
            let mut conn = connection.lock();
            if !conn.timer_due(generation, now) {
                continue;
            }
            let effects = conn.handle_timeout(now, &mut out);
            self.apply(now, key, &mut conn, effects);
        }

        if report {
            if let Some(handler) = self.config.health_handler() {
                handler.report(&self.stats());
            }
        }

        out
    }

    fn arm_health_report(&self, now: Instant) {
        if self.config.health_handler().is_none() {
            return;
        }
        let mut timers = self.timers.lock();
        if timers.next_health_report.is_none() {
            timers.next_health_report = Some(now + self.config.health_status_interval());
        }
    }

    fn health_report_due(&self, timers: &mut Timers, now: Instant) -> bool {
        if self.config.health_handler().is_none() {
            return false;
        }
        let interval = self.config.health_status_interval();
        match timers.next_health_report {
            None => {
                timers.next_health_report = Some(now + interval);
                false
            }
            Some(at) if at <= now => {
                timers.next_health_report = Some(now + interval);
                true
            }
            Some(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Store bookkeeping
    // ------------------------------------------------------------------

    /// Insert a new connection for `peer`, replacing one bound to that address.
    fn insert(
        &self,
        now: Instant,
        peer: SocketAddr,
        unverified: bool,
        out: &mut Vec<Output>,
    ) -> Result<(ConnKey, Arc<Mutex<Connection>>), Error> {
        let config = &self.config;
        let health = &self.health;
        let inserted = self
            .store
            .put(now, peer, unverified, |key| {
                Connection::new(key, peer, config.clone(), health.clone(), now)
            })
            .map_err(|e| {
                warn!("Reject connection from {}: store is full", peer);
                self.health.connections_rejected();
                e
            })?;

        if let Some(evicted) = inserted.evicted {
            self.health.connections_evicted();
            self.discard(now, evicted, out);
        }
        for replaced in inserted.replaced {
            self.discard(now, replaced, out);
        }
        Ok((inserted.key, inserted.connection))
    }

    /// Finish a connection the store no longer holds. Must not be called
    /// while holding another connection's lock.
    fn discard(&self, now: Instant, removed: Removed<Connection>, out: &mut Vec<Output>) {
        removed.connection.lock().evict(now, out);
        if let Some(listener) = self.config.connection_listener() {
            listener.on_removed(removed.peer);
        }
    }

    /// Apply what a connection reported to the store and the timer heap.
    ///
    /// Returns the parked connection a completed handshake replaced. Only
    /// record handling completes handshakes.
    fn apply(&self, now: Instant, key: ConnKey, conn: &mut Connection, effects: Effects) -> Option<Removed<Connection>> {
        if effects.active {
            self.store.touch(key, now);
        }

        if let Some(cid) = conn.take_cid_update() {
            self.store.update_cid(key, cid);
        }

        if effects.closed {
            if self.store.remove(key).is_some() {
                debug!("Remove connection {} to {}", key, conn.peer());
                if let Some(listener) = self.config.connection_listener() {
                    listener.on_removed(conn.peer());
                }
            }
            return None;
        }

        let mut settled = None;
        if let Some(session) = &effects.established {
            if conn.is_server() {
                settled = self.store.put_session(key, session);
            } else {
                self.store.set_verified(key);
            }
        } else if effects.handshake_ended {
            self.store.set_verified(key);
        }

        if let Some((deadline, generation)) = conn.reschedule() {
            self.timers.lock().heap.push(Reverse((deadline, key, generation)));
        }
        settled
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("connections", &self.store.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use super::*;
    use crate::config::{ConfigParams, DtlsRole, HelloVerifyMode};
    use crate::credentials::StaticPskStore;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn connector(role: DtlsRole, f: impl FnOnce(&mut ConfigParams)) -> Connector {
        let mut params = ConfigParams {
            role,
            psk_store: Some(Arc::new(StaticPskStore::new().with_key("client", "secret"))),
            rng_seed: Some(7),
            ..Default::default()
        };
        f(&mut params);
        Connector::new(Arc::new(params.build().unwrap()))
    }

    fn transmits(out: &[Output]) -> Vec<Vec<u8>> {
        out.iter()
            .filter_map(|o| match o {
                Output::Transmit { datagram, .. } => Some(datagram.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn server_only_refuses_connect() {
        let server = connector(DtlsRole::ServerOnly, |_| {});
        let err = server.connect(Instant::now(), addr(1)).unwrap_err();
        assert!(matches!(err, Error::RoleNotPermitted));
    }

    #[test]
    fn client_hello_is_challenged_without_state() {
        let now = Instant::now();
        let client = connector(DtlsRole::ClientOnly, |_| {});
        let server = connector(DtlsRole::ServerOnly, |_| {});

        let out = client.connect(now, addr(2)).unwrap();
        let hello = transmits(&out);
        assert_eq!(hello.len(), 1);

        let out = server.handle_datagram(now, addr(1), &hello[0]);
        let hvr = transmits(&out);
        assert_eq!(hvr.len(), 1);
        assert_eq!(server.stats().connections, 0);
        assert_eq!(server.stats().hello_verify_requests, 1);

        // Same record sequence number as the hello.
        assert_eq!(hvr[0][3..11], hello[0][3..11]);
    }

    #[test]
    fn disabled_challenge_allocates_state() {
        let now = Instant::now();
        let client = connector(DtlsRole::ClientOnly, |_| {});
        let server = connector(DtlsRole::ServerOnly, |p| {
            p.hello_verify_request = HelloVerifyMode::Disabled;
        });

        let out = client.connect(now, addr(2)).unwrap();
        let out = server.handle_datagram(now, addr(1), &transmits(&out)[0]);
        assert!(!transmits(&out).is_empty());
        assert_eq!(server.stats().connections, 1);
        assert_eq!(server.handshake_state(addr(1)), Some(HandshakeState::WaitFlight));
    }

    #[test]
    fn garbage_is_dropped_silently() {
        let server = connector(DtlsRole::ServerOnly, |_| {});
        let out = server.handle_datagram(Instant::now(), addr(1), &[0xff, 0x00, 0x01]);
        assert!(out.is_empty());
        assert_eq!(server.stats().records_dropped, 1);
    }

    #[test]
    fn connect_schedules_retransmission() {
        let now = Instant::now();
        let client = connector(DtlsRole::ClientOnly, |_| {});
        client.connect(now, addr(2)).unwrap();

        let deadline = client.poll_timeout().unwrap();
        assert!(deadline > now);
        assert!(client.handle_timeout(now).is_empty());

        let out = client.handle_timeout(deadline + Duration::from_millis(1));
        assert_eq!(transmits(&out).len(), 1);
        assert_eq!(client.handshake_state(addr(2)), Some(HandshakeState::Retransmit));
        assert_eq!(client.stats().retransmissions, 1);
    }

    #[test]
    fn send_to_unknown_peer_as_server() {
        let server = connector(DtlsRole::ServerOnly, |_| {});
        let err = server.send(Instant::now(), addr(1), b"x".to_vec()).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(matches!(server.close(Instant::now(), addr(1)), Err(Error::UnknownPeer)));
    }

    #[test]
    fn send_while_connecting_defers() {
        let now = Instant::now();
        let client = connector(DtlsRole::ClientOnly, |_| {});
        let out = client.send(now, addr(2), b"early".to_vec()).unwrap();
        // Only the ClientHello, the data waits for the handshake.
        assert_eq!(transmits(&out).len(), 1);
        assert_eq!(client.handshake_state(addr(2)), Some(HandshakeState::WaitFlight));
    }
}
