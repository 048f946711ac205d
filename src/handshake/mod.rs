//! DTLS 1.2 handshake state machines.
//!
//! Client and server share the [`engine::Engine`] for sequencing, reassembly,
//! flights and keys. Each side drives its own message flow on top.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::buffer::Buf;
use crate::config::Config;
use crate::error::Error;
use crate::message::{AlertDescription, Fragment};
use crate::record_layer::RecordLayer;
use crate::session::Session;

mod client;
pub(crate) mod dos;
mod engine;
mod server;

pub(crate) use client::ClientHandshake;
pub(crate) use server::ServerHandshake;

use engine::Received;

/// Where a handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Start,
    /// Client answered a HelloVerifyRequest and waits for the server flight.
    AwaitVerify,
    /// A flight was sent and the peer's next flight is expected.
    WaitFlight,
    /// The last flight was retransmitted at least once.
    Retransmit,
    /// Keys are installed and both Finished messages verified.
    Complete,
    /// Verification failed or retransmissions were exhausted.
    Aborted,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Complete | HandshakeState::Aborted)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Start => "START",
            HandshakeState::AwaitVerify => "AWAIT_VERIFY",
            HandshakeState::WaitFlight => "WAIT_FLIGHT",
            HandshakeState::Retransmit => "RETRANSMIT",
            HandshakeState::Complete => "COMPLETE",
            HandshakeState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Inputs the state machines need besides their own state.
#[derive(Clone, Copy)]
pub(crate) struct Context<'a> {
    pub config: &'a Config,
    pub peer: SocketAddr,
    pub now: Instant,
}

/// A finished handshake, handed over to the connection once.
#[derive(Debug)]
pub(crate) struct Established {
    pub session: Session,
    pub resumed: bool,
}

#[derive(Debug)]
pub(crate) enum Handshake {
    Client(Box<ClientHandshake>),
    Server(Box<ServerHandshake>),
}

impl Handshake {
    pub fn state(&self) -> HandshakeState {
        self.engine().state
    }

    fn engine(&self) -> &engine::Engine {
        match self {
            Handshake::Client(c) => &c.engine,
            Handshake::Server(s) => &s.engine,
        }
    }

    fn engine_mut(&mut self) -> &mut engine::Engine {
        match self {
            Handshake::Client(c) => &mut c.engine,
            Handshake::Server(s) => &mut s.engine,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.engine().deadline()
    }

    /// Feed the handshake messages of one record.
    pub fn handle_handshake(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        epoch: u16,
        data: &[u8],
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        for fragment in Fragment::parse_all(data) {
            // The flight timer keeps running until a message is accepted.
            match self.engine_mut().insert_fragment(epoch, &fragment) {
                Received::Buffered | Received::Ignored => {}
                Received::Duplicate { starts_flight } => {
                    if starts_flight {
                        debug!("Peer retransmitted its flight, resending ours");
                        self.engine_mut().resend_flight(ctx.config, layer, out)?;
                    }
                }
            }
        }

        self.process(ctx, layer, out)
    }

    /// Look at a handshake record of an epoch we already left. Only used to
    /// spot a retransmitted flight of the peer.
    pub fn handle_old_epoch(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        data: &[u8],
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        for fragment in Fragment::parse_all(data) {
            if let Received::Duplicate { starts_flight: true } =
                self.engine_mut().insert_fragment(0, &fragment)
            {
                debug!("Peer retransmitted its flight, resending ours");
                self.engine_mut().resend_flight(ctx.config, layer, out)?;
                break;
            }
        }
        Ok(())
    }

    pub fn handle_change_cipher_spec(
        &mut self,
        ctx: &Context,
        layer: &mut RecordLayer,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        if !layer.has_pending_read() {
            // Retransmitted or premature, either way nothing to switch to.
            trace!("ChangeCipherSpec without pending keys");
            return Ok(());
        }
        layer.activate_read();
        // Messages of the new epoch may already be buffered.
        self.process(ctx, layer, out)
    }

    fn process(&mut self, ctx: &Context, layer: &mut RecordLayer, out: &mut Vec<Buf>) -> Result<(), Error> {
        match self {
            Handshake::Client(c) => c.process(ctx, layer, out),
            Handshake::Server(s) => s.process(ctx, layer, out),
        }
    }

    /// False when the retransmissions are exhausted.
    pub fn handle_timeout(
        &mut self,
        now: Instant,
        config: &Config,
        layer: &mut RecordLayer,
        out: &mut Vec<Buf>,
    ) -> Result<bool, Error> {
        let ok = self.engine_mut().handle_timeout(now, config, layer, out)?;
        if !ok {
            self.engine_mut().state = HandshakeState::Aborted;
        }
        Ok(ok)
    }

    pub fn abort(&mut self) {
        let engine = self.engine_mut();
        engine.stop_flight_timer();
        engine.state = HandshakeState::Aborted;
    }

    /// The session once the handshake completed. Returns it only once.
    pub fn take_established(&mut self) -> Option<Established> {
        match self {
            Handshake::Client(c) => c.established.take(),
            Handshake::Server(s) => s.established.take(),
        }
    }
}

/// The alert to send for an error that ends a handshake.
pub(crate) fn alert_for(error: &Error) -> AlertDescription {
    match error {
        Error::HandshakeAborted(alert) => *alert,
        Error::Parse(_) => AlertDescription::DecodeError,
        _ => AlertDescription::InternalError,
    }
}

/// A message the current step has no use for. Plaintext ones may be forged
/// by anyone and are dropped, protected ones end the handshake.
fn unexpected(engine: &mut engine::Engine, step: impl fmt::Debug, message: engine::Message) -> Result<(), Error> {
    if message.epoch == 0 {
        debug!("Drop {:?} epoch 0 while waiting for {:?}", message.msg_type, step);
        engine.discard(&message);
        return Ok(());
    }
    debug!("Unexpected {:?} while waiting for {:?}", message.msg_type, step);
    Err(Error::HandshakeAborted(AlertDescription::UnexpectedMessage))
}
