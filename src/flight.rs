//! Outbound flights and their packing into datagrams.

use std::time::Instant;

use crate::buffer::Buf;
use crate::error::Error;
use crate::message::{Header, MessageType};
use crate::timer::RetransmissionTimer;
use crate::types::ContentType;

/// Largest datagram sent in back-off mode.
pub const BACK_OFF_DATAGRAM_SIZE: usize = 512;

/// Turns record payloads into protected records.
pub trait RecordWriter {
    /// Bytes a record of `epoch` adds around its payload.
    fn overhead(&self, epoch: u16) -> usize;

    /// A complete record carrying `payload`, using the next sequence number of `epoch`.
    fn write(&mut self, content_type: ContentType, epoch: u16, payload: &[u8]) -> Result<Buf, Error>;
}

/// Size rules for one transmission of a flight.
#[derive(Debug, Clone, Copy)]
pub struct PackLimits {
    pub mtu: usize,
    pub back_off: bool,
    /// Negotiated record size limit (plaintext bytes per record).
    pub record_size_limit: Option<u16>,
    pub multi_record: Option<bool>,
    pub multi_handshake: Option<bool>,
}

impl PackLimits {
    fn datagram_limit(&self) -> usize {
        if self.back_off {
            let rsl = self
                .record_size_limit
                .map(|l| l as usize)
                .unwrap_or(BACK_OFF_DATAGRAM_SIZE);
            BACK_OFF_DATAGRAM_SIZE.min(rsl)
        } else {
            self.mtu
        }
    }

    fn records_share_datagram(&self) -> bool {
        !self.back_off && self.multi_record != Some(false)
    }

    fn messages_share_record(&self) -> bool {
        !self.back_off && self.multi_handshake == Some(true)
    }
}

#[derive(Debug)]
enum FlightMessage {
    Handshake {
        epoch: u16,
        msg_type: MessageType,
        message_seq: u16,
        body: Buf,
    },
    ChangeCipherSpec {
        epoch: u16,
    },
}

/// An ordered batch of handshake messages awaiting the peer's next flight.
#[derive(Debug)]
pub struct Flight {
    number: u8,
    messages: Vec<FlightMessage>,
    /// `None` once the flight is the retained last flight of a handshake.
    timer: Option<RetransmissionTimer>,
    created: Instant,
}

impl Flight {
    pub fn new(number: u8, now: Instant) -> Self {
        Flight {
            number,
            messages: Vec::new(),
            timer: None,
            created: now,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn timer(&self) -> Option<&RetransmissionTimer> {
        self.timer.as_ref()
    }

    pub fn timer_mut(&mut self) -> Option<&mut RetransmissionTimer> {
        self.timer.as_mut()
    }

    pub fn set_timer(&mut self, timer: RetransmissionTimer) {
        self.timer = Some(timer);
    }

    /// Stop retransmitting. The flight is still resent on request.
    pub fn stop_timer(&mut self) {
        self.timer = None;
    }

    pub fn push_handshake(&mut self, epoch: u16, msg_type: MessageType, message_seq: u16, body: Buf) {
        self.messages.push(FlightMessage::Handshake {
            epoch,
            msg_type,
            message_seq,
            body,
        });
    }

    pub fn push_change_cipher_spec(&mut self, epoch: u16) {
        self.messages.push(FlightMessage::ChangeCipherSpec { epoch });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Serialize the flight into datagrams, fragmenting handshake messages as needed.
    pub fn datagrams(&self, writer: &mut dyn RecordWriter, limits: &PackLimits) -> Result<Vec<Buf>, Error> {
        let datagram_limit = limits.datagram_limit();

        // (content type, epoch, plaintext payload)
        let mut payloads: Vec<(ContentType, u16, Buf)> = Vec::new();

        for message in &self.messages {
            match message {
                FlightMessage::ChangeCipherSpec { epoch } => {
                    payloads.push((ContentType::ChangeCipherSpec, *epoch, Buf::from_slice(&[1])));
                }
                FlightMessage::Handshake {
                    epoch,
                    msg_type,
                    message_seq,
                    body,
                } => {
                    let mut max_payload = datagram_limit.saturating_sub(writer.overhead(*epoch));
                    if let Some(limit) = limits.record_size_limit {
                        max_payload = max_payload.min(limit as usize);
                    }
                    // Always make progress, even with absurd limits.
                    let max_body = max_payload.saturating_sub(Header::LEN).max(1);

                    let total = body.len();
                    let mut offset = 0;
                    loop {
                        let chunk = (total - offset).min(max_body);
                        let mut fragment = Buf::with_capacity(Header::LEN + chunk);
                        Header {
                            msg_type: *msg_type,
                            length: total as u32,
                            message_seq: *message_seq,
                            fragment_offset: offset as u32,
                            fragment_length: chunk as u32,
                        }
                        .serialize(&mut fragment);
                        fragment.extend_from_slice(&body[offset..offset + chunk]);

                        let merged = match payloads.last_mut() {
                            Some((ContentType::Handshake, e, prev))
                                if limits.messages_share_record()
                                    && *e == *epoch
                                    && prev.len() + fragment.len() <= max_payload =>
                            {
                                prev.extend_from_slice(&fragment);
                                true
                            }
                            _ => false,
                        };
                        if !merged {
                            payloads.push((ContentType::Handshake, *epoch, fragment));
                        }

                        offset += chunk;
                        if offset >= total {
                            break;
                        }
                    }
                }
            }
        }

        let mut datagrams: Vec<Buf> = Vec::new();
        let mut previous_was_ccs = false;

        for (content_type, epoch, payload) in payloads {
            let record = writer.write(content_type, epoch, &payload)?;

            let append = match datagrams.last() {
                Some(last) => {
                    let fits = last.len() + record.len() <= datagram_limit;
                    // CCS and the following Finished always travel together.
                    previous_was_ccs || (fits && limits.records_share_datagram())
                }
                None => false,
            };

            if append {
                if let Some(last) = datagrams.last_mut() {
                    last.extend_from_slice(&record);
                }
            } else {
                datagrams.push(record);
            }
            previous_was_ccs = content_type == ContentType::ChangeCipherSpec;
        }

        Ok(datagrams)
    }
}
