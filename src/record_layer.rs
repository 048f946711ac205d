//! Per connection record protection: epochs, sequence numbers, replay
//! filtering and `tls12_cid` framing.

use crate::buffer::Buf;
use crate::crypto::{Aad, RecordCipher, AEAD_OVERHEAD};
use crate::error::Error;
use crate::flight::RecordWriter;
use crate::message::{serialize_header, CidCodePoint, ConnectionId, Record};
use crate::types::{ContentType, Sequence};
use crate::window::ReplayWindow;

/// Result of opening one inbound record.
#[derive(Debug)]
pub(crate) enum Opened {
    /// Authenticated and fresh.
    Record {
        content_type: ContentType,
        sequence: Sequence,
        data: Buf,
    },
    /// Protected with an epoch we have no keys for yet.
    Future,
    /// Old epoch, replayed, or failed authentication.
    Dropped(&'static str),
}

#[derive(Debug)]
pub(crate) struct RecordLayer {
    read_epoch: u16,
    read_cipher: Option<RecordCipher>,
    pending_read: Option<RecordCipher>,

    write_epoch: u16,
    write_cipher: Option<RecordCipher>,
    pending_write: Option<RecordCipher>,

    /// Kept apart, flights started in epoch 0 are resent in epoch 0 even
    /// after we moved on to epoch 1.
    sequence_epoch_0: u64,
    sequence_epoch_n: u64,

    replay_epoch_0: ReplayWindow,
    replay: ReplayWindow,
    margin: u64,
    anti_replay: bool,

    /// The connection id the peer puts on records to us.
    read_cid: Option<ConnectionId>,
    /// The connection id we put on records to the peer.
    write_cid: Option<ConnectionId>,
    cid_code_point: CidCodePoint,
}

impl RecordLayer {
    pub fn new(anti_replay: bool, margin: u64) -> Self {
        RecordLayer {
            read_epoch: 0,
            read_cipher: None,
            pending_read: None,
            write_epoch: 0,
            write_cipher: None,
            pending_write: None,
            sequence_epoch_0: 0,
            sequence_epoch_n: 0,
            replay_epoch_0: ReplayWindow::new(margin),
            replay: ReplayWindow::new(margin),
            margin,
            anti_replay,
            read_cid: None,
            write_cid: None,
            cid_code_point: CidCodePoint::Standard,
        }
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    /// Continue epoch 0 at `sequence_number`. A server answering a ClientHello
    /// starts at the hello's record sequence number, so its first flight is
    /// not taken for a replay of the HelloVerifyRequest sent before.
    pub fn start_epoch_0_at(&mut self, sequence_number: u64) {
        self.sequence_epoch_0 = self.sequence_epoch_0.max(sequence_number);
    }

    /// Keys derived, waiting for ChangeCipherSpec in either direction.
    pub fn set_pending(&mut self, read: RecordCipher, write: RecordCipher) {
        self.pending_read = Some(read);
        self.pending_write = Some(write);
    }

    /// Negotiated connection ids. Empty ids mean "not used in that direction".
    pub fn set_connection_ids(
        &mut self,
        read: Option<ConnectionId>,
        write: Option<ConnectionId>,
        code_point: CidCodePoint,
    ) {
        self.read_cid = read.filter(|c| !c.is_empty());
        self.write_cid = write.filter(|c| !c.is_empty());
        self.cid_code_point = code_point;
    }

    pub fn read_cid(&self) -> Option<&ConnectionId> {
        self.read_cid.as_ref()
    }

    /// Switch our writes to the next epoch.
    pub fn activate_write(&mut self) -> Result<(), Error> {
        let Some(cipher) = self.pending_write.take() else {
            return Err(Error::Crypto("No pending write keys".to_string()));
        };
        self.write_cipher = Some(cipher);
        self.write_epoch += 1;
        self.sequence_epoch_n = 0;
        debug!("Write epoch {}", self.write_epoch);
        Ok(())
    }

    /// Peer sent ChangeCipherSpec.
    pub fn activate_read(&mut self) -> bool {
        let Some(cipher) = self.pending_read.take() else {
            return false;
        };
        self.read_cipher = Some(cipher);
        self.read_epoch += 1;
        self.replay = ReplayWindow::new(self.margin);
        debug!("Read epoch {}", self.read_epoch);
        true
    }

    /// Whether a ChangeCipherSpec from the peer can be honored now.
    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    /// Largest application payload that fits one record of the current write epoch.
    pub fn max_plaintext(&self, mtu: usize, peer_limit: Option<u16>) -> usize {
        let by_mtu = mtu.saturating_sub(self.overhead(self.write_epoch));
        let by_limit = peer_limit.map(|l| l as usize).unwrap_or(16384);
        by_mtu.min(by_limit).min(16384)
    }

    /// Authenticate and decrypt one record. The replay window is not
    /// updated, see [`RecordLayer::mark`].
    pub fn open(&mut self, record: &Record) -> Opened {
        let epoch = record.sequence.epoch;
        if epoch > self.read_epoch {
            return Opened::Future;
        }
        if epoch < self.read_epoch {
            return Opened::Dropped("old epoch");
        }

        let seqno = record.sequence.sequence_number;
        let window = if epoch == 0 {
            &self.replay_epoch_0
        } else {
            &self.replay
        };
        if self.anti_replay && !window.is_acceptable(seqno) {
            return Opened::Dropped("replay");
        }

        let (content_type, data) = if epoch == 0 {
            if record.content_type == ContentType::Tls12Cid {
                return Opened::Dropped("connection id in epoch 0");
            }
            (record.content_type, Buf::from_slice(record.fragment))
        } else {
            let Some(cipher) = &self.read_cipher else {
                return Opened::Dropped("no read keys");
            };
            match (&self.read_cid, record.content_type) {
                (Some(ours), ContentType::Tls12Cid) => {
                    if record.cid.as_ref() != Some(ours) {
                        return Opened::Dropped("connection id mismatch");
                    }
                    let sequence = record.sequence;
                    let cp = self.cid_code_point;
                    let cid: &[u8] = ours;
                    let opened = cipher.decrypt(
                        |len| match cp {
                            CidCodePoint::Standard => Aad::cid(sequence, cid, len),
                            CidCodePoint::Deprecated => Aad::cid_deprecated(sequence, cid, len),
                        },
                        record.fragment,
                    );
                    let Ok(inner) = opened else {
                        return Opened::Dropped("bad record mac");
                    };
                    match split_inner_plaintext(inner) {
                        Some(v) => v,
                        None => return Opened::Dropped("inner plaintext without type"),
                    }
                }
                (None, ContentType::Tls12Cid) => return Opened::Dropped("unexpected connection id"),
                (Some(_), _) => return Opened::Dropped("missing connection id"),
                (None, content_type) => {
                    let sequence = record.sequence;
                    let opened = cipher.decrypt(
                        |len| Aad::plain(content_type, sequence, len),
                        record.fragment,
                    );
                    let Ok(data) = opened else {
                        return Opened::Dropped("bad record mac");
                    };
                    (content_type, data)
                }
            }
        };

        Opened::Record {
            content_type,
            sequence: record.sequence,
            data,
        }
    }

    /// Record an opened record as received.
    ///
    /// Kept apart from [`RecordLayer::open`] so a record that has to be
    /// deferred can be opened again later.
    pub fn mark(&mut self, sequence: Sequence) {
        if sequence.epoch != self.read_epoch {
            return;
        }
        if sequence.epoch == 0 {
            self.replay_epoch_0.mark(sequence.sequence_number);
        } else {
            self.replay.mark(sequence.sequence_number);
        }
    }

    fn next_sequence(&mut self, epoch: u16) -> Result<Sequence, Error> {
        let counter = if epoch == 0 {
            &mut self.sequence_epoch_0
        } else {
            &mut self.sequence_epoch_n
        };
        if *counter > Sequence::MAX_SEQUENCE_NUMBER {
            return Err(Error::Crypto("Sequence number exhausted".to_string()));
        }
        let sequence = Sequence::new(epoch, *counter);
        *counter += 1;
        Ok(sequence)
    }

    /// Protect `payload` as a record of the current write epoch.
    pub fn seal_current(&mut self, content_type: ContentType, payload: &[u8]) -> Result<Buf, Error> {
        self.seal(content_type, self.write_epoch, payload)
    }

    fn seal(&mut self, content_type: ContentType, epoch: u16, payload: &[u8]) -> Result<Buf, Error> {
        let sequence = self.next_sequence(epoch)?;
        let mut out = Buf::new();

        if epoch == 0 {
            serialize_header(&mut out, content_type, sequence, None, payload.len());
            out.extend_from_slice(payload);
            return Ok(out);
        }

        let Some(cipher) = &self.write_cipher else {
            return Err(Error::Crypto(format!("No write keys for epoch {}", epoch)));
        };

        let explicit_nonce = sequence.to_bytes();

        let fragment = match &self.write_cid {
            Some(cid) => {
                let mut inner = Buf::with_capacity(payload.len() + 1);
                inner.extend_from_slice(payload);
                inner.push(content_type.as_u8());
                let aad = match self.cid_code_point {
                    CidCodePoint::Standard => Aad::cid(sequence, cid, inner.len()),
                    CidCodePoint::Deprecated => Aad::cid_deprecated(sequence, cid, inner.len()),
                };
                let fragment = cipher
                    .encrypt(&aad, explicit_nonce, &inner)
                    .map_err(Error::Crypto)?;
                serialize_header(
                    &mut out,
                    ContentType::Tls12Cid,
                    sequence,
                    Some(cid),
                    fragment.len(),
                );
                fragment
            }
            None => {
                let aad = Aad::plain(content_type, sequence, payload.len());
                let fragment = cipher
                    .encrypt(&aad, explicit_nonce, payload)
                    .map_err(Error::Crypto)?;
                serialize_header(&mut out, content_type, sequence, None, fragment.len());
                fragment
            }
        };

        out.extend_from_slice(&fragment);
        Ok(out)
    }
}

impl RecordWriter for RecordLayer {
    fn overhead(&self, epoch: u16) -> usize {
        if epoch == 0 {
            return Record::HEADER_LEN;
        }
        let cid = self.write_cid.as_ref().map(|c| c.len() + 1).unwrap_or(0);
        Record::HEADER_LEN + AEAD_OVERHEAD + cid
    }

    fn write(&mut self, content_type: ContentType, epoch: u16, payload: &[u8]) -> Result<Buf, Error> {
        self.seal(content_type, epoch, payload)
    }
}

/// DTLSInnerPlaintext: content ‖ real type ‖ zero padding.
fn split_inner_plaintext(mut inner: Buf) -> Option<(ContentType, Buf)> {
    let pos = inner.iter().rposition(|b| *b != 0)?;
    let content_type = ContentType::from_u8(inner[pos]);
    inner.truncate(pos);
    Some((content_type, inner))
}

/// Tracks the newest accepted record of a connection.
///
/// The peer address is only rebound on records strictly newer than every
/// record seen before, so a replayed old record cannot redirect traffic.
#[derive(Debug, Default)]
pub(crate) struct AddressTracker {
    newest: Option<Sequence>,
}

impl AddressTracker {
    /// Register an accepted record. True if it is the newest so far.
    pub fn observe(&mut self, sequence: Sequence) -> bool {
        match self.newest {
            Some(newest) if sequence <= newest => false,
            _ => {
                self.newest = Some(sequence);
                true
            }
        }
    }
}
