//! DTLS 1.2 record framing, including `tls12_cid` records (RFC 9146).

use std::fmt;

use nom::bytes::complete::take;
use nom::error::ErrorKind;
use nom::number::complete::be_u16;
use nom::{Err, IResult};

use super::ConnectionId;
use crate::buffer::Buf;
use crate::types::{ContentType, ProtocolVersion, Sequence};
use crate::util::be_u48;

/// A record borrowed from an inbound datagram.
#[derive(PartialEq, Eq)]
pub struct Record<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    /// Present for `tls12_cid` records.
    pub cid: Option<ConnectionId>,
    /// Record payload (ciphertext for protected epochs).
    pub fragment: &'a [u8],
    /// The complete record, header included.
    pub raw: &'a [u8],
}

impl<'a> Record<'a> {
    /// content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
    pub const HEADER_LEN: usize = 13;

    /// Largest ciphertext fragment accepted (2^14 + 2048).
    pub const MAX_FRAGMENT_LEN: usize = 16384 + 2048;

    /// Parse one record. `cid_len` is the length of the connection ids we issue;
    /// a `tls12_cid` record is only parseable when it is known.
    pub fn parse(input: &'a [u8], cid_len: Option<usize>) -> IResult<&'a [u8], Record<'a>> {
        let original = input;
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;

        // DTLS 1.0 is accepted in the record layer of the first flight.
        if !matches!(version, ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2) {
            return Err(Err::Failure(nom::error::Error::new(input, ErrorKind::Tag)));
        }

        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;

        let (input, cid) = if content_type == ContentType::Tls12Cid {
            let Some(len) = cid_len else {
                return Err(Err::Failure(nom::error::Error::new(input, ErrorKind::Verify)));
            };
            let (input, cid) = take(len)(input)?;
            let cid = ConnectionId::try_new(cid)
                .map_err(|_| Err::Failure(nom::error::Error::new(input, ErrorKind::LengthValue)))?;
            (input, Some(cid))
        } else {
            (input, None)
        };

        let (input, length) = be_u16(input)?;
        if length as usize > Self::MAX_FRAGMENT_LEN {
            return Err(Err::Failure(nom::error::Error::new(input, ErrorKind::TooLarge)));
        }
        let (rest, fragment) = take(length as usize)(input)?;

        let raw_len = original.len() - rest.len();

        Ok((
            rest,
            Record {
                content_type,
                version,
                sequence: Sequence::new(epoch, sequence_number),
                cid,
                fragment,
                raw: &original[..raw_len],
            },
        ))
    }

    /// Parse all records of a datagram. Parsing stops at the first malformed record;
    /// the records before it are kept.
    pub fn parse_datagram(datagram: &'a [u8], cid_len: Option<usize>) -> Vec<Record<'a>> {
        let mut records = Vec::new();
        let mut input = datagram;
        while !input.is_empty() {
            match Record::parse(input, cid_len) {
                Ok((rest, record)) => {
                    records.push(record);
                    input = rest;
                }
                Err(e) => {
                    trace!("Drop remainder of datagram ({} bytes): {:?}", input.len(), e);
                    break;
                }
            }
        }
        records
    }
}

/// Write a record header. `length` is the length of the payload that follows.
pub fn serialize_header(
    output: &mut Buf,
    content_type: ContentType,
    sequence: Sequence,
    cid: Option<&ConnectionId>,
    length: usize,
) {
    output.push(content_type.as_u8());
    ProtocolVersion::DTLS1_2.serialize(output);
    output.extend_from_slice(&sequence.epoch.to_be_bytes());
    output.put_u48(sequence.sequence_number);
    if let Some(cid) = cid {
        output.extend_from_slice(cid);
    }
    output.extend_from_slice(&(length as u16).to_be_bytes());
}

impl fmt::Debug for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("content_type", &self.content_type)
            .field("version", &self.version)
            .field("sequence", &self.sequence)
            .field("cid", &self.cid)
            .field("length", &self.fragment.len())
            .finish()
    }
}
