use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    #[default]
    Unknown,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageType::HelloRequest,
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            3 => MessageType::HelloVerifyRequest,
            11 => MessageType::Certificate,
            12 => MessageType::ServerKeyExchange,
            13 => MessageType::CertificateRequest,
            14 => MessageType::ServerHelloDone,
            15 => MessageType::CertificateVerify,
            16 => MessageType::ClientKeyExchange,
            20 => MessageType::Finished,
            _ => MessageType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::HelloRequest => 0,
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::HelloVerifyRequest => 3,
            MessageType::Certificate => 11,
            MessageType::ServerKeyExchange => 12,
            MessageType::CertificateRequest => 13,
            MessageType::ServerHelloDone => 14,
            MessageType::CertificateVerify => 15,
            MessageType::ClientKeyExchange => 16,
            MessageType::Finished => 20,
            MessageType::Unknown => 255,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], MessageType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct Header {
    pub msg_type: MessageType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl Header {
    /// msg_type(1) + length(3) + message_seq(2) + fragment_offset(3) + fragment_length(3)
    pub const LEN: usize = 12;

    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            Header {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.msg_type.as_u8());
        output.put_u24(self.length);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        output.put_u24(self.fragment_offset);
        output.put_u24(self.fragment_length);
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_offset > 0 || self.fragment_length < self.length
    }
}

/// A handshake fragment borrowed from a decrypted record.
#[derive(Debug, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub header: Header,
    pub body: &'a [u8],
}

impl<'a> Fragment<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Fragment<'a>> {
        let (input, header) = Header::parse(input)?;
        if header.fragment_offset as u64 + header.fragment_length as u64 > header.length as u64 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, body) = take(header.fragment_length as usize)(input)?;
        Ok((input, Fragment { header, body }))
    }

    /// All fragments of a record payload. Stops at the first malformed one.
    pub fn parse_all(mut input: &'a [u8]) -> Vec<Fragment<'a>> {
        let mut out = Vec::new();
        while !input.is_empty() {
            match Fragment::parse(input) {
                Ok((rest, f)) => {
                    out.push(f);
                    input = rest;
                }
                Err(_) => break,
            }
        }
        out
    }
}

/// Serialize a complete, unfragmented handshake message.
pub fn serialize_message(msg_type: MessageType, message_seq: u16, body: &[u8]) -> Buf {
    let mut out = Buf::with_capacity(Header::LEN + body.len());
    Header {
        msg_type,
        length: body.len() as u32,
        message_seq,
        fragment_offset: 0,
        fragment_length: body.len() as u32,
    }
    .serialize(&mut out);
    out.extend_from_slice(body);
    out
}
