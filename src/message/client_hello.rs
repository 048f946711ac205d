use nom::error::ErrorKind;
use nom::number::complete::be_u16;
use nom::IResult;

use super::{Cookie, Extension, Random, SessionId};
use crate::buffer::Buf;
use crate::registry::CipherSuite;
use crate::types::ProtocolVersion;
use crate::util::{fail, vec_u16, vec_u8};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    /// Offered suite codes, unknown ones included.
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    pub fn new(
        random: Random,
        session_id: SessionId,
        cookie: Cookie,
        suites: &[CipherSuite],
        extensions: Vec<Extension>,
    ) -> Self {
        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cookie,
            cipher_suites: suites.iter().map(|s| s.as_u16()).collect(),
            compression_methods: vec![0],
            extensions,
        }
    }

    /// The offered suites known to the registry, in client order.
    pub fn offered_suites(&self) -> Vec<CipherSuite> {
        self.cipher_suites
            .iter()
            .filter_map(|c| CipherSuite::from_u16(*c))
            .collect()
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        let (input, suites) = vec_u16(input)?;
        if suites.is_empty() || suites.len() % 2 != 0 {
            return fail(input, ErrorKind::LengthValue);
        }
        let mut cipher_suites = Vec::with_capacity(suites.len() / 2);
        let mut suites = suites;
        while !suites.is_empty() {
            let (rest, code) = be_u16(suites)?;
            cipher_suites.push(code);
            suites = rest;
        }

        let (input, compression) = vec_u8(input)?;
        if !compression.contains(&0) {
            return fail(input, ErrorKind::Verify);
        }

        let (input, extensions) = Extension::parse_block(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods: compression.to_vec(),
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);
        output.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for code in &self.cipher_suites {
            output.extend_from_slice(&code.to_be_bytes());
        }
        output.push(self.compression_methods.len() as u8);
        output.extend_from_slice(&self.compression_methods);
        Extension::serialize_block(&self.extensions, output);
    }

    /// The fields a stateless cookie is computed over: everything up to the
    /// extensions, without the cookie itself.
    pub fn cookie_input(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        for code in &self.cipher_suites {
            output.extend_from_slice(&code.to_be_bytes());
        }
        output.extend_from_slice(&self.compression_methods);
    }
}
