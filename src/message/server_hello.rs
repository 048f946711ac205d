use nom::error::ErrorKind;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::{Extension, Random, SessionId};
use crate::buffer::Buf;
use crate::registry::CipherSuite;
use crate::types::ProtocolVersion;
use crate::util::fail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn new(
        random: Random,
        session_id: SessionId,
        cipher_suite: CipherSuite,
        extensions: Vec<Extension>,
    ) -> Self {
        ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cipher_suite,
            extensions,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, code) = be_u16(input)?;
        let Some(cipher_suite) = CipherSuite::from_u16(code) else {
            return fail(input, ErrorKind::Verify);
        };
        let (input, compression) = be_u8(input)?;
        if compression != 0 {
            return fail(input, ErrorKind::Verify);
        }
        let (input, extensions) = Extension::parse_block(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.extend_from_slice(&self.cipher_suite.as_u16().to_be_bytes());
        output.push(0);
        Extension::serialize_block(&self.extensions, output);
    }
}
