//! `ServerKeyExchange` and `ClientKeyExchange` for the PSK, ECDHE_PSK and
//! ECDHE_ECDSA key exchanges.

use nom::bytes::complete::take;
use nom::error::ErrorKind;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::buffer::Buf;
use crate::registry::{KeyExchange, NamedGroup, SignatureAndHashAlgorithm};
use crate::util::{fail, vec_u16, vec_u8};

/// `ECCurveType.named_curve`
const NAMED_CURVE: u8 = 3;

/// Ephemeral ECDH parameters offered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcParameters {
    pub group: NamedGroup,
    /// Encoded public point.
    pub public: Vec<u8>,
}

impl EcParameters {
    pub fn parse(input: &[u8]) -> IResult<&[u8], EcParameters> {
        let (input, curve_type) = be_u8(input)?;
        if curve_type != NAMED_CURVE {
            return fail(input, ErrorKind::Tag);
        }
        let (input, group) = NamedGroup::parse(input)?;
        let (input, public) = vec_u8(input)?;
        if public.is_empty() {
            return fail(input, ErrorKind::LengthValue);
        }
        Ok((
            input,
            EcParameters {
                group,
                public: public.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(NAMED_CURVE);
        output.extend_from_slice(&self.group.as_u16().to_be_bytes());
        output.push(self.public.len() as u8);
        output.extend_from_slice(&self.public);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitallySigned {
    pub algorithm: SignatureAndHashAlgorithm,
    pub signature: Vec<u8>,
}

impl DigitallySigned {
    pub fn parse(input: &[u8]) -> IResult<&[u8], DigitallySigned> {
        let (input, algorithm) = SignatureAndHashAlgorithm::parse(input)?;
        let (input, signature_len) = be_u16(input)?;
        let (input, signature) = take(signature_len)(input)?;
        Ok((
            input,
            DigitallySigned {
                algorithm,
                signature: signature.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.algorithm.serialize(output);
        output.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        output.extend_from_slice(&self.signature);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerKeyExchange {
    Psk {
        hint: Vec<u8>,
    },
    EcdhePsk {
        hint: Vec<u8>,
        params: EcParameters,
    },
    EcdheEcdsa {
        params: EcParameters,
        signed: DigitallySigned,
    },
}

impl ServerKeyExchange {
    pub fn parse(input: &[u8], key_exchange: KeyExchange) -> IResult<&[u8], ServerKeyExchange> {
        match key_exchange {
            KeyExchange::Psk => {
                let (input, hint) = vec_u16(input)?;
                Ok((
                    input,
                    ServerKeyExchange::Psk {
                        hint: hint.to_vec(),
                    },
                ))
            }
            KeyExchange::EcdhePsk => {
                let (input, hint) = vec_u16(input)?;
                let (input, params) = EcParameters::parse(input)?;
                Ok((
                    input,
                    ServerKeyExchange::EcdhePsk {
                        hint: hint.to_vec(),
                        params,
                    },
                ))
            }
            KeyExchange::EcdheEcdsa => {
                let (input, params) = EcParameters::parse(input)?;
                let (input, signed) = DigitallySigned::parse(input)?;
                Ok((input, ServerKeyExchange::EcdheEcdsa { params, signed }))
            }
            KeyExchange::Null => fail(input, ErrorKind::Switch),
        }
    }

    pub fn serialize(&self, output: &mut Buf) {
        match self {
            ServerKeyExchange::Psk { hint } => put_vec_u16(output, hint),
            ServerKeyExchange::EcdhePsk { hint, params } => {
                put_vec_u16(output, hint);
                params.serialize(output);
            }
            ServerKeyExchange::EcdheEcdsa { params, signed } => {
                params.serialize(output);
                signed.serialize(output);
            }
        }
    }

    pub fn params(&self) -> Option<&EcParameters> {
        match self {
            ServerKeyExchange::Psk { .. } => None,
            ServerKeyExchange::EcdhePsk { params, .. } => Some(params),
            ServerKeyExchange::EcdheEcdsa { params, .. } => Some(params),
        }
    }

    pub fn hint(&self) -> Option<&[u8]> {
        match self {
            ServerKeyExchange::Psk { hint } | ServerKeyExchange::EcdhePsk { hint, .. } => {
                (!hint.is_empty()).then_some(hint.as_slice())
            }
            ServerKeyExchange::EcdheEcdsa { .. } => None,
        }
    }
}

/// The bytes covered by the `ServerKeyExchange` signature.
pub fn signed_params(client_random: &[u8], server_random: &[u8], params: &EcParameters) -> Buf {
    let mut out = Buf::with_capacity(64 + 4 + params.public.len());
    out.extend_from_slice(client_random);
    out.extend_from_slice(server_random);
    params.serialize(&mut out);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKeyExchange {
    Psk { identity: Vec<u8> },
    EcdhePsk { identity: Vec<u8>, public: Vec<u8> },
    EcdheEcdsa { public: Vec<u8> },
}

impl ClientKeyExchange {
    pub fn parse(input: &[u8], key_exchange: KeyExchange) -> IResult<&[u8], ClientKeyExchange> {
        match key_exchange {
            KeyExchange::Psk => {
                let (input, identity) = vec_u16(input)?;
                Ok((
                    input,
                    ClientKeyExchange::Psk {
                        identity: identity.to_vec(),
                    },
                ))
            }
            KeyExchange::EcdhePsk => {
                let (input, identity) = vec_u16(input)?;
                let (input, public) = vec_u8(input)?;
                if public.is_empty() {
                    return fail(input, ErrorKind::LengthValue);
                }
                Ok((
                    input,
                    ClientKeyExchange::EcdhePsk {
                        identity: identity.to_vec(),
                        public: public.to_vec(),
                    },
                ))
            }
            KeyExchange::EcdheEcdsa => {
                let (input, public) = vec_u8(input)?;
                if public.is_empty() {
                    return fail(input, ErrorKind::LengthValue);
                }
                Ok((
                    input,
                    ClientKeyExchange::EcdheEcdsa {
                        public: public.to_vec(),
                    },
                ))
            }
            KeyExchange::Null => fail(input, ErrorKind::Switch),
        }
    }

    pub fn serialize(&self, output: &mut Buf) {
        match self {
            ClientKeyExchange::Psk { identity } => put_vec_u16(output, identity),
            ClientKeyExchange::EcdhePsk { identity, public } => {
                put_vec_u16(output, identity);
                output.push(public.len() as u8);
                output.extend_from_slice(public);
            }
            ClientKeyExchange::EcdheEcdsa { public } => {
                output.push(public.len() as u8);
                output.extend_from_slice(public);
            }
        }
    }

    pub fn identity(&self) -> Option<&[u8]> {
        match self {
            ClientKeyExchange::Psk { identity } | ClientKeyExchange::EcdhePsk { identity, .. } => {
                Some(identity)
            }
            ClientKeyExchange::EcdheEcdsa { .. } => None,
        }
    }

    pub fn public(&self) -> Option<&[u8]> {
        match self {
            ClientKeyExchange::Psk { .. } => None,
            ClientKeyExchange::EcdhePsk { public, .. } | ClientKeyExchange::EcdheEcdsa { public } => {
                Some(public)
            }
        }
    }
}

fn put_vec_u16(output: &mut Buf, data: &[u8]) {
    output.extend_from_slice(&(data.len() as u16).to_be_bytes());
    output.extend_from_slice(data);
}
