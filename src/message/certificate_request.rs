use nom::error::ErrorKind;
use nom::IResult;

use super::DigitallySigned;
use crate::buffer::Buf;
use crate::registry::SignatureAndHashAlgorithm;
use crate::util::{fail, vec_u16, vec_u8};

/// `ClientCertificateType.ecdsa_sign` (RFC 8422 §5.5).
pub const ECDSA_SIGN: u8 = 64;

/// `CertificateRequest` (RFC 5246 §7.4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub certificate_types: Vec<u8>,
    pub signature_algorithms: Vec<SignatureAndHashAlgorithm>,
    /// DER encoded distinguished names. We never send any.
    pub certificate_authorities: Vec<Vec<u8>>,
}

impl CertificateRequest {
    /// Ask for an ECDSA certificate signed with one of `signature_algorithms`.
    pub fn ecdsa(signature_algorithms: Vec<SignatureAndHashAlgorithm>) -> Self {
        CertificateRequest {
            certificate_types: vec![ECDSA_SIGN],
            signature_algorithms,
            certificate_authorities: Vec::new(),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CertificateRequest> {
        let (input, types) = vec_u8(input)?;
        if types.is_empty() {
            return fail(input, ErrorKind::LengthValue);
        }

        let (input, mut list) = vec_u16(input)?;
        if list.len() % 2 != 0 {
            return fail(input, ErrorKind::LengthValue);
        }
        let mut signature_algorithms = Vec::with_capacity(list.len() / 2);
        while !list.is_empty() {
            let (rest, algorithm) = SignatureAndHashAlgorithm::parse(list)?;
            signature_algorithms.push(algorithm);
            list = rest;
        }

        let (rest, mut names) = vec_u16(input)?;
        let mut certificate_authorities = Vec::new();
        while !names.is_empty() {
            let (r, name) = vec_u16(names)?;
            if name.is_empty() {
                return fail(r, ErrorKind::LengthValue);
            }
            certificate_authorities.push(name.to_vec());
            names = r;
        }

        Ok((
            rest,
            CertificateRequest {
                certificate_types: types.to_vec(),
                signature_algorithms,
                certificate_authorities,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.certificate_types.len() as u8);
        output.extend_from_slice(&self.certificate_types);

        output.extend_from_slice(&((self.signature_algorithms.len() * 2) as u16).to_be_bytes());
        for algorithm in &self.signature_algorithms {
            algorithm.serialize(output);
        }

        let total: usize = self.certificate_authorities.iter().map(|n| 2 + n.len()).sum();
        output.extend_from_slice(&(total as u16).to_be_bytes());
        for name in &self.certificate_authorities {
            output.extend_from_slice(&(name.len() as u16).to_be_bytes());
            output.extend_from_slice(name);
        }
    }

    pub fn accepts_ecdsa(&self) -> bool {
        self.certificate_types.contains(&ECDSA_SIGN)
    }
}

/// `CertificateVerify` (RFC 5246 §7.4.8): the client's signature over the
/// handshake messages so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signed: DigitallySigned,
}

impl CertificateVerify {
    pub fn parse(input: &[u8]) -> IResult<&[u8], CertificateVerify> {
        let (rest, signed) = DigitallySigned::parse(input)?;
        if signed.signature.is_empty() {
            return fail(rest, ErrorKind::LengthValue);
        }
        Ok((rest, CertificateVerify { signed }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.signed.serialize(output);
    }
}
