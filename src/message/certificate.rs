use nom::error::ErrorKind;
use nom::IResult;

use crate::buffer::Buf;
use crate::util::{fail, vec_u24};

/// `Certificate` message: an opaque chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub chain: Vec<Vec<u8>>,
}

impl Certificate {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Certificate> {
        let (rest, mut list) = vec_u24(input)?;
        let mut chain = Vec::new();
        while !list.is_empty() {
            let (r, cert) = vec_u24(list)?;
            if cert.is_empty() {
                return fail(r, ErrorKind::LengthValue);
            }
            chain.push(cert.to_vec());
            list = r;
        }
        Ok((rest, Certificate { chain }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        let total: usize = self.chain.iter().map(|c| 3 + c.len()).sum();
        output.put_u24(total as u32);
        for cert in &self.chain {
            output.put_u24(cert.len() as u32);
            output.extend_from_slice(cert);
        }
    }
}
