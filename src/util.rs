use std::ops::RangeFrom;

use nom::bytes::complete::take;
use nom::error::{make_error, ErrorKind, ParseError};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult, InputIter, InputLength, Slice};

pub fn be_u48<I, E: ParseError<I>>(input: I) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let bound: usize = 6;

    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u64;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u64;
        }

        Ok((input.slice(bound..), res))
    }
}

/// `opaque data<0..2^8-1>`
pub fn vec_u8(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u8(input)?;
    take(len as usize)(input)
}

/// `opaque data<0..2^16-1>`
pub fn vec_u16(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u16(input)?;
    take(len as usize)(input)
}

/// `opaque data<0..2^24-1>`
pub fn vec_u24(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u24(input)?;
    take(len as usize)(input)
}

/// Failure that aborts parsing, used for semantic checks after a successful read.
pub fn fail<T>(input: &[u8], kind: ErrorKind) -> IResult<&[u8], T> {
    Err(Err::Failure(nom::error::Error::new(input, kind)))
}

/// Run `parser` over a whole message body. Trailing bytes count as malformed.
pub fn parse_exact<'a, T>(
    input: &'a [u8],
    mut parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
) -> Option<T> {
    match parser(input) {
        Ok((rest, value)) if rest.is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_48_bits() {
        let (rest, v) = be_u48::<_, nom::error::Error<&[u8]>>(&[0, 0, 0, 0, 1, 2, 9][..]).unwrap();
        assert_eq!(v, 0x0102);
        assert_eq!(rest, &[9]);
    }

    #[test]
    fn length_prefixed_vectors() {
        let (rest, v) = vec_u16(&[0, 2, 0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(v, &[0xaa, 0xbb]);
        assert_eq!(rest, &[0xcc]);

        assert!(vec_u8(&[3, 1]).is_err());
        let (_, v) = vec_u24(&[0, 0, 1, 7]).unwrap();
        assert_eq!(v, &[7]);
    }
}
