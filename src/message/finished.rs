use crate::buffer::Buf;
use nom::bytes::complete::take;
use nom::IResult;

#[derive(Debug, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: [u8; Finished::VERIFY_DATA_LEN],
}

impl Finished {
    /// All supported suites use the default verify_data length.
    pub const VERIFY_DATA_LEN: usize = 12;

    pub fn new(verify_data: [u8; Self::VERIFY_DATA_LEN]) -> Self {
        Finished { verify_data }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Finished> {
        let (input, data) = take(Self::VERIFY_DATA_LEN)(input)?;
        let mut verify_data = [0; Self::VERIFY_DATA_LEN];
        verify_data.copy_from_slice(data);
        Ok((input, Finished { verify_data }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.verify_data);
    }
}
