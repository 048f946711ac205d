use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};
use rand::Rng;

use crate::buffer::Buf;

/// An identifier was constructed from a slice of the wrong length.
pub struct InvalidLength(&'static str, usize, usize, usize);

impl fmt::Debug for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for InvalidLength {}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incorrect variable ID ({}) length: {} <= {} <= {}",
            self.0, self.1, self.3, self.2,
        )
    }
}

macro_rules! var_array {
    ($name:ident, $min:expr, $max:expr) => {
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub const MAX_LEN: usize = $max;

            pub fn try_new(data: &[u8]) -> Result<Self, InvalidLength> {
                #[allow(unused_comparisons)]
                if data.len() < $min || data.len() > $max {
                    return Err(InvalidLength(stringify!($name), $min, $max, data.len()));
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok($name(array, data.len()))
            }

            pub fn empty() -> $name {
                $name([0; $max], 0)
            }

            /// Random identifier, `len` is clamped to the allowed range.
            pub fn random(len: usize) -> $name {
                #[allow(unused_comparisons)]
                let len = len.max($min).min($max);
                let mut t = rand::thread_rng();
                let mut arr = [0; $max];
                for a in &mut arr[..len] {
                    *a = t.gen();
                }
                Self(arr, len)
            }

            /// Parse an 8 bit length-prefixed identifier.
            pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, len) = be_u8(input)?;
                let (rest, data) = take(len as usize)(input)?;
                let instance = Self::try_new(data)
                    .map_err(|_| Err::Failure(Error::new(input, ErrorKind::LengthValue)))?;
                Ok((rest, instance))
            }

            /// Serialize with an 8 bit length prefix.
            pub fn serialize(&self, output: &mut Buf) {
                output.push(self.1 as u8);
                output.extend_from_slice(self);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:02x?})", stringify!($name), &self.0[..self.1])
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.deref() == other.deref()
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.deref().hash(state)
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }

        impl<'a> TryFrom<&'a [u8]> for $name {
            type Error = InvalidLength;

            fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }
    };
}

var_array!(SessionId, 0, 32);
var_array!(Cookie, 0, 255);
var_array!(ConnectionId, 0, 255);

impl ConnectionId {
    /// A connection id whose first byte carries the node id of a multi-node deployment.
    pub fn random_for_node(len: usize, node_id: Option<u8>) -> ConnectionId {
        let mut cid = Self::random(len);
        if let Some(node) = node_id {
            if cid.1 > 0 {
                cid.0[0] = node;
            }
        }
        cid
    }

    /// The node id carried in the first byte, when present.
    pub fn node_id(&self) -> Option<u8> {
        self.first().copied()
    }
}
