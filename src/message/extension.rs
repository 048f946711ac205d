use nom::number::complete::be_u16;
use nom::IResult;

use super::ConnectionId;
use crate::buffer::Buf;
use crate::registry::{NamedGroup, SignatureAndHashAlgorithm};
use crate::util::{vec_u16, vec_u8};

/// Extension code point carrying a connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CidCodePoint {
    /// RFC 9146.
    Standard,
    /// Pre-standard draft code point, paired with the legacy record MAC input.
    Deprecated,
}

impl CidCodePoint {
    pub fn as_u16(&self) -> u16 {
        match self {
            CidCodePoint::Standard => 54,
            CidCodePoint::Deprecated => 53,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    SupportedGroups(Vec<NamedGroup>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<SignatureAndHashAlgorithm>),
    ExtendedMasterSecret,
    RecordSizeLimit(u16),
    ConnectionId(CidCodePoint, ConnectionId),
    Unknown(u16),
}

impl Extension {
    pub const UNCOMPRESSED_POINT_FORMAT: u8 = 0;

    pub fn extension_type(&self) -> u16 {
        match self {
            Extension::SupportedGroups(_) => 10,
            Extension::EcPointFormats(_) => 11,
            Extension::SignatureAlgorithms(_) => 13,
            Extension::ExtendedMasterSecret => 23,
            Extension::RecordSizeLimit(_) => 28,
            Extension::ConnectionId(cp, _) => cp.as_u16(),
            Extension::Unknown(t) => *t,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Extension> {
        let (input, extension_type) = be_u16(input)?;
        let (rest, data) = vec_u16(input)?;

        let ext = match extension_type {
            10 => {
                let (_, list) = vec_u16(data)?;
                let mut groups = Vec::new();
                let mut list = list;
                while !list.is_empty() {
                    let (r, g) = NamedGroup::parse(list)?;
                    groups.push(g);
                    list = r;
                }
                Extension::SupportedGroups(groups)
            }
            11 => {
                let (_, formats) = vec_u8(data)?;
                Extension::EcPointFormats(formats.to_vec())
            }
            13 => {
                let (_, list) = vec_u16(data)?;
                let mut algs = Vec::new();
                let mut list = list;
                while !list.is_empty() {
                    let (r, a) = SignatureAndHashAlgorithm::parse(list)?;
                    algs.push(a);
                    list = r;
                }
                Extension::SignatureAlgorithms(algs)
            }
            23 => Extension::ExtendedMasterSecret,
            28 => {
                let (_, limit) = be_u16(data)?;
                Extension::RecordSizeLimit(limit)
            }
            53 | 54 => {
                let (_, cid) = ConnectionId::parse(data)?;
                let cp = if extension_type == 54 {
                    CidCodePoint::Standard
                } else {
                    CidCodePoint::Deprecated
                };
                Extension::ConnectionId(cp, cid)
            }
            other => Extension::Unknown(other),
        };

        Ok((rest, ext))
    }

    pub fn serialize(&self, output: &mut Buf) {
        let mut data = Buf::new();
        match self {
            Extension::SupportedGroups(groups) => {
                data.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
                for g in groups {
                    data.extend_from_slice(&g.as_u16().to_be_bytes());
                }
            }
            Extension::EcPointFormats(formats) => {
                data.push(formats.len() as u8);
                data.extend_from_slice(formats);
            }
            Extension::SignatureAlgorithms(algs) => {
                data.extend_from_slice(&((algs.len() * 2) as u16).to_be_bytes());
                for a in algs {
                    a.serialize(&mut data);
                }
            }
            Extension::ExtendedMasterSecret => {}
            Extension::RecordSizeLimit(limit) => {
                data.extend_from_slice(&limit.to_be_bytes());
            }
            Extension::ConnectionId(_, cid) => cid.serialize(&mut data),
            // Never sent.
            Extension::Unknown(_) => return,
        }
        output.extend_from_slice(&self.extension_type().to_be_bytes());
        output.extend_from_slice(&(data.len() as u16).to_be_bytes());
        output.extend_from_slice(&data);
    }

    /// Parse the optional extensions block at the end of a hello message.
    pub fn parse_block(input: &[u8]) -> IResult<&[u8], Vec<Extension>> {
        if input.is_empty() {
            return Ok((input, Vec::new()));
        }
        let (rest, mut data) = vec_u16(input)?;
        let mut extensions = Vec::new();
        while !data.is_empty() {
            let (r, ext) = Extension::parse(data)?;
            extensions.push(ext);
            data = r;
        }
        Ok((rest, extensions))
    }

    /// Serialize an extensions block, omitted entirely when there are none.
    pub fn serialize_block(extensions: &[Extension], output: &mut Buf) {
        if extensions.is_empty() {
            return;
        }
        let mut block = Buf::new();
        for ext in extensions {
            ext.serialize(&mut block);
        }
        output.extend_from_slice(&(block.len() as u16).to_be_bytes());
        output.extend_from_slice(&block);
    }
}

/// Lookups over a parsed extension list.
pub trait ExtensionsExt {
    fn supported_groups(&self) -> Option<&[NamedGroup]>;
    fn signature_algorithms(&self) -> Option<&[SignatureAndHashAlgorithm]>;
    fn has_extended_master_secret(&self) -> bool;
    fn record_size_limit(&self) -> Option<u16>;
    fn connection_id(&self) -> Option<(CidCodePoint, ConnectionId)>;
    fn ec_point_formats(&self) -> Option<&[u8]>;
}

impl ExtensionsExt for [Extension] {
    fn supported_groups(&self) -> Option<&[NamedGroup]> {
        self.iter().find_map(|e| match e {
            Extension::SupportedGroups(g) => Some(g.as_slice()),
            _ => None,
        })
    }

    fn signature_algorithms(&self) -> Option<&[SignatureAndHashAlgorithm]> {
        self.iter().find_map(|e| match e {
            Extension::SignatureAlgorithms(a) => Some(a.as_slice()),
            _ => None,
        })
    }

    fn has_extended_master_secret(&self) -> bool {
        self.iter().any(|e| *e == Extension::ExtendedMasterSecret)
    }

    fn record_size_limit(&self) -> Option<u16> {
        self.iter().find_map(|e| match e {
            Extension::RecordSizeLimit(l) => Some(*l),
            _ => None,
        })
    }

    /// The standard code point wins when both are present.
    fn connection_id(&self) -> Option<(CidCodePoint, ConnectionId)> {
        let mut found = None;
        for e in self {
            if let Extension::ConnectionId(cp, cid) = e {
                if *cp == CidCodePoint::Standard || found.is_none() {
                    found = Some((*cp, *cid));
                }
            }
        }
        found
    }

    fn ec_point_formats(&self) -> Option<&[u8]> {
        self.iter().find_map(|e| match e {
            Extension::EcPointFormats(f) => Some(f.as_slice()),
            _ => None,
        })
    }
}
