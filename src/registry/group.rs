use nom::number::complete::be_u16;
use nom::IResult;

/// Named groups (elliptic curves) from the TLS supported groups registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    Secp256k1,
    Secp256r1,
    Secp384r1,
    Secp521r1,
    BrainpoolP256r1,
    BrainpoolP384r1,
    BrainpoolP512r1,
    X25519,
    X448,
    Unknown(u16),
}

impl NamedGroup {
    pub fn from_u16(value: u16) -> Self {
        match value {
            22 => NamedGroup::Secp256k1,
            23 => NamedGroup::Secp256r1,
            24 => NamedGroup::Secp384r1,
            25 => NamedGroup::Secp521r1,
            26 => NamedGroup::BrainpoolP256r1,
            27 => NamedGroup::BrainpoolP384r1,
            28 => NamedGroup::BrainpoolP512r1,
            29 => NamedGroup::X25519,
            30 => NamedGroup::X448,
            _ => NamedGroup::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            NamedGroup::Secp256k1 => 22,
            NamedGroup::Secp256r1 => 23,
            NamedGroup::Secp384r1 => 24,
            NamedGroup::Secp521r1 => 25,
            NamedGroup::BrainpoolP256r1 => 26,
            NamedGroup::BrainpoolP384r1 => 27,
            NamedGroup::BrainpoolP512r1 => 28,
            NamedGroup::X25519 => 29,
            NamedGroup::X448 => 30,
            NamedGroup::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], NamedGroup> {
        let (input, value) = be_u16(input)?;
        Ok((input, NamedGroup::from_u16(value)))
    }

    /// Groups with a key agreement implementation available at runtime.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            NamedGroup::X25519 | NamedGroup::Secp256r1 | NamedGroup::Secp384r1
        )
    }

    /// Groups marked as recommended in the IANA registry.
    pub fn is_recommended(&self) -> bool {
        matches!(
            self,
            NamedGroup::Secp256r1
                | NamedGroup::Secp384r1
                | NamedGroup::Secp521r1
                | NamedGroup::X25519
                | NamedGroup::X448
        )
    }

    /// Default preference order when no groups are configured.
    pub fn preferred() -> &'static [NamedGroup] {
        &[NamedGroup::X25519, NamedGroup::Secp256r1, NamedGroup::Secp384r1]
    }
}
