use super::Cookie;
use crate::buffer::Buf;
use crate::types::ProtocolVersion;
use nom::error::{Error, ErrorKind};
use nom::IResult;

/// Stateless cookie challenge (RFC 6347 §4.2.1).
///
/// The version is not a negotiation result. The server answers with the
/// version the client announced, or a configured one, and negotiates in the
/// ServerHello once the client proved it owns its address.
#[derive(Debug, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    /// Challenge a ClientHello announcing `client_version`.
    ///
    /// Anything older than DTLS 1.2 is answered with DTLS 1.0, the oldest
    /// version a DTLS 1.2 client accepts here.
    pub fn reply_to(client_version: ProtocolVersion, fixed: Option<ProtocolVersion>, cookie: Cookie) -> Self {
        let server_version = fixed.unwrap_or(match client_version {
            ProtocolVersion::DTLS1_2 => ProtocolVersion::DTLS1_2,
            // DTLS versions count down from 0xFEFF, a smaller number is newer.
            ProtocolVersion::Unknown(v) if (0xFE00..0xFEFD).contains(&v) => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::DTLS1_0,
        });
        HelloVerifyRequest { server_version, cookie }
    }

    /// Whether a client should answer this challenge at all.
    pub fn has_acceptable_version(&self) -> bool {
        matches!(self.server_version, ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (rest, cookie) = Cookie::parse(input)?;

        if cookie.is_empty() {
            return Err(nom::Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }

        Ok((rest, HelloVerifyRequest { server_version, cookie }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie() -> Cookie {
        Cookie::try_new(&[0xBB]).unwrap()
    }

    #[test]
    fn answers_with_client_version() {
        let hvr = HelloVerifyRequest::reply_to(ProtocolVersion::DTLS1_2, None, cookie());
        let mut out = Buf::new();
        hvr.serialize(&mut out);
        assert_eq!(&*out, &[0xFE, 0xFD, 0x01, 0xBB]);

        let (rest, parsed) = HelloVerifyRequest::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hvr);
    }

    #[test]
    fn old_clients_get_dtls_1_0() {
        let hvr = HelloVerifyRequest::reply_to(ProtocolVersion::DTLS1_0, None, cookie());
        assert_eq!(hvr.server_version, ProtocolVersion::DTLS1_0);

        // The unassigned DTLS 1.1 code point.
        let hvr = HelloVerifyRequest::reply_to(ProtocolVersion::Unknown(0xFEFE), None, cookie());
        assert_eq!(hvr.server_version, ProtocolVersion::DTLS1_0);

        // The pre-standard OpenSSL version.
        let hvr = HelloVerifyRequest::reply_to(ProtocolVersion::Unknown(0x0100), None, cookie());
        assert_eq!(hvr.server_version, ProtocolVersion::DTLS1_0);

        // DTLS 1.3 clients still get a 1.2 challenge.
        let hvr = HelloVerifyRequest::reply_to(ProtocolVersion::Unknown(0xFEFC), None, cookie());
        assert_eq!(hvr.server_version, ProtocolVersion::DTLS1_2);
    }

    #[test]
    fn fixed_version_wins() {
        let hvr = HelloVerifyRequest::reply_to(
            ProtocolVersion::DTLS1_2,
            Some(ProtocolVersion::DTLS1_0),
            cookie(),
        );
        assert_eq!(hvr.server_version, ProtocolVersion::DTLS1_0);
        assert!(hvr.has_acceptable_version());
    }

    #[test]
    fn tls_version_is_not_acceptable() {
        let (_, hvr) = HelloVerifyRequest::parse(&[0x03, 0x03, 0x01, 0xBB]).unwrap();
        assert!(!hvr.has_acceptable_version());
    }

    #[test]
    fn empty_cookie() {
        assert!(matches!(
            HelloVerifyRequest::parse(&[0xFE, 0xFD, 0x00]),
            Err(nom::Err::Failure(_))
        ));
    }
}
