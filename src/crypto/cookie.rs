//! Stateless HelloVerifyRequest cookies (RFC 6347 §4.2.1).
//!
//! cookie = HMAC-SHA256(secret, client address ‖ ClientHello fields). The
//! secret rotates periodically; cookies made with the previous secret stay
//! valid for one more period.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::message::{ClientHello, Cookie};

const ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);

struct Secrets {
    current: Zeroizing<[u8; 32]>,
    previous: Option<Zeroizing<[u8; 32]>>,
    rotated_at: Option<Instant>,
}

pub(crate) struct CookieGenerator {
    secrets: Mutex<Secrets>,
}

impl CookieGenerator {
    pub fn new() -> Self {
        CookieGenerator {
            secrets: Mutex::new(Secrets {
                current: random_secret(),
                previous: None,
                rotated_at: None,
            }),
        }
    }

    pub fn generate(&self, now: Instant, peer: SocketAddr, hello: &ClientHello) -> Cookie {
        let key = {
            let mut secrets = self.secrets.lock();
            secrets.rotate(now);
            secrets.current.clone()
        };
        let Some(mac) = mac(&key, peer, hello) else {
            return Cookie::empty();
        };
        let tag = mac.finalize().into_bytes();
        Cookie::try_new(&tag).unwrap_or_else(|_| Cookie::empty())
    }

    /// Check the cookie carried in `hello` against the current and previous secret.
    pub fn verify(&self, now: Instant, peer: SocketAddr, hello: &ClientHello) -> bool {
        if hello.cookie.is_empty() {
            return false;
        }
        let (current, previous) = {
            let mut secrets = self.secrets.lock();
            secrets.rotate(now);
            (secrets.current.clone(), secrets.previous.clone())
        };

        let matches = |key: &[u8; 32]| {
            mac(key, peer, hello)
                .map(|m| m.verify_slice(&hello.cookie).is_ok())
                .unwrap_or(false)
        };
        matches(&current) || previous.map(|p| matches(&p)).unwrap_or(false)
    }
}

impl Secrets {
    fn rotate(&mut self, now: Instant) {
        let Some(at) = self.rotated_at else {
            self.rotated_at = Some(now);
            return;
        };
        if now.saturating_duration_since(at) < ROTATION_PERIOD {
            return;
        }
        trace!("Rotate cookie secret");
        let next = random_secret();
        self.previous = Some(std::mem::replace(&mut self.current, next));
        self.rotated_at = Some(now);
    }
}

fn random_secret() -> Zeroizing<[u8; 32]> {
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut secret[..]);
    secret
}

fn mac(key: &[u8; 32], peer: SocketAddr, hello: &ClientHello) -> Option<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).ok()?;
    match peer {
        SocketAddr::V4(a) => mac.update(&a.ip().octets()),
        SocketAddr::V6(a) => mac.update(&a.ip().octets()),
    }
    mac.update(&peer.port().to_be_bytes());

    let mut input = Buf::new();
    hello.cookie_input(&mut input);
    mac.update(&input);
    Some(mac)
}

impl std::fmt::Debug for CookieGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieGenerator").finish_non_exhaustive()
    }
}
