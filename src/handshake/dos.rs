//! Whether an initial ClientHello must prove ownership of its source address
//! (RFC 6347 §4.2.1) before the server allocates any state.

use crate::config::{Config, HelloVerifyMode};
use crate::message::{ClientHello, SessionId};

/// Facts about a ClientHello gathered by the connector.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HelloFacts<'a> {
    /// The hello carries a cookie we issued for this address.
    pub cookie_valid: bool,
    /// The client offers a PSK suite we also accept.
    pub shares_psk_suite: bool,
    /// The session the hello asks to resume is known and may be resumed.
    pub resumable: bool,
    /// Session of the connection currently bound to the source address.
    pub address_session: Option<&'a SessionId>,
    /// Resumption handshakes in progress that skipped the challenge.
    pub pending_unverified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Allocate state. `verified` is false for a resumption skipping the challenge.
    Proceed { verified: bool },
    /// Answer with a HelloVerifyRequest.
    Challenge,
}

pub(crate) fn decide(config: &Config, hello: &ClientHello, facts: &HelloFacts) -> Verdict {
    if facts.cookie_valid {
        return Verdict::Proceed { verified: true };
    }

    match config.hello_verify_request() {
        HelloVerifyMode::Disabled => return Verdict::Proceed { verified: true },
        HelloVerifyMode::NotForPsk if facts.shares_psk_suite => {
            return Verdict::Proceed { verified: true }
        }
        _ => {}
    }

    if may_skip_for_resumption(config, hello, facts) {
        return Verdict::Proceed { verified: false };
    }

    Verdict::Challenge
}

fn may_skip_for_resumption(config: &Config, hello: &ClientHello, facts: &HelloFacts) -> bool {
    let threshold = config.verify_peers_on_resumption_threshold() as usize;
    if threshold == 0 || hello.session_id.is_empty() || !facts.resumable {
        return false;
    }

    // A different session bound to this address always needs proof of ownership.
    if let Some(bound) = facts.address_session {
        if *bound != hello.session_id {
            return false;
        }
    }

    // The threshold is a percentage of the store capacity, boundary included.
    facts.pending_unverified as u128 * 100 <= threshold as u128 * config.max_connections() as u128
}
