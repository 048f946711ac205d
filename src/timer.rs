use std::time::Duration;

use crate::config::Config;
use crate::rng::SeededRng;

/// Retransmission timeout of one flight.
///
/// The first timeout is the configured initial timeout multiplied by a random
/// factor, plus an extra delay when the peer has to do ECC work before it can
/// answer. Every retransmission scales the timeout, clamped to the maximum.
#[derive(Debug, Clone)]
pub struct RetransmissionTimer {
    rto: Duration,
    max_rto: Duration,
    scale: f64,
    attempt: usize,
    max_attempts: usize,
    back_off: usize,
    back_off_suppressed: bool,
}

impl RetransmissionTimer {
    pub fn new(config: &Config, ecc: bool, rng: &mut SeededRng) -> Self {
        let factor = rng.factor(config.retransmission_random_factor());
        let mut rto = config.retransmission_timeout().mul_f64(factor);
        if ecc {
            rto += config.additional_timeout_for_ecc();
        }

        RetransmissionTimer {
            rto: rto.min(config.max_retransmission_timeout()),
            max_rto: config.max_retransmission_timeout(),
            scale: config.retransmission_timeout_scale(),
            attempt: 0,
            max_attempts: config.max_retransmissions(),
            back_off: config.back_off_retransmission(),
            back_off_suppressed: config.use_multi_record_messages() == Some(true)
                || config.use_multi_handshake_message_records() == Some(true),
        }
    }

    /// Current timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Number of retransmissions done so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Register one retransmission and scale the timeout.
    pub fn next_attempt(&mut self) {
        self.attempt += 1;
        self.rto = self.rto.mul_f64(self.scale).min(self.max_rto);
    }

    /// Whether the current attempt sends one message per datagram.
    pub fn is_back_off(&self) -> bool {
        self.back_off > 0 && self.attempt >= self.back_off && !self.back_off_suppressed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ConfigParams;
    use crate::credentials::StaticPskStore;
    use std::sync::Arc;

    fn config(f: impl FnOnce(&mut ConfigParams)) -> Config {
        let mut params = ConfigParams {
            psk_store: Some(Arc::new(StaticPskStore::new().with_key("id", "secret"))),
            ..Default::default()
        };
        f(&mut params);
        params.build().unwrap()
    }

    #[test]
    fn timeouts_double_and_clamp() {
        let config = config(|p| {
            p.retransmission_timeout = Duration::from_millis(2000);
            p.max_retransmission_timeout = Duration::from_millis(20000);
            p.retransmission_timeout_scale = 2.0;
            p.max_retransmissions = 6;
        });
        let mut rng = SeededRng::new(Some(42));
        let mut timer = RetransmissionTimer::new(&config, false, &mut rng);

        let mut seen = vec![timer.rto().as_millis()];
        while timer.can_retry() {
            timer.next_attempt();
            seen.push(timer.rto().as_millis());
        }
        assert_eq!(seen, vec![2000, 4000, 8000, 16000, 20000, 20000, 20000]);
    }

    #[test]
    fn random_factor_stays_in_range() {
        let config = config(|p| {
            p.retransmission_random_factor = 1.5;
        });
        let mut rng = SeededRng::new(Some(7));
        for _ in 0..50 {
            let t = RetransmissionTimer::new(&config, false, &mut rng);
            assert!(t.rto() >= Duration::from_secs(2));
            assert!(t.rto() <= Duration::from_secs(3));
        }
    }

    #[test]
    fn ecc_adds_delay() {
        let config = config(|p| {
            p.additional_timeout_for_ecc = Duration::from_millis(500);
        });
        let mut rng = SeededRng::new(Some(1));
        let t = RetransmissionTimer::new(&config, true, &mut rng);
        assert_eq!(t.rto(), Duration::from_millis(2500));
    }

    #[test]
    fn back_off_starts_at_configured_attempt() {
        let config = config(|p| {
            p.max_retransmissions = 6;
        });
        assert_eq!(config.back_off_retransmission(), 3);
        let mut rng = SeededRng::new(Some(1));
        let mut t = RetransmissionTimer::new(&config, false, &mut rng);
        for attempt in 0..=6 {
            assert_eq!(t.is_back_off(), attempt >= 3, "attempt {}", attempt);
            t.next_attempt();
        }
    }

    #[test]
    fn forced_batching_suppresses_back_off() {
        let config = config(|p| {
            p.use_multi_record_messages = Some(true);
        });
        let mut rng = SeededRng::new(Some(1));
        let mut t = RetransmissionTimer::new(&config, false, &mut rng);
        for _ in 0..4 {
            t.next_attempt();
        }
        assert!(!t.is_back_off());
    }
}
