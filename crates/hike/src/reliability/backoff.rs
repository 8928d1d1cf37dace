// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retransmission timing for the whole-message path.
//!
//! `delay(n) = timeout * base^n`, optionally reduced by a random jitter of
//! up to `jitter_pct` percent and capped at `limit_ms`. The selective path
//! does not use this curve; it runs on the fixed
//! [`SELECTIVE_RETRY_DELAY_MS`](crate::config::SELECTIVE_RETRY_DELAY_MS).

use crate::config::RetransmitConfig;

/// Exponent clamp. `1.8^16` on a 4 s base already exceeds an hour; larger
/// attempts only risk `f64` blow-up.
const MAX_EXPONENT: u32 = 16;

/// Compute the delay before retransmission attempt `attempt` (0-based).
///
/// With `randomize` set, a jittered fraction of the delay is subtracted so
/// peers sharing a loss event do not retransmit in lockstep.
pub fn retransmission_timeout(cfg: &RetransmitConfig, attempt: u32, randomize: bool) -> u32 {
    let exponent = attempt.min(MAX_EXPONENT);
    let mut timeout = f64::from(cfg.timeout_ms) * cfg.base.powi(exponent as i32);

    if randomize && cfg.jitter_pct > 0 {
        let jitter = f64::from(fastrand::u32(0..=cfg.jitter_pct.min(100)));
        timeout -= timeout * jitter / 100.0;
    }
    if cfg.limit_ms > 0 {
        timeout = timeout.min(f64::from(cfg.limit_ms));
    }
    timeout.max(1.0).min(f64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetransmitConfig {
        RetransmitConfig {
            timeout_ms: 4_000,
            tries: 5,
            base: 1.8,
            jitter_pct: 0,
            limit_ms: 0,
        }
    }

    #[test]
    fn test_first_attempt_is_base_timeout() {
        assert_eq!(retransmission_timeout(&cfg(), 0, false), 4_000);
    }

    #[test]
    fn test_exponential_growth() {
        let c = cfg();
        let mut previous = 0;
        for attempt in 0..5 {
            let timeout = retransmission_timeout(&c, attempt, false);
            assert!(timeout > previous, "attempt {attempt} did not grow");
            previous = timeout;
        }
        // 4000 * 1.8^2 = 12960
        assert_eq!(retransmission_timeout(&c, 2, false), 12_960);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let c = RetransmitConfig {
            jitter_pct: 20,
            ..cfg()
        };
        for _ in 0..200 {
            let timeout = retransmission_timeout(&c, 1, true);
            let full = retransmission_timeout(&c, 1, false);
            assert!(timeout <= full);
            assert!(f64::from(timeout) >= f64::from(full) * 0.8 - 1.0);
        }
    }

    #[test]
    fn test_limit_caps_delay() {
        let c = RetransmitConfig {
            limit_ms: 10_000,
            ..cfg()
        };
        assert_eq!(retransmission_timeout(&c, 4, false), 10_000);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let timeout = retransmission_timeout(&cfg(), u32::MAX, false);
        assert!(timeout > 0);
    }
}
