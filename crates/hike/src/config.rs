// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes ALL protocol constants and runtime settings for
//! the exchange manager. **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (timeouts, bitmap capacity)
//! - **Level 2 (Dynamic)**: [`Settings`] for per-SA runtime configuration
//!
//! The manager is driven per security association on a single dispatch
//! thread, so [`Settings`] is a plain value type captured at construction.

use std::time::Duration;

// =======================================================================
// Retransmission (whole-message path)
// =======================================================================

/// Base retransmission timeout (milliseconds).
///
/// First retransmission fires after this delay; subsequent delays grow by
/// [`RETRANSMIT_BASE`] per attempt.
pub const RETRANSMIT_TIMEOUT_MS: u32 = 4_000;

/// Number of retransmission attempts before giving up on the exchange.
///
/// After this many attempts the SA is torn down with
/// `Alert::RetransmitSendTimeout`.
pub const RETRANSMIT_TRIES: u32 = 5;

/// Exponential growth factor applied per retransmission attempt.
pub const RETRANSMIT_BASE: f64 = 1.8;

/// Default jitter applied to computed timeouts (percent, 0 = none).
///
/// Jitter is subtractive: a computed timeout may shrink by up to this
/// percentage, de-synchronizing peers that share a loss event.
pub const RETRANSMIT_JITTER_PCT: u32 = 0;

/// Upper bound for a single computed timeout (milliseconds, 0 = none).
pub const RETRANSMIT_LIMIT_MS: u32 = 0;

// =======================================================================
// Selective fragment retransmission
// =======================================================================

/// Fixed retry delay for the selective path (milliseconds).
///
/// Deliberately shorter than the first whole-message backoff step so a
/// selective retry never collides with a still-pending whole-message job.
pub const SELECTIVE_RETRY_DELAY_MS: u32 = 1_800;

/// Fragment ACK bitmap capacity.
///
/// The ACK record carries a 128-bit field of which 64 bits are defined.
/// Messages fragmenting into more than this many outer packets refuse SFR
/// and fall back to whole-message retransmission.
pub const MAX_ACK_FRAGMENTS: u16 = 64;

/// Minimum outer packet length for the first-fragment loss simulation.
///
/// Packets shorter than this are never dropped, so unfragmented control
/// messages survive a misconfigured debug setting.
pub const LOSS_SIMULATION_MIN_LEN: usize = 50;

// =======================================================================
// MOBIKE routability checks
// =======================================================================

/// Interval between MOBIKE path probes (milliseconds).
pub const ROUTABILITY_CHECK_INTERVAL_MS: u32 = 2_500;

/// Number of path probes before giving up on the peer.
pub const ROUTABILITY_CHECK_TRIES: u32 = 8;

// =======================================================================
// Timeouts & sizes
// =======================================================================

/// Deadline for completing SA establishment (seconds).
///
/// Armed when the first inbound message causes a config lookup; expiry
/// destroys the half-open SA.
pub const HALF_OPEN_TIMEOUT_SECS: u64 = 30;

/// Length of the retransmit-detection hash (SHA-1).
pub const HASH_LEN: usize = 20;

/// Default MTU used when fragmenting the internal wire form.
pub const DEFAULT_MTU: usize = 1_280;

/// Retransmission timing settings for the whole-message path.
///
/// `delay(n) = timeout * base^n`, reduced by up to `jitter_pct` percent and
/// capped at `limit_ms` when nonzero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetransmitConfig {
    /// Base timeout in milliseconds.
    pub timeout_ms: u32,
    /// Attempts before giving up.
    pub tries: u32,
    /// Exponential growth factor per attempt.
    pub base: f64,
    /// Subtractive jitter in percent (0-100).
    pub jitter_pct: u32,
    /// Cap for a single delay in milliseconds (0 = uncapped).
    pub limit_ms: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: RETRANSMIT_TIMEOUT_MS,
            tries: RETRANSMIT_TRIES,
            base: RETRANSMIT_BASE,
            jitter_pct: RETRANSMIT_JITTER_PCT,
            limit_ms: RETRANSMIT_LIMIT_MS,
        }
    }
}

/// Runtime settings for one exchange manager.
///
/// Captured at manager construction; the dispatch thread owns the value, no
/// interior mutability needed.
///
/// # Example
///
/// ```
/// use hike::config::Settings;
///
/// let settings = Settings {
///     selective_fragment_retransmission: true,
///     ..Settings::default()
/// };
/// assert!(settings.selective_fragment_retransmission);
/// ```
#[derive(Debug, Clone)]
pub struct Settings {
    /// Local SFR enable. When false the manager behaves like a pre-SFR
    /// implementation: no trackers, no per-fragment ACKs.
    pub selective_fragment_retransmission: bool,
    /// Use make-before-break instead of break-before-make reauthentication.
    pub make_before_break: bool,
    /// Deadline for unfinished SA establishment.
    pub half_open_timeout: Duration,
    /// Drop the first outgoing fragment of an initial transmission, for
    /// exercising selective retransmission under loss.
    pub simulate_first_fragment_loss: bool,
    /// Whole-message retransmission timing.
    pub retransmit: RetransmitConfig,
    /// MTU handed to the SA when generating fragmented messages.
    pub mtu: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selective_fragment_retransmission: true,
            make_before_break: true,
            half_open_timeout: Duration::from_secs(HALF_OPEN_TIMEOUT_SECS),
            simulate_first_fragment_loss: false,
            retransmit: RetransmitConfig::default(),
            mtu: DEFAULT_MTU,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(s.selective_fragment_retransmission);
        assert!(s.make_before_break);
        assert!(!s.simulate_first_fragment_loss);
        assert_eq!(s.half_open_timeout, Duration::from_secs(30));
        assert_eq!(s.retransmit.tries, 5);
    }

    #[test]
    fn test_selective_delay_shorter_than_first_backoff() {
        // The fixed selective retry must fire before the first whole-message
        // retransmission would.
        assert!(SELECTIVE_RETRY_DELAY_MS < RETRANSMIT_TIMEOUT_MS);
    }
}
