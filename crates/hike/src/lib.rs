// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hike - IKEv2 exchange manager with selective fragment retransmission
//!
//! The exchange-driving core of an IKEv2 daemon: it sequences the
//! request/response exchanges of one security association, owns the
//! fragmentation and retransmission machinery, and implements selective
//! fragment retransmission (SFR) - resending only the fragments a peer has
//! not acknowledged, driven by an explicit FRAGMENT_ACK notification.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                         Daemon (client)                            |
//! |   queue_* API | Sender | Scheduler | EventBus | TaskFactory        |
//! +--------------------------------------------------------------------+
//! |                        Exchange Layer                              |
//! |   TaskManager: dispatch | initiator half | responder half | queues |
//! +--------------------------------------------------------------------+
//! |                       Reliability Layer                            |
//! |   FragmentTracker | backoff | FRAGMENT_ACK codec | Defrag          |
//! +--------------------------------------------------------------------+
//! |                        SA Container (seam)                         |
//! |   IkeSa: codec, crypto, state, endpoints, config                   |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TaskManager`] | One per SA; every entry point of the subsystem |
//! | [`Task`] | A unit of protocol work with build/process hooks |
//! | [`IkeSa`] | The narrow contract consumed from the SA container |
//! | [`FragmentTracker`] | ACK state of the in-flight fragmented message |
//! | [`FragmentAck`] | The cumulative acknowledgment bitmap record |
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative per SA: the caller serializes packet
//! ingress, timer fires and client calls, so entry points take `&mut self`
//! and run to completion. Timers re-enter through
//! [`TaskManager::retransmit`]; cancellation is logical (drop the job
//! handle, let the stale job self-terminate).

/// Global configuration: protocol constants and runtime settings.
pub mod config;
/// The exchange task manager: dispatch, initiator/responder halves, queues.
pub mod exchange;
/// Protocol surface: exchange/notify types, message model, ACK codec.
pub mod protocol;
/// Inbound defragmentation.
pub mod reassembly;
/// Fragment tracking, retransmission backoff, transmission metrics.
pub mod reliability;
/// Runtime service seams: sender, scheduler, event bus.
pub mod runtime;
/// The SA container seam.
pub mod sa;
/// The task seam: trait, type tags, factory.
pub mod task;

pub use config::Settings;
pub use exchange::{ManagerStatus, TaskManager, TaskQueue};
pub use protocol::{ExchangeType, FragmentAck, Message, NotifyType, Packet, Payload, ProtocolId};
pub use reliability::{ExchangeMetrics, FragmentTracker, MetricsSnapshot};
pub use runtime::{Alert, EventBus, JobId, Runtime, Scheduler, Sender};
pub use sa::{Condition, Extension, IkeSa, ParseStatus, SaId, SaState, UpdateHosts};
pub use task::{MobikeOps, Task, TaskFactory, TaskSpec, TaskStatus, TaskType};

/// Errors raised by the protocol machinery.
///
/// Entry-point outcomes that are part of normal protocol operation (reject,
/// ignore, tear down) are expressed as [`ManagerStatus`], not errors; this
/// enum covers hard failures in codecs, reassembly and message generation.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Wire form
    // ========================================================================
    /// Input ended before a complete record.
    Truncated,
    /// Structurally invalid input.
    Malformed(&'static str),

    // ========================================================================
    // Fragment ACK codec
    // ========================================================================
    /// ACK record shorter than the fixed layout.
    AckTooShort(usize),
    /// ACK record claims more fragments than the bitmap can express.
    AckCapacityExceeded(u16),

    // ========================================================================
    // Reassembly
    // ========================================================================
    /// Fragment number out of the announced range.
    FragmentNumberInvalid { number: u16, total: u16 },
    /// Fragment disagrees with the announced total count.
    FragmentTotalMismatch { expected: u16, got: u16 },

    // ========================================================================
    // SA services
    // ========================================================================
    /// The SA container failed to generate or protect a message.
    Generation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated input"),
            Error::Malformed(what) => write!(f, "malformed input: {what}"),
            Error::AckTooShort(len) => {
                write!(f, "fragment ack record too short: {len} bytes")
            }
            Error::AckCapacityExceeded(total) => {
                write!(f, "fragment ack claims {total} fragments, bitmap holds 64")
            }
            Error::FragmentNumberInvalid { number, total } => {
                write!(f, "fragment number {number} outside 1..={total}")
            }
            Error::FragmentTotalMismatch { expected, got } => {
                write!(f, "fragment total {got} conflicts with {expected}")
            }
            Error::Generation(msg) => write!(f, "message generation failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenient alias for results using the crate's [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
