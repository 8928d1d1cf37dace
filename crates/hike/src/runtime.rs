// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime service seams: packet emission, delayed jobs, event notification.
//!
//! The daemon provides these; the manager never blocks on them. Scheduled
//! jobs re-enter the manager later through `retransmit()`, `initiate()` or
//! SA deletion, under the same one-operation-at-a-time contract as packet
//! ingress.

use std::time::Duration;

use crate::protocol::{Message, Packet};
use crate::sa::{ParseStatus, SaId};

/// Handle of a scheduled job.
///
/// The manager keeps at most one retransmit-job handle and cancels only
/// logically: it drops the handle and lets the stale job fire and
/// self-terminate against current state.
pub type JobId = u64;

/// Non-blocking UDP emission.
pub trait Sender {
    /// Queue one packet for transmission.
    fn send(&mut self, packet: Packet);
}

/// Delayed-job scheduling.
pub trait Scheduler {
    /// Arm a retransmission timer. The job fires as
    /// `TaskManager::retransmit(message_id)` on the owning SA.
    fn schedule_retransmit(&mut self, sa: SaId, message_id: u32, delay_ms: u32) -> JobId;

    /// Re-enter `TaskManager::initiate()` after a delay (delayed task
    /// queueing).
    fn schedule_initiate(&mut self, sa: SaId, delay: Duration);

    /// Destroy the SA after a wallclock deadline (half-open timeout).
    fn schedule_delete(&mut self, sa: SaId, delay: Duration);
}

/// Operational alerts raised towards the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// A request is being retransmitted.
    RetransmitSend { message_id: u32, attempt: u32 },
    /// The response arrived after earlier retransmits.
    RetransmitSendCleared,
    /// Gave up retransmitting; the SA goes down.
    RetransmitSendTimeout { message_id: u32 },
    /// The peer retransmitted a request we already answered.
    RetransmitReceive { message_id: u32 },
    /// An inbound message failed body parsing.
    ParseErrorBody { status: ParseStatus },
}

/// Event notification towards the daemon.
pub trait EventBus {
    /// Raise an operational alert.
    fn alert(&mut self, sa: SaId, alert: Alert);

    /// SA went up (true) or down (false).
    fn ike_updown(&mut self, sa: SaId, up: bool);

    /// Message hook: fired once per inbound message before processing
    /// (`plain = false`) and once after decryption (`plain = true`).
    fn message(&mut self, sa: SaId, msg: &Message, incoming: bool, plain: bool);

    /// Make-before-break reauthentication wants a sibling SA; the client
    /// orchestrates creation and task adoption.
    fn reestablish_requested(&mut self, sa: SaId);
}

/// The bundle of runtime services handed into every manager entry point.
pub struct Runtime<'a> {
    pub sender: &'a mut dyn Sender,
    pub scheduler: &'a mut dyn Scheduler,
    pub bus: &'a mut dyn EventBus,
}
