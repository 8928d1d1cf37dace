// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The exchange task manager.
//!
//! Drives one IKEv2 security association through its request/response
//! exchanges: activates queued tasks, builds and fragments outgoing
//! messages, reassembles inbound ones, detects retransmitted requests,
//! arms the retransmission timer and folds FRAGMENT_ACK notifications into
//! the selective retransmission machinery.
//!
//! One manager exists per SA and runs under the SA's exclusivity contract:
//! packet ingress, timer fire and client calls are serialized by the
//! caller, so every entry point takes `&mut self` plus the borrowed SA and
//! runtime services and runs to completion.
//!
//! ```text
//!   ingress packet
//!        |
//!        v
//!   process_message ---- retransmitted request? ----> replay cached response
//!        |
//!        +-- fragment? --> Defrag --+-- emit FRAGMENT_ACK (MID 0)
//!        |                         +-- complete --> re-inject
//!        v
//!   request path                     response path
//!   (spawn passive tasks,            (active task passes,
//!    build + cache response)          advance MID, next initiate)
//! ```

mod initiator;
mod queues;
mod responder;

pub use queues::{QueuedTask, TaskQueue, TaskQueues};

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::config::{Settings, HASH_LEN, LOSS_SIMULATION_MIN_LEN, MAX_ACK_FRAGMENTS};
use crate::protocol::{ExchangeType, FragmentAck, Message, NotifyType, Packet, ProtocolId};
use crate::reassembly::{Defrag, DefragStatus};
use crate::reliability::{ExchangeMetrics, FragmentTracker};
use crate::runtime::{Alert, JobId, Runtime};
use crate::sa::{Extension, IkeSa, ParseStatus, SaId, SaState, UpdateHosts};
use crate::task::{ChildConfigId, ChildInitArgs, Task, TaskFactory, TaskSpec, TaskType};

/// Outcome of a manager entry point, mirroring the collaborator contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    /// Operation completed.
    Ok,
    /// More exchanges needed; state was not advanced.
    NeedMore,
    /// The message was invalid or rejected; it was ignored.
    Failed,
    /// The SA must be destroyed.
    DestroyMe,
    /// The operation cannot run in the current state (deferred exchange).
    InvalidState,
}

/// The exchange half this end initiates.
pub(crate) struct Initiating {
    pub mid: u32,
    pub retransmitted: u32,
    pub retransmit_sent: bool,
    pub deferred: bool,
    pub exchange: Option<ExchangeType>,
    pub packets: Vec<Packet>,
    pub defrag: Option<Defrag>,
}

impl Initiating {
    fn new() -> Self {
        Self {
            mid: 0,
            retransmitted: 0,
            retransmit_sent: false,
            deferred: false,
            exchange: None,
            packets: Vec::new(),
            defrag: None,
        }
    }
}

/// The exchange half the peer initiates.
pub(crate) struct Responding {
    pub mid: u32,
    /// Hash of the current request, or its first fragment.
    pub hash: Option<[u8; HASH_LEN]>,
    /// Hash of the previously answered request.
    pub prev_hash: Option<[u8; HASH_LEN]>,
    /// Cached response packets for answering retransmitted requests.
    pub packets: Vec<Packet>,
    pub defrag: Option<Defrag>,
}

impl Responding {
    fn new() -> Self {
        Self {
            mid: 0,
            hash: None,
            prev_hash: None,
            packets: Vec::new(),
            defrag: None,
        }
    }
}

/// Internal classification of an inbound request against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetransmitCheck {
    /// New request; process it.
    Process,
    /// Retransmission of the previously answered request.
    Replay,
    /// The MID-0 ACK channel: consume the FRAGMENT_ACK, no task, no
    /// response, no window movement.
    AckChannel,
    /// Out of window; ignore.
    Ignore,
}

/// IKEv2 exchange task manager with selective fragment retransmission.
pub struct TaskManager {
    pub(crate) settings: Settings,
    pub(crate) initiating: Initiating,
    pub(crate) responding: Responding,
    pub(crate) queues: TaskQueues,
    /// Set by `reset()` while tasks are being processed; restarts initiation.
    pub(crate) reset_pending: bool,
    /// Tracker for the last generated outbound fragmented message.
    pub(crate) tracker: Option<FragmentTracker>,
    /// Latched when the peer advertises the SFR capability.
    pub(crate) peer_supports_selective: bool,
    /// Reference to the pending retransmit job. Cleared for logical
    /// cancellation; the stale job self-terminates when it fires.
    pub(crate) retransmit_job: Option<JobId>,
    pub(crate) factory: Box<dyn TaskFactory>,
    metrics: ExchangeMetrics,
}

impl TaskManager {
    /// Create a manager for one SA.
    pub fn new(settings: Settings, factory: Box<dyn TaskFactory>) -> Self {
        Self {
            settings,
            initiating: Initiating::new(),
            responding: Responding::new(),
            queues: TaskQueues::new(),
            reset_pending: false,
            tracker: None,
            peer_supports_selective: false,
            retransmit_job: None,
            factory,
            metrics: ExchangeMetrics::new(),
        }
    }

    /// Transmission metrics of this manager.
    pub fn metrics(&self) -> &ExchangeMetrics {
        &self.metrics
    }

    /// Whether the peer advertised selective fragment retransmission.
    pub fn peer_supports_selective(&self) -> bool {
        self.peer_supports_selective
    }

    /// Tracker of the in-flight fragmented message, if any.
    pub fn fragment_tracker(&self) -> Option<&FragmentTracker> {
        self.tracker.as_ref()
    }

    // ========================================================================
    // INGRESS
    // ========================================================================

    /// Process one inbound message. The single packet-ingress entry point.
    pub fn process_message(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        mut msg: Message,
    ) -> ManagerStatus {
        let mid = msg.mid();
        let now = Instant::now();

        rt.bus.message(sa.id(), &msg, true, false);

        let mut schedule_delete_job = false;
        let mut expected_mid: Option<u32> = None;
        let mut parsed = false;
        let mut status = ManagerStatus::Ok;

        if msg.is_request() {
            match self.is_retransmit(&msg) {
                RetransmitCheck::Replay => {
                    log::info!("received retransmit of request with ID {mid}, retransmitting response");
                    sa.mark_inbound(now);
                    rt.bus.alert(sa.id(), Alert::RetransmitReceive { message_id: mid });
                    self.replay_cached_response(rt, msg.destination(), msg.source());
                    return ManagerStatus::Ok;
                }
                RetransmitCheck::AckChannel => {
                    // The ACK never joins the exchange window: answering it
                    // or advancing rx_mid would desync both peers.
                    let status = self.parse_message(sa, rt, &mut msg);
                    if status == ManagerStatus::Ok {
                        self.process_fragment_ack(&msg);
                        sa.mark_inbound(now);
                    }
                    return status;
                }
                RetransmitCheck::Ignore => {
                    if mid == 0 && self.is_potential_mid_sync(sa, &msg) {
                        // Possibly a MID sync; decide after parsing.
                        status = self.parse_message(sa, rt, &mut msg);
                        parsed = true;
                        if status == ManagerStatus::Ok && !Self::is_mid_sync(&msg) {
                            expected_mid = Some(self.responding.mid);
                        }
                    } else {
                        expected_mid = Some(self.responding.mid);
                    }
                }
                RetransmitCheck::Process => {
                    status = self.parse_message(sa, rt, &mut msg);
                    parsed = true;
                }
            }
        } else if mid == self.initiating.mid {
            status = self.parse_message(sa, rt, &mut msg);
            parsed = true;
            if status == ManagerStatus::Ok && Self::has_fragment_ack(&msg) {
                // An ACK may ride on the expected response itself.
                self.process_fragment_ack(&msg);
            }
        } else if mid == 0 && Self::has_fragment_ack(&msg) {
            // The dedicated ACK channel, as a response.
            let status = self.parse_message(sa, rt, &mut msg);
            if status == ManagerStatus::Ok {
                self.process_fragment_ack(&msg);
            }
            return status;
        } else {
            expected_mid = Some(self.initiating.mid);
        }

        if let Some(expected) = expected_mid {
            // The MID is outside the window, but the ACK channel is
            // MID-agnostic: salvage a FRAGMENT_ACK before dropping.
            if !parsed {
                status = self.parse_message(sa, rt, &mut msg);
            }
            if status == ManagerStatus::Ok && Self::has_fragment_ack(&msg) {
                self.process_fragment_ack(&msg);
                return ManagerStatus::Ok;
            }
            log::info!("received message ID {mid}, expected {expected}, ignored");
            return ManagerStatus::Ok;
        }
        if status != ManagerStatus::Ok {
            return status;
        }

        // A virgin SA needs a config before anything else happens.
        if !sa.has_config() {
            if !sa.lookup_config(msg.destination(), msg.source()) {
                log::info!(
                    "no IKE config found for {}...{}, sending NO_PROPOSAL_CHOSEN",
                    msg.destination(),
                    msg.source()
                );
                self.send_notify_response(sa, rt, &msg, NotifyType::NoProposalChosen, Vec::new());
                return ManagerStatus::DestroyMe;
            }
            schedule_delete_job = true;
        }

        let result = if msg.is_request() {
            if self.reject_request(sa, &msg) {
                ManagerStatus::Failed
            } else {
                if !sa.supports_extension(Extension::Mobike) {
                    // Implicit updates only without MOBIKE; force both
                    // addresses for IKE_AUTH (ports may change with NAT-T).
                    let mode = if mid == 1 {
                        UpdateHosts::ForceAddrs
                    } else {
                        UpdateHosts::Default
                    };
                    sa.update_hosts(msg.destination(), msg.source(), mode);
                }
                match self.handle_fragment(sa, rt, FragmentHalf::Responding, &msg) {
                    ManagerStatus::Ok => {
                        rt.bus.message(sa.id(), &msg, true, true);
                        match self.process_request(sa, rt, &msg) {
                            ManagerStatus::Ok => {
                                sa.mark_inbound(now);
                                self.responding.mid += 1;
                                self.responding.prev_hash = self.responding.hash;
                                ManagerStatus::Ok
                            }
                            ManagerStatus::NeedMore => ManagerStatus::Ok,
                            _ => {
                                self.flush();
                                ManagerStatus::DestroyMe
                            }
                        }
                    }
                    ManagerStatus::NeedMore => {
                        sa.mark_inbound(now);
                        ManagerStatus::Ok
                    }
                    other => other,
                }
            }
        } else {
            if matches!(sa.state(), SaState::Created | SaState::Connecting)
                || msg.exchange() != ExchangeType::IkeSaInit
            {
                // Only update based on verified messages (or initial ones).
                if !sa.supports_extension(Extension::Mobike) {
                    let mode = if mid == 0 {
                        UpdateHosts::ForceLocal
                    } else {
                        UpdateHosts::Default
                    };
                    sa.update_hosts(msg.destination(), msg.source(), mode);
                }
            }
            match self.handle_fragment(sa, rt, FragmentHalf::Initiating, &msg) {
                ManagerStatus::Ok => {
                    rt.bus.message(sa.id(), &msg, true, true);
                    if self.process_response(sa, rt, &msg) != ManagerStatus::Ok {
                        self.flush();
                        ManagerStatus::DestroyMe
                    } else {
                        sa.mark_inbound(now);
                        ManagerStatus::Ok
                    }
                }
                ManagerStatus::NeedMore => {
                    sa.mark_inbound(now);
                    ManagerStatus::Ok
                }
                other => other,
            }
        };

        if schedule_delete_job && result == ManagerStatus::Ok {
            // Destroy the SA if the peer never completes establishment.
            rt.scheduler
                .schedule_delete(sa.id(), self.settings.half_open_timeout);
        }
        result
    }

    // ========================================================================
    // FRAGMENT HANDLING
    // ========================================================================

    /// Handle the given message if it is a fragment.
    ///
    /// Returns `Ok` when the message is not a fragment and processing should
    /// continue inline, `NeedMore` when the fragment was absorbed (and
    /// possibly completed a message that was re-injected), `Failed` on a
    /// broken fragment.
    fn handle_fragment(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        half: FragmentHalf,
        msg: &Message,
    ) -> ManagerStatus {
        let Some((number, total, _)) = msg.fragment() else {
            // Reassembled messages carry no outer bytes; their first
            // fragment was hashed when it arrived.
            if let Some(data) = msg.packet_data() {
                self.responding.hash = Some(hash_bytes(data));
            }
            return ManagerStatus::Ok;
        };

        let slot = match half {
            FragmentHalf::Initiating => &mut self.initiating.defrag,
            FragmentHalf::Responding => &mut self.responding.defrag,
        };
        if slot.is_none() {
            match Defrag::new(msg) {
                Ok(defrag) => *slot = Some(defrag),
                Err(err) => {
                    log::info!("invalid fragment, ignored: {err}");
                    return ManagerStatus::Failed;
                }
            }
        }

        let outcome = slot.as_mut().map(|defrag| defrag.add(msg));
        // Retransmission detection hashes the first fragment only.
        if number == 1 {
            if let Some(data) = msg.packet_data() {
                self.responding.hash = Some(hash_bytes(data));
            }
        }

        match outcome {
            Some(Ok(DefragStatus::NeedMore)) => {
                self.acknowledge_fragment(sa, rt, half, msg.mid(), total, false);
                ManagerStatus::NeedMore
            }
            Some(Ok(DefragStatus::Complete(reassembled))) => {
                self.acknowledge_fragment(sa, rt, half, msg.mid(), total, true);
                match half {
                    FragmentHalf::Initiating => self.initiating.defrag = None,
                    FragmentHalf::Responding => self.responding.defrag = None,
                }

                // A retransmitted fragment may complete a message that was
                // already processed; re-injecting it would double-apply
                // side effects.
                let already_processed = self.responding.mid > reassembled.mid()
                    || (self.responding.mid == reassembled.mid()
                        && sa.state() > SaState::Connecting);
                if already_processed && half == FragmentHalf::Responding {
                    log::debug!(
                        "fragment {number} completed already processed message {}, not re-injecting",
                        reassembled.mid()
                    );
                    return ManagerStatus::NeedMore;
                }

                match self.process_message(sa, rt, reassembled) {
                    ManagerStatus::Ok => ManagerStatus::NeedMore,
                    other => other,
                }
            }
            Some(Err(err)) => {
                log::info!("fragment reassembly failed: {err}");
                ManagerStatus::Failed
            }
            None => ManagerStatus::Failed,
        }
    }

    /// Emit an immediate cumulative FRAGMENT_ACK for an accepted fragment.
    fn acknowledge_fragment(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        half: FragmentHalf,
        mid: u32,
        total: u16,
        completed: bool,
    ) {
        if !self.settings.selective_fragment_retransmission {
            return;
        }
        if total > MAX_ACK_FRAGMENTS {
            // Beyond bitmap capacity; this message runs without SFR.
            return;
        }

        let ack = if completed {
            FragmentAck::complete(mid, total)
        } else {
            let defrag = match half {
                FragmentHalf::Initiating => self.initiating.defrag.as_ref(),
                FragmentHalf::Responding => self.responding.defrag.as_ref(),
            };
            match defrag {
                Some(d) => FragmentAck::from_received(mid, total, d.received()),
                None => return,
            }
        };

        // MID 0 keeps the ACK outside both sliding windows; receivers
        // recognize it before the duplicate-request logic runs.
        let mut ack_msg = Message::new(
            0,
            ExchangeType::Informational,
            true,
            sa.my_host(),
            sa.other_host(),
        );
        ack_msg.add_notify(
            ProtocolId::None,
            NotifyType::FragmentAck,
            ack.encode().to_vec(),
        );

        match sa.generate_message(&ack_msg) {
            Ok(packet) => {
                log::debug!(
                    "sending fragment ack for message {mid}: {}/{total} fragments held",
                    ack.received_count()
                );
                rt.sender.send(packet);
                self.metrics.increment_acks_sent();
            }
            Err(err) => {
                log::warn!("failed to generate fragment ack for message {mid}: {err}");
            }
        }
    }

    /// Fold a received FRAGMENT_ACK into the outgoing tracker.
    pub(crate) fn process_fragment_ack(&mut self, msg: &Message) {
        let Some(notify) = msg.get_notify(NotifyType::FragmentAck) else {
            return;
        };
        let ack = match FragmentAck::decode(&notify.data) {
            Ok(ack) => ack,
            Err(err) => {
                log::info!("ignoring malformed fragment ack: {err}");
                return;
            }
        };

        let Some(tracker) = self.tracker.as_mut() else {
            log::debug!(
                "fragment ack for message {} but no outgoing fragmented message, ignored",
                ack.message_id()
            );
            return;
        };
        if tracker.message_id() != ack.message_id() {
            log::debug!(
                "fragment ack for message {}, tracking {}, ignored",
                ack.message_id(),
                tracker.message_id()
            );
            return;
        }

        tracker.mark_acked(&ack, Instant::now());
        self.metrics.increment_acks_received();

        if tracker.complete() {
            log::debug!(
                "all {} fragments of message {} acknowledged",
                tracker.total_fragments(),
                tracker.message_id()
            );
            // Logical cancellation: drop the job reference, the scheduled
            // callback re-validates and exits when it fires.
            self.retransmit_job = None;
        }
    }

    /// Whether the message carries a FRAGMENT_ACK notify.
    pub(crate) fn has_fragment_ack(msg: &Message) -> bool {
        msg.get_notify(NotifyType::FragmentAck).is_some()
    }

    // ========================================================================
    // PARSING & ERRORS
    // ========================================================================

    /// Parse and verify an inbound message body, handling failures per the
    /// error policy.
    fn parse_message(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        msg: &mut Message,
    ) -> ManagerStatus {
        if !self.derive_keys_for(TaskQueue::Passive) {
            // No point in trying again without keys.
            return ManagerStatus::DestroyMe;
        }

        let mut parse_status = sa.parse_body(msg);
        let mut critical_type = None;
        if parse_status == ParseStatus::Ok {
            if let Some(kind) = msg.unsupported_critical_payload() {
                critical_type = Some(kind);
                parse_status = ParseStatus::VerifyError;
            }
        }
        if parse_status == ParseStatus::Ok {
            return ManagerStatus::Ok;
        }

        let is_request = msg.is_request();
        let mut status = ManagerStatus::Failed;
        if let Some(kind) = critical_type {
            log::info!("critical unknown payload of type {kind} found");
            if is_request {
                self.send_notify_response(
                    sa,
                    rt,
                    msg,
                    NotifyType::UnsupportedCriticalPayload,
                    vec![kind],
                );
                self.responding.mid += 1;
            }
        } else {
            match parse_status {
                ParseStatus::ParseError => {
                    log::info!("message parsing failed");
                    if is_request {
                        status = self.send_invalid_syntax(sa, rt, msg);
                    }
                }
                ParseStatus::VerifyError => {
                    log::info!("message verification failed");
                    if is_request {
                        status = self.send_invalid_syntax(sa, rt, msg);
                    }
                }
                ParseStatus::IntegrityFailed => {
                    // Silently ignored.
                    log::info!("integrity check failed");
                }
                ParseStatus::NoKeys => {
                    log::info!("found encrypted message, but no keys available");
                }
                ParseStatus::Ok => {}
            }
        }
        log::info!(
            "{} {} with message ID {} processing failed",
            msg.exchange(),
            if is_request { "request" } else { "response" },
            msg.mid()
        );
        rt.bus.alert(
            sa.id(),
            Alert::ParseErrorBody {
                status: parse_status,
            },
        );

        match sa.state() {
            // Invalid initiation attempt, close the half-open SA.
            SaState::Created => status = ManagerStatus::DestroyMe,
            // No updown event in transient states.
            SaState::Connecting | SaState::Rekeyed => {}
            _ => {
                if status == ManagerStatus::DestroyMe {
                    rt.bus.ike_updown(sa.id(), false);
                }
            }
        }
        status
    }

    /// Respond with INVALID_SYNTAX; fatal for authenticated exchanges.
    fn send_invalid_syntax(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        msg: &Message,
    ) -> ManagerStatus {
        self.send_notify_response(sa, rt, msg, NotifyType::InvalidSyntax, Vec::new());
        self.responding.mid += 1;

        // IKE_SA_INIT is the only exchange accepted unprotected; an invalid
        // one only kills the attempt, not an established SA.
        if msg.exchange() == ExchangeType::IkeSaInit {
            ManagerStatus::Failed
        } else {
            ManagerStatus::DestroyMe
        }
    }

    /// Send a one-notify response along the path the request came in.
    pub(crate) fn send_notify_response(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        request: &Message,
        kind: NotifyType,
        data: Vec<u8>,
    ) {
        let mut me = sa.my_host();
        if me.ip().is_unspecified() {
            me = request.destination();
            sa.set_my_host(me);
        }
        let mut other = sa.other_host();
        if other.ip().is_unspecified() {
            other = request.source();
            sa.set_other_host(other);
        }

        let mut response = Message::new(request.mid(), request.exchange(), false, me, other);
        response.add_notify(ProtocolId::None, kind, data);
        match sa.generate_message(&response) {
            Ok(packet) => rt.sender.send(packet),
            Err(err) => log::warn!("failed to generate notify response: {err}"),
        }
    }

    // ========================================================================
    // MESSAGE GENERATION & EMISSION
    // ========================================================================

    /// Generate an outgoing message into fragments, creating a fragment
    /// tracker when the message splits and SFR is enabled locally.
    pub(crate) fn generate(&mut self, sa: &mut dyn IkeSa, msg: &Message) -> Option<Vec<Packet>> {
        let packets = match sa.generate_message_fragmented(msg) {
            Ok(packets) => packets,
            Err(err) => {
                log::info!("message generation failed: {err}");
                return None;
            }
        };
        let total_size: usize = packets.iter().map(Packet::len).sum();
        let count = packets.len();

        if count > 1 {
            log::debug!(
                "generated message {} as {count} fragments, {total_size} bytes",
                msg.mid()
            );
        }

        if count > 1 && self.settings.selective_fragment_retransmission {
            if count > usize::from(MAX_ACK_FRAGMENTS) {
                log::warn!(
                    "message {} fragments into {count} packets, beyond the {MAX_ACK_FRAGMENTS} \
                     the ack bitmap can express; selective retransmission disabled for it",
                    msg.mid()
                );
                self.tracker = None;
            } else {
                let mut tracker = FragmentTracker::new(msg.mid(), count as u16);
                for (idx, packet) in packets.iter().enumerate() {
                    tracker.add(idx as u16 + 1, packet.clone());
                }
                tracker.set_selective_supported(self.peer_supports_selective);
                self.tracker = Some(tracker);
            }
        }
        Some(packets)
    }

    /// Hand a packet sequence to the sender.
    ///
    /// Clones each packet, optionally re-addressing it. With
    /// `simulate_first_loss`, the first packet of a multi-packet sequence is
    /// accounted but not emitted, modeling network loss after transmission.
    /// Returns the bytes accounted.
    pub(crate) fn emit_packets(
        rt: &mut Runtime<'_>,
        packets: &[Packet],
        src: Option<SocketAddr>,
        dst: Option<SocketAddr>,
        simulate_first_loss: bool,
    ) -> u64 {
        let mut total = 0u64;
        for (idx, packet) in packets.iter().enumerate() {
            total += packet.len() as u64;

            let dropped = simulate_first_loss
                && idx == 0
                && packets.len() > 1
                && packet.len() > LOSS_SIMULATION_MIN_LEN;
            if dropped {
                log::warn!(
                    "simulating loss of first fragment ({} bytes), not sending",
                    packet.len()
                );
                continue;
            }

            let mut clone = packet.clone();
            if let Some(src) = src {
                clone.source = src;
            }
            if let Some(dst) = dst {
                clone.destination = dst;
            }
            rt.sender.send(clone);
        }
        total
    }

    /// Replay the cached response packets towards the retransmitting peer.
    fn replay_cached_response(&mut self, rt: &mut Runtime<'_>, src: SocketAddr, dst: SocketAddr) {
        let bytes = Self::emit_packets(rt, &self.responding.packets, Some(src), Some(dst), false);
        // Accounting only when the cached response is the fragmented message
        // the tracker describes; a matching MID from the request direction
        // does not count.
        if self.responding.packets.len() > 1 {
            if let Some(tracker) = self.tracker.as_mut() {
                if self.responding.mid > 0 && tracker.message_id() == self.responding.mid - 1 {
                    tracker.record_transmitted(bytes);
                }
            }
        }
        self.metrics.record_response_replay(bytes);
    }

    // ========================================================================
    // CLIENT API: QUEUEING
    // ========================================================================

    /// Enqueue a task for the next matching exchange.
    pub fn queue_task(&mut self, task: Box<dyn Task>) {
        self.queues.queue(task, Instant::now());
    }

    /// Enqueue a task that may not start before `delay` has passed. An
    /// initiate job re-enters the manager once the delay expires.
    pub fn queue_task_delayed(
        &mut self,
        rt: &mut Runtime<'_>,
        sa: SaId,
        task: Box<dyn Task>,
        delay: Duration,
    ) {
        if delay.is_zero() {
            self.queue_task(task);
            return;
        }
        log::debug!(
            "queueing {:?} task (delayed by {}s)",
            task.task_type(),
            delay.as_secs()
        );
        rt.scheduler.schedule_initiate(sa, delay);
        self.queues.queue(task, Instant::now() + delay);
    }

    fn queue_unique(&mut self, task_type: TaskType) {
        if !self.queues.has_queued(TaskQueue::Queued, task_type) {
            let task = self.factory.create(&TaskSpec::Simple(task_type), true);
            self.queue_task(task);
        }
    }

    /// Queue the full establishment chain (IKE_SA_INIT through IKE_AUTH).
    pub fn queue_ike(&mut self) {
        for task_type in [
            TaskType::IkeVendor,
            TaskType::IkeInit,
            TaskType::IkeNatd,
            TaskType::IkeCertPre,
            TaskType::IkeAuth,
            TaskType::IkeCertPost,
            TaskType::IkeConfig,
            TaskType::IkeAuthLifetime,
            TaskType::IkeMobike,
            TaskType::IkeEstablish,
        ] {
            self.queue_unique(task_type);
        }
    }

    /// Queue only the IKE_SA_INIT phase (phase separation).
    pub fn queue_ike_init_only(&mut self) {
        for task_type in [TaskType::IkeVendor, TaskType::IkeInit, TaskType::IkeNatd] {
            self.queue_unique(task_type);
        }
        log::info!("queued IKE_SA_INIT tasks only");
    }

    /// Queue only the IKE_AUTH phase (phase separation).
    pub fn queue_ike_auth_only(&mut self) {
        for task_type in [
            TaskType::IkeCertPre,
            TaskType::IkeAuth,
            TaskType::IkeCertPost,
            TaskType::IkeConfig,
            TaskType::IkeAuthLifetime,
            TaskType::IkeMobike,
            TaskType::IkeEstablish,
        ] {
            self.queue_unique(task_type);
        }
        log::info!("queued IKE_AUTH tasks only");
    }

    /// Queue an IKE_SA rekeying.
    pub fn queue_ike_rekey(&mut self) {
        let task = self
            .factory
            .create(&TaskSpec::Simple(TaskType::IkeRekey), true);
        self.queue_task(task);
    }

    /// Queue reauthentication. With make-before-break the client is asked
    /// to establish the replacement SA first; otherwise the reauth task
    /// tears this one down and re-establishes.
    pub fn queue_ike_reauth(&mut self, rt: &mut Runtime<'_>, sa: &dyn IkeSa) {
        if self.settings.make_before_break {
            rt.bus.reestablish_requested(sa.id());
            return;
        }
        let task = self
            .factory
            .create(&TaskSpec::Simple(TaskType::IkeReauth), true);
        self.queue_task(task);
    }

    /// Queue deletion of the IKE_SA.
    pub fn queue_ike_delete(&mut self) {
        let task = self
            .factory
            .create(&TaskSpec::Simple(TaskType::IkeDelete), true);
        self.queue_task(task);
    }

    /// Queue a MOBIKE update; reuses an already queued MOBIKE task.
    pub fn queue_mobike(&mut self, roam: bool, address: bool) {
        if !self.queues.has_queued(TaskQueue::Queued, TaskType::IkeMobike) {
            let task = self
                .factory
                .create(&TaskSpec::Simple(TaskType::IkeMobike), true);
            self.queue_task(task);
        }
        for queued in self.queues.queued_tasks_mut() {
            if queued.task.task_type() == TaskType::IkeMobike {
                if let Some(mobike) = queued.task.mobike() {
                    if roam {
                        mobike.roam(address);
                    } else {
                        mobike.addresses();
                    }
                }
                break;
            }
        }
        if roam {
            // Path probing on a MOBIKE task already in the air.
            for task in self.queues.active_tasks_mut() {
                if task.task_type() == TaskType::IkeMobike {
                    if let Some(mobike) = task.mobike() {
                        mobike.enable_probing();
                    }
                    break;
                }
            }
        }
    }

    /// Queue dead peer detection. With MOBIKE negotiated, the initiator
    /// detects NAT mapping changes with a MOBIKE-based DPD instead.
    pub fn queue_dpd(&mut self, sa: &dyn IkeSa) {
        if sa.supports_extension(Extension::Mobike) && sa.is_initiator() {
            if !self.queues.has_queued(TaskQueue::Queued, TaskType::IkeMobike) {
                let task = self
                    .factory
                    .create(&TaskSpec::Simple(TaskType::IkeMobike), true);
                self.queue_task(task);
            }
            for queued in self.queues.queued_tasks_mut() {
                if queued.task.task_type() == TaskType::IkeMobike {
                    if let Some(mobike) = queued.task.mobike() {
                        mobike.dpd();
                    }
                    break;
                }
            }
            return;
        }
        let task = self.factory.create(&TaskSpec::Simple(TaskType::IkeDpd), true);
        self.queue_task(task);
    }

    /// Queue creation of a CHILD_SA.
    pub fn queue_child(&mut self, config: Option<ChildConfigId>, args: Option<ChildInitArgs>) {
        let task = self.factory.create(&TaskSpec::Child { config, args }, true);
        self.queue_task(task);
    }

    /// Queue rekeying of a CHILD_SA.
    pub fn queue_child_rekey(&mut self, protocol: ProtocolId, spi: u32) {
        let task = self
            .factory
            .create(&TaskSpec::ChildRekey { protocol, spi }, true);
        self.queue_task(task);
    }

    /// Queue deletion of a CHILD_SA.
    pub fn queue_child_delete(&mut self, protocol: ProtocolId, spi: u32, expired: bool) {
        let task = self.factory.create(
            &TaskSpec::ChildDelete {
                protocol,
                spi,
                expired,
            },
            true,
        );
        self.queue_task(task);
    }

    // ========================================================================
    // CLIENT API: LIFECYCLE
    // ========================================================================

    /// Advance a message ID without an exchange (MID sync).
    pub fn incr_mid(&mut self, initiate: bool) {
        if initiate {
            self.initiating.mid += 1;
        } else {
            self.responding.mid += 1;
        }
    }

    /// Current message ID of a direction.
    pub fn get_mid(&self, initiate: bool) -> u32 {
        if initiate {
            self.initiating.mid
        } else {
            self.responding.mid
        }
    }

    /// Re-synchronize message IDs and drop all in-flight exchange state.
    /// `None` keeps a counter unchanged.
    pub fn reset(&mut self, sa: SaId, initiate: Option<u32>, respond: Option<u32>) {
        self.responding.packets.clear();
        self.initiating.packets.clear();
        self.responding.defrag = None;
        self.initiating.defrag = None;
        // Drop tracker state so a stale bitmap cannot leak into the next
        // fragmented message.
        self.tracker = None;
        self.retransmit_job = None;

        if let Some(mid) = initiate {
            self.initiating.mid = mid;
        }
        if let Some(mid) = respond {
            self.responding.mid = mid;
        }
        self.initiating.exchange = None;

        let now = Instant::now();
        for queued in self.queues.queued_tasks_mut() {
            queued.not_before = now;
            queued.task.migrate(sa);
        }
        // Active tasks go back to the head of the queue.
        let mut active: Vec<Box<dyn Task>> = self.queues.active_tasks_mut().drain(..).collect();
        while let Some(mut task) = active.pop() {
            task.migrate(sa);
            self.queues.queue_front(task, now);
        }

        self.reset_pending = true;
    }

    /// Move queued tasks from another manager onto this one
    /// (make-before-break reauthentication).
    pub fn adopt_tasks(&mut self, sa: SaId, other: &mut TaskManager) {
        let now = Instant::now();
        while let Some(mut queued) = other.queues.queued_tasks_mut().pop() {
            log::debug!("migrating {:?} task", queued.task.task_type());
            queued.task.migrate(sa);
            // No delays on the new SA.
            self.queues.queue_front(queued.task, now);
        }
    }

    /// Whether an exchange is being initiated right now.
    pub fn busy(&self) -> bool {
        self.queues.busy()
    }

    /// Drop all tasks.
    pub fn flush(&mut self) {
        self.queues.flush(TaskQueue::Queued);
        self.queues.flush(TaskQueue::Passive);
        self.queues.flush(TaskQueue::Active);
    }

    /// Drop all tasks on one list.
    pub fn flush_queue(&mut self, queue: TaskQueue) {
        self.queues.flush(queue);
    }

    /// Iterate the tasks on a list in execution order.
    pub fn tasks(&self, queue: TaskQueue) -> impl Iterator<Item = &dyn Task> {
        self.queues.tasks(queue)
    }

    /// Remove the task at `index` of a list.
    pub fn remove_task(&mut self, queue: TaskQueue, index: usize) -> Option<Box<dyn Task>> {
        self.queues.remove(queue, index)
    }

    // ========================================================================
    // SHARED PASSES
    // ========================================================================

    /// Run `derive_keys` on a key-exchange task of the given list, retiring
    /// it on success. Returns false on a fatal derivation failure.
    pub(crate) fn derive_keys_for(&mut self, queue: TaskQueue) -> bool {
        let tasks = match queue {
            TaskQueue::Active => self.queues.active_tasks_mut(),
            TaskQueue::Passive => self.queues.passive_tasks_mut(),
            TaskQueue::Queued => return true,
        };
        let Some(idx) = tasks.iter().position(|t| t.task_type() == TaskType::IkeInit) else {
            return true;
        };
        match tasks[idx].derive_keys() {
            crate::task::TaskStatus::Success => {
                tasks.remove(idx);
                true
            }
            crate::task::TaskStatus::NeedMore => true,
            _ => false,
        }
    }

    /// Record request-direction metrics from the tracker or plain packets.
    pub(crate) fn record_request_metrics(&self) {
        if let Some(tracker) = &self.tracker {
            self.metrics.record_request(
                tracker.total_original_size(),
                tracker.total_transmitted_size(),
                u64::from(tracker.retransmission_count()),
            );
        } else {
            let original: u64 = self.initiating.packets.iter().map(|p| p.len() as u64).sum();
            let rounds = u64::from(self.initiating.retransmitted.saturating_sub(1));
            self.metrics
                .record_request(original, original * (rounds + 1), rounds);
        }
    }
}

/// Which half's defragmenter an inbound fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentHalf {
    Initiating,
    Responding,
}

/// SHA-1 of outer packet bytes, for retransmit detection.
pub(crate) fn hash_bytes(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
