// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Responder half: request classification, passive task spawning, response
//! construction and the retransmit-response cache.
//!
//! The window check on inbound requests:
//!
//! ```text
//!   mid == rx_mid            -> new request, process
//!   mid == rx_mid - 1
//!     and first-fragment hash
//!     matches prev request   -> retransmission, replay cached response
//!   mid == 0 and the message
//!     carries FRAGMENT_ACK   -> the dedicated ACK channel, always taken
//!   anything else            -> ignored
//! ```

use super::{hash_bytes, ManagerStatus, RetransmitCheck, TaskManager, TaskQueue};
use crate::protocol::{ExchangeType, Message, NotifyType, Payload, ProtocolId};
use crate::runtime::Runtime;
use crate::sa::{Extension, IkeSa, SaState};
use crate::task::{TaskSpec, TaskStatus, TaskType};

impl TaskManager {
    // ========================================================================
    // WINDOW CHECKS
    // ========================================================================

    /// Classify an inbound request against the receive window.
    pub(crate) fn is_retransmit(&self, msg: &Message) -> RetransmitCheck {
        let mid = msg.mid();

        // The ACK channel uses MID 0 and bypasses the window entirely, but
        // only for INFORMATIONAL messages actually carrying a FRAGMENT_ACK.
        if mid == 0
            && msg.exchange() == ExchangeType::Informational
            && Self::has_fragment_ack(msg)
        {
            return RetransmitCheck::AckChannel;
        }

        if mid == self.responding.mid {
            return RetransmitCheck::Process;
        }

        if mid.wrapping_add(1) == self.responding.mid && !self.responding.packets.is_empty() {
            // Only the first fragment was hashed, so fragments with higher
            // numbers never match here; responses to those must not be
            // retransmitted anyway.
            if let Some(data) = msg.packet_data() {
                if self.responding.prev_hash == Some(hash_bytes(data)) {
                    return RetransmitCheck::Replay;
                }
            }
        }
        RetransmitCheck::Ignore
    }

    /// Whether a MID-0 INFORMATIONAL could be a message-ID sync exchange.
    /// Callable before the body is parsed.
    pub(crate) fn is_potential_mid_sync(&self, sa: &dyn IkeSa, msg: &Message) -> bool {
        msg.exchange() == ExchangeType::Informational
            && sa.state() == SaState::Established
            && sa.supports_extension(Extension::MessageIdSync)
    }

    /// Whether the parsed message consists exclusively of sync notifies.
    pub(crate) fn is_mid_sync(msg: &Message) -> bool {
        let mut found = false;
        for payload in msg.payloads() {
            match payload {
                Payload::Notify(n) if n.kind.is_sync() => found = true,
                _ => return false,
            }
        }
        found
    }

    /// The request rejection matrix: initial exchanges only in their
    /// states, nothing but INFORMATIONAL on a rekeyed SA, nothing on a
    /// half-open SA we initiated -- except the ACK channel.
    pub(crate) fn reject_request(&self, sa: &dyn IkeSa, msg: &Message) -> bool {
        let state = sa.state();
        let exchange = msg.exchange();

        let mut reject = match exchange {
            ExchangeType::IkeSaInit => state != SaState::Created,
            // Only while the key exchanges are not done yet.
            ExchangeType::IkeIntermediate => {
                state != SaState::Connecting
                    || !self.queues.has_queued(TaskQueue::Passive, TaskType::IkeInit)
            }
            ExchangeType::IkeAuth => state != SaState::Connecting,
            _ => false,
        };

        if !reject {
            match state {
                // After rekeying only a DELETE in an INFORMATIONAL.
                SaState::Rekeyed => reject = exchange != ExchangeType::Informational,
                // Reject requests on half-open SAs we initiated, but let
                // fragment ACKs through so our IKE_AUTH fragments can be
                // confirmed.
                SaState::Created | SaState::Connecting => {
                    reject = sa.is_initiator();
                    if reject
                        && exchange == ExchangeType::Informational
                        && Self::has_fragment_ack(msg)
                    {
                        reject = false;
                    }
                }
                _ => {}
            }
        }

        if reject {
            log::info!("ignoring {exchange} in IKE_SA state {state:?}");
        }
        reject
    }

    // ========================================================================
    // REQUEST PROCESSING
    // ========================================================================

    /// Handle an inbound request: spawn passive tasks for it, run the task
    /// passes and build the response.
    pub(crate) fn process_request(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        msg: &Message,
    ) -> ManagerStatus {
        // The capability notify appears in IKE_SA_INIT and IKE_INTERMEDIATE
        // requests.
        if msg
            .get_notify(NotifyType::SelectiveRetransmissionSupported)
            .is_some()
        {
            self.peer_supports_selective = true;
            log::info!("peer supports selective fragment retransmission");
        }

        if self.queues.len(TaskQueue::Passive) == 0 {
            if let Some(status) = self.spawn_passive_tasks(sa, msg) {
                return status;
            }
        }

        // Pre-process pass.
        let mut i = 0;
        while i < self.queues.passive_tasks_mut().len() {
            match self.queues.passive_tasks_mut()[i].pre_process(msg) {
                TaskStatus::Success => i += 1,
                TaskStatus::DestroyMe => return ManagerStatus::DestroyMe,
                _ => {
                    log::info!("ignore invalid {} request", msg.exchange());
                    return match msg.exchange() {
                        // No point in keeping an SA created by an invalid
                        // IKE_SA_INIT.
                        ExchangeType::IkeSaInit => ManagerStatus::DestroyMe,
                        ExchangeType::IkeAuth => ManagerStatus::NeedMore,
                        _ => {
                            self.queues.flush(TaskQueue::Passive);
                            ManagerStatus::NeedMore
                        }
                    };
                }
            }
        }

        // Process pass.
        let mut i = 0;
        while i < self.queues.passive_tasks_mut().len() {
            match self.queues.passive_tasks_mut()[i].process(msg) {
                TaskStatus::Success => {
                    self.queues.remove(TaskQueue::Passive, i);
                }
                TaskStatus::NeedMore => i += 1,
                TaskStatus::Failed => {
                    rt.bus.ike_updown(sa.id(), false);
                    self.queues.remove(TaskQueue::Passive, i);
                    return ManagerStatus::DestroyMe;
                }
                TaskStatus::DestroyMe => {
                    self.queues.remove(TaskQueue::Passive, i);
                    return ManagerStatus::DestroyMe;
                }
            }
        }

        // Post-process pass.
        let mut i = 0;
        while i < self.queues.passive_tasks_mut().len() {
            match self.queues.passive_tasks_mut()[i].post_process(msg) {
                TaskStatus::Success => {
                    self.queues.remove(TaskQueue::Passive, i);
                }
                TaskStatus::NeedMore => i += 1,
                _ => {
                    self.queues.remove(TaskQueue::Passive, i);
                    return ManagerStatus::DestroyMe;
                }
            }
        }

        self.build_response(sa, rt, msg)
    }

    /// Create the passive tasks answering a request, by exchange type.
    /// Returns a status to short-circuit with, or `None` to continue.
    fn spawn_passive_tasks(&mut self, sa: &mut dyn IkeSa, msg: &Message) -> Option<ManagerStatus> {
        let state = sa.state();
        match msg.exchange() {
            ExchangeType::IkeSaInit => {
                for task_type in [
                    TaskType::IkeVendor,
                    TaskType::IkeInit,
                    TaskType::IkeNatd,
                    TaskType::IkeCertPre,
                    TaskType::IkeAuth,
                    TaskType::IkeCertPost,
                    TaskType::IkeConfig,
                    TaskType::IkeMobike,
                    // Generally the last IKE-related task; auth-lifetime
                    // comes after it to send the final reauth time.
                    TaskType::IkeEstablish,
                    TaskType::IkeAuthLifetime,
                ] {
                    let task = self.factory.create(&TaskSpec::Simple(task_type), false);
                    self.queues.push_passive(task);
                }
                let child = self.factory.create(
                    &TaskSpec::Child {
                        config: None,
                        args: None,
                    },
                    false,
                );
                self.queues.push_passive(child);
            }
            ExchangeType::CreateChildSa => {
                if matches!(state, SaState::Created | SaState::Connecting) {
                    log::info!("received CREATE_CHILD_SA request for unestablished IKE_SA, rejected");
                    return Some(ManagerStatus::Failed);
                }

                let mut rekey_notify = false;
                let mut ts_found = false;
                for payload in msg.payloads() {
                    match payload {
                        Payload::Notify(n)
                            if n.kind == NotifyType::RekeySa
                                && matches!(n.protocol, ProtocolId::Ah | ProtocolId::Esp) =>
                        {
                            // A rekey notify for AH/ESP means CHILD_SA
                            // rekeying.
                            rekey_notify = true;
                        }
                        Payload::TsInitiator | Payload::TsResponder => ts_found = true,
                        _ => {}
                    }
                }

                // Without traffic selectors this is IKE_SA rekeying.
                let spec = if ts_found {
                    if rekey_notify {
                        TaskSpec::ChildRekey {
                            protocol: ProtocolId::None,
                            spi: 0,
                        }
                    } else {
                        TaskSpec::Child {
                            config: None,
                            args: None,
                        }
                    }
                } else {
                    TaskSpec::Simple(TaskType::IkeRekey)
                };
                let task = self.factory.create(&spec, false);
                self.queues.push_passive(task);
            }
            ExchangeType::Informational => {
                let mut spec: Option<TaskSpec> = None;
                for payload in msg.payloads() {
                    match payload {
                        Payload::Notify(n) => {
                            if state == SaState::Rekeyed {
                                log::info!(
                                    "received unexpected notify {:?} for rekeyed IKE_SA, ignored",
                                    n.kind
                                );
                                continue;
                            }
                            match n.kind {
                                NotifyType::FragmentAck => {
                                    // Processed inline; no task.
                                    self.process_fragment_ack(msg);
                                }
                                kind if kind.is_mobike_family() => {
                                    spec = Some(TaskSpec::Simple(TaskType::IkeMobike));
                                }
                                NotifyType::AuthLifetime => {
                                    spec = Some(TaskSpec::Simple(TaskType::IkeAuthLifetime));
                                }
                                NotifyType::InvalidSyntax | NotifyType::AuthenticationFailed => {
                                    // The peer failed to authenticate us or
                                    // to parse our response; delete runs
                                    // the required hooks.
                                    spec = Some(TaskSpec::Simple(TaskType::IkeDelete));
                                }
                                NotifyType::Redirect => {
                                    spec = Some(TaskSpec::Simple(TaskType::IkeRedirect));
                                }
                                NotifyType::MessageIdSync => {
                                    spec = Some(TaskSpec::Simple(TaskType::IkeMidSync));
                                }
                                _ => {}
                            }
                        }
                        Payload::Delete { protocol, .. } => {
                            spec = Some(if *protocol == ProtocolId::Ike {
                                TaskSpec::Simple(TaskType::IkeDelete)
                            } else {
                                // The task reads SPIs from the payload.
                                TaskSpec::ChildDelete {
                                    protocol: ProtocolId::None,
                                    spi: 0,
                                    expired: false,
                                }
                            });
                        }
                        _ => {}
                    }
                    if spec.is_some() {
                        break;
                    }
                }
                // Nothing relevant: the peer is checking liveliness.
                let spec = spec.unwrap_or(TaskSpec::Simple(TaskType::IkeDpd));
                let task = self.factory.create(&spec, false);
                self.queues.push_passive(task);
            }
            ExchangeType::IkeAuth | ExchangeType::IkeIntermediate => {
                // Handled by the passive tasks spawned for IKE_SA_INIT.
            }
        }
        None
    }

    // ========================================================================
    // RESPONSE CONSTRUCTION
    // ========================================================================

    /// Build, cache and send the response to the current request.
    pub(crate) fn build_response(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        request: &Message,
    ) -> ManagerStatus {
        // Send the response along the path the request came in.
        let me = request.destination();
        let other = request.source();
        let mut message = Message::new(self.responding.mid, request.exchange(), false, me, other);

        let mut delete = false;
        let mut hook = false;
        let mut mid_sync = false;

        // Build pass with collision handling: a passive task that reached
        // its decision point may be adopted by a colliding active task.
        let mut i = 0;
        while i < self.queues.passive_tasks_mut().len() {
            if self.queues.passive_tasks_mut()[i].task_type() == TaskType::IkeMidSync {
                mid_sync = true;
            }
            match self.queues.passive_tasks_mut()[i].build(&mut message) {
                TaskStatus::Success => {
                    if let Some(task) = self.queues.remove(TaskQueue::Passive, i) {
                        // Completed; drop it unless an active task adopts it.
                        drop(self.queues.handle_collision(task));
                    }
                }
                TaskStatus::NeedMore => {
                    if let Some(task) = self.queues.remove(TaskQueue::Passive, i) {
                        match self.queues.handle_collision(task) {
                            Some(task) => {
                                self.queues.passive_tasks_mut().insert(i, task);
                                i += 1;
                            }
                            None => {}
                        }
                    }
                }
                status @ (TaskStatus::Failed | TaskStatus::DestroyMe) => {
                    if status == TaskStatus::Failed {
                        hook = true;
                    }
                    if let Some(task) = self.queues.remove(TaskQueue::Passive, i) {
                        drop(self.queues.handle_collision(task));
                    }
                    // Destroy the IKE_SA, but send the response first.
                    delete = true;
                    break;
                }
            }
        }

        // Advertise selective fragment retransmission in IKE_SA_INIT
        // responses.
        if self.settings.selective_fragment_retransmission
            && request.exchange() == ExchangeType::IkeSaInit
        {
            message.add_notify(
                ProtocolId::None,
                NotifyType::SelectiveRetransmissionSupported,
                Vec::new(),
            );
            log::info!("advertising selective fragment retransmission support");
        }

        // Message complete; generate and cache for retransmitted requests.
        self.responding.packets.clear();
        let Some(packets) = self.generate(sa, &message) else {
            rt.bus.ike_updown(sa.id(), false);
            return ManagerStatus::DestroyMe;
        };
        self.responding.packets = packets;

        if !delete {
            let mut i = 0;
            while i < self.queues.passive_tasks_mut().len() {
                match self.queues.passive_tasks_mut()[i].post_build(&message) {
                    TaskStatus::Success => {
                        self.queues.remove(TaskQueue::Passive, i);
                    }
                    TaskStatus::NeedMore => i += 1,
                    _ => {
                        rt.bus.ike_updown(sa.id(), false);
                        return ManagerStatus::DestroyMe;
                    }
                }
            }
        }

        let bytes = Self::emit_packets(rt, &self.responding.packets, None, None, false);
        // Both directions count MIDs from zero, so a matching MID alone does
        // not prove the tracker is the response's; a fragmented response has
        // just replaced it.
        if self.responding.packets.len() > 1 {
            if let Some(tracker) = self.tracker.as_mut() {
                if tracker.message_id() == self.responding.mid {
                    tracker.record_transmitted(bytes);
                }
            }
        }
        self.metrics().record_response(bytes, bytes, 0);

        if delete {
            if hook {
                rt.bus.ike_updown(sa.id(), false);
            }
            return ManagerStatus::DestroyMe;
        }
        if mid_sync {
            // Never resend a MID-sync response for requests with the
            // previous MID, and do not advance the expected MID after
            // handling a message with MID 0.
            self.responding.packets.clear();
            return ManagerStatus::NeedMore;
        }

        ManagerStatus::Ok
    }
}
