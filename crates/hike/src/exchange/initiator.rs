// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Initiator half: task activation, request construction, response
//! processing and the retransmission decision tree.
//!
//! The sliding window is one: at most one outbound request is in flight,
//! and only its completion (or give-up) advances `initiating.mid`.
//!
//! Retransmission runs on a single timer shared by two regimes:
//!
//! ```text
//!                retransmit(mid) fires
//!                        |
//!         mid stale? ----+---- tracker for current mid
//!         yes: redirect  |     incomplete? redirect, else exit
//!                        v
//!              tracker complete? --> exit, no rearm
//!                        |
//!              attempts > max_tries? --> alert, DESTROY
//!                        |
//!        SFR on + peer supports + tracker?
//!          yes: resend missing fragments, fixed 1.8 s rearm
//!          no:  resend whole message, backoff rearm
//! ```

use std::time::Instant;

use super::{ManagerStatus, TaskManager, TaskQueue};
use crate::config::{ROUTABILITY_CHECK_INTERVAL_MS, ROUTABILITY_CHECK_TRIES, SELECTIVE_RETRY_DELAY_MS};
use crate::protocol::{ExchangeType, Message, NotifyType, Packet};
use crate::reliability::retransmission_timeout;
use crate::runtime::{Alert, Runtime};
use crate::sa::{Condition, IkeSa, SaState};
use crate::task::{TaskStatus, TaskType};

impl TaskManager {
    // ========================================================================
    // INITIATION
    // ========================================================================

    /// Activate eligible tasks and drive a new exchange, if any.
    pub fn initiate(&mut self, sa: &mut dyn IkeSa, rt: &mut Runtime<'_>) -> ManagerStatus {
        if let Some(exchange) = self.initiating.exchange {
            log::debug!("delaying task initiation, {exchange} exchange in progress");
            if self.initiating.deferred {
                // Re-initiate the deferred exchange.
                self.initiating.deferred = false;
                self.initiating.retransmitted = 0;
                return self.retransmit(sa, rt, self.initiating.mid);
            }
            return ManagerStatus::Ok;
        }

        let now = Instant::now();
        let mut exchange: Option<ExchangeType> = None;

        if !self.queues.busy() {
            log::debug!("activating new tasks");
            exchange = self.activate_for_state(sa.state(), now);
        } else {
            if !self.derive_keys_for(TaskQueue::Active) {
                return ManagerStatus::DestroyMe;
            }
            log::debug!("reinitiating already active tasks");
            for task in self.queues.tasks(TaskQueue::Active) {
                exchange = match task.task_type() {
                    TaskType::IkeInit => Some(ExchangeType::IkeSaInit),
                    TaskType::IkeAuth => Some(ExchangeType::IkeAuth),
                    TaskType::ChildCreate | TaskType::ChildRekey | TaskType::IkeRekey => {
                        Some(ExchangeType::CreateChildSa)
                    }
                    TaskType::IkeMobike => Some(ExchangeType::Informational),
                    _ => continue,
                };
                break;
            }
        }

        let Some(exchange) = exchange else {
            log::debug!("nothing to initiate");
            return ManagerStatus::Ok;
        };

        let mut message = Message::new(
            self.initiating.mid,
            exchange,
            true,
            sa.my_host(),
            sa.other_host(),
        );
        self.initiating.exchange = Some(exchange);
        self.initiating.retransmitted = 0;
        self.initiating.retransmit_sent = false;
        self.initiating.deferred = false;

        // Build pass.
        let mut i = 0;
        while i < self.queues.active_tasks_mut().len() {
            match self.queues.active_tasks_mut()[i].build(&mut message) {
                TaskStatus::Success => {
                    // Task completed, remove it.
                    self.queues.remove(TaskQueue::Active, i);
                }
                TaskStatus::NeedMore => i += 1,
                TaskStatus::Failed => {
                    self.initiating.exchange = None;
                    if !matches!(sa.state(), SaState::Connecting | SaState::Rekeyed) {
                        rt.bus.ike_updown(sa.id(), false);
                    }
                    self.flush();
                    return ManagerStatus::DestroyMe;
                }
                TaskStatus::DestroyMe => {
                    self.initiating.exchange = None;
                    self.flush();
                    return ManagerStatus::DestroyMe;
                }
            }
        }

        // A task may have retargeted the exchange during build.
        self.initiating.exchange = Some(message.exchange());

        let Some(packets) = self.generate(sa, &message) else {
            // Nothing left but to close the SA.
            self.flush();
            if !matches!(sa.state(), SaState::Connecting | SaState::Rekeyed) {
                rt.bus.ike_updown(sa.id(), false);
            }
            return ManagerStatus::DestroyMe;
        };
        self.initiating.packets = packets;

        // Post-build pass.
        let mut ok = true;
        let mut i = 0;
        while i < self.queues.active_tasks_mut().len() {
            match self.queues.active_tasks_mut()[i].post_build(&message) {
                TaskStatus::Success => {
                    self.queues.remove(TaskQueue::Active, i);
                }
                TaskStatus::NeedMore => i += 1,
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            self.flush();
            if !matches!(sa.state(), SaState::Connecting | SaState::Rekeyed) {
                rt.bus.ike_updown(sa.id(), false);
            }
            return ManagerStatus::DestroyMe;
        }

        // Initial dispatch runs through the retransmission controller with
        // a zeroed attempt counter.
        self.retransmit(sa, rt, self.initiating.mid)
    }

    /// Task activation per SA state. Returns the exchange type of the first
    /// activatable task group.
    fn activate_for_state(&mut self, state: SaState, now: Instant) -> Option<ExchangeType> {
        match state {
            SaState::Created => {
                self.queues.activate(TaskType::IkeVendor, now);
                if self.queues.activate(TaskType::IkeInit, now) {
                    self.initiating.mid = 0;
                    for follow_up in [
                        TaskType::IkeNatd,
                        TaskType::IkeCertPre,
                        TaskType::IkeAuth,
                        TaskType::IkeCertPost,
                        TaskType::IkeConfig,
                        TaskType::IkeAuthLifetime,
                        TaskType::IkeMobike,
                        // Last IKE-related task, then the first CHILD_SA.
                        TaskType::IkeEstablish,
                        TaskType::ChildCreate,
                    ] {
                        self.queues.activate(follow_up, now);
                    }
                    return Some(ExchangeType::IkeSaInit);
                }
                None
            }
            SaState::Established => {
                let priority: [(TaskType, ExchangeType); 12] = [
                    (TaskType::IkeMobike, ExchangeType::Informational),
                    (TaskType::IkeDelete, ExchangeType::Informational),
                    (TaskType::IkeRedirect, ExchangeType::Informational),
                    (TaskType::ChildDelete, ExchangeType::Informational),
                    (TaskType::IkeReauth, ExchangeType::Informational),
                    (TaskType::ChildCreate, ExchangeType::CreateChildSa),
                    (TaskType::ChildRekey, ExchangeType::CreateChildSa),
                    (TaskType::IkeRekey, ExchangeType::CreateChildSa),
                    (TaskType::IkeDpd, ExchangeType::Informational),
                    (TaskType::IkeAuthLifetime, ExchangeType::Informational),
                    (TaskType::IkeReauthComplete, ExchangeType::Informational),
                    (TaskType::IkeVerifyPeerCert, ExchangeType::Informational),
                ];
                for (task_type, exchange) in priority {
                    if self.queues.activate(task_type, now) {
                        return Some(exchange);
                    }
                }
                None
            }
            SaState::Rekeying | SaState::Rekeyed => {
                // Only a delete may start on a rekeyed SA.
                if self.queues.activate(TaskType::IkeDelete, now) {
                    return Some(ExchangeType::Informational);
                }
                None
            }
            _ => None,
        }
    }

    // ========================================================================
    // RETRANSMISSION
    // ========================================================================

    /// Timer entry point: (re)transmit the request with the given MID.
    ///
    /// Also performs the initial dispatch (attempt 0). Stale jobs — fired
    /// after their exchange advanced — either redirect into the current
    /// tracker or terminate silently.
    pub fn retransmit(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        message_id: u32,
    ) -> ManagerStatus {
        // The job is executing; its reference is spent.
        self.retransmit_job = None;

        let sfr = self.settings.selective_fragment_retransmission;
        let tracker_matches = self
            .tracker
            .as_ref()
            .is_some_and(|t| t.message_id() == message_id);

        // All fragments confirmed: nothing to do, no rearm.
        if sfr && tracker_matches && self.tracker.as_ref().is_some_and(|t| t.complete()) {
            log::debug!("all fragments of message {message_id} confirmed, retransmission stops");
            return ManagerStatus::Ok;
        }

        let is_selective = sfr && tracker_matches;
        let current = message_id == self.initiating.mid && !self.initiating.packets.is_empty();

        if !current && !is_selective {
            if message_id < self.initiating.mid {
                // Stale job from a completed exchange. If the current
                // message still has unacked fragments, drive it instead.
                if sfr
                    && self
                        .tracker
                        .as_ref()
                        .is_some_and(|t| t.message_id() == self.initiating.mid && !t.complete())
                {
                    return self.retransmit(sa, rt, self.initiating.mid);
                }
                log::debug!("stale retransmit job for message {message_id}, ignored");
                return ManagerStatus::Ok;
            }
            return ManagerStatus::InvalidState;
        }

        // MOBIKE routability checks ride INFORMATIONAL exchanges and use
        // their own transmit path and timing.
        let mobike_idx = if self.initiating.exchange == Some(ExchangeType::Informational) {
            self.queues
                .active_tasks_mut()
                .iter()
                .position(|t| t.task_type() == TaskType::IkeMobike)
        } else {
            None
        };
        let probing = match mobike_idx {
            Some(idx) => self.queues.active_tasks_mut()[idx]
                .mobike()
                .map(|m| m.is_probing())
                .unwrap_or(false),
            None => false,
        };

        let timeout;
        if !probing {
            if self.initiating.retransmitted > self.settings.retransmit.tries {
                log::info!(
                    "giving up after {} retransmits",
                    self.initiating.retransmitted - 1
                );
                rt.bus
                    .alert(sa.id(), Alert::RetransmitSendTimeout { message_id });
                return ManagerStatus::DestroyMe;
            }

            // Selective path: SFR on locally, peer advertised support, and
            // the tracked message is the one this job drives.
            if mobike_idx.is_none() && is_selective && self.peer_supports_selective {
                return self.retransmit_selective(sa, rt, message_id);
            }

            let mut t = retransmission_timeout(
                &self.settings.retransmit,
                self.initiating.retransmitted,
                true,
            );
            if self.initiating.retransmitted > 0 {
                rt.bus.alert(
                    sa.id(),
                    Alert::RetransmitSend {
                        message_id,
                        attempt: self.initiating.retransmitted,
                    },
                );
                self.initiating.retransmit_sent = true;
            }

            match mobike_idx {
                None => {
                    let simulate = self.settings.simulate_first_fragment_loss
                        && self.initiating.retransmitted == 0;
                    let bytes = Self::emit_packets(
                        rt,
                        &self.initiating.packets,
                        Some(sa.my_host()),
                        Some(sa.other_host()),
                        simulate,
                    );
                    if tracker_matches {
                        if let Some(tracker) = self.tracker.as_mut() {
                            tracker.record_transmitted(bytes);
                        }
                    }
                }
                Some(idx) => {
                    let packet = self.initiating.packets[0].clone();
                    if !self.mobike_transmit(idx, &packet) {
                        log::info!("no route found to reach peer, MOBIKE update deferred");
                        sa.set_condition(Condition::Stale, true);
                        self.initiating.deferred = true;
                        return ManagerStatus::InvalidState;
                    }
                    let probing_now = self.queues.active_tasks_mut()[idx]
                        .mobike()
                        .map(|m| m.is_probing())
                        .unwrap_or(false);
                    if probing_now {
                        t = ROUTABILITY_CHECK_INTERVAL_MS;
                    }
                }
            }
            timeout = t;
        } else {
            // Path probing is more aggressive than normal backoff.
            if self.initiating.retransmitted > ROUTABILITY_CHECK_TRIES {
                log::info!(
                    "giving up after {} path probings",
                    self.initiating.retransmitted - 1
                );
                return ManagerStatus::DestroyMe;
            }
            if self.initiating.retransmitted > 0 {
                log::info!("path probing attempt {}", self.initiating.retransmitted);
            }
            // probing implies an active MOBIKE task
            let Some(idx) = mobike_idx else {
                return ManagerStatus::InvalidState;
            };
            let packet = self.initiating.packets[0].clone();
            if !self.mobike_transmit(idx, &packet) {
                log::info!("no route found to reach peer, path probing deferred");
                sa.set_condition(Condition::Stale, true);
                self.initiating.deferred = true;
                return ManagerStatus::InvalidState;
            }
            timeout = ROUTABILITY_CHECK_INTERVAL_MS;
        }

        self.initiating.retransmitted += 1;
        let job_mid = if is_selective {
            message_id
        } else {
            self.initiating.mid
        };
        self.retransmit_job = Some(rt.scheduler.schedule_retransmit(sa.id(), job_mid, timeout));
        ManagerStatus::Ok
    }

    /// The selective regime: initial dispatch sends everything, later
    /// iterations resend only unacknowledged fragments, on a fixed delay.
    fn retransmit_selective(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        message_id: u32,
    ) -> ManagerStatus {
        if self.initiating.retransmitted > 0 {
            let now = Instant::now();
            let mut missing_packets: Vec<Packet> = Vec::new();
            let mut resent_bytes = 0u64;
            if let Some(tracker) = self.tracker.as_mut() {
                for fragment in tracker.missing_mut() {
                    missing_packets.push(fragment.packet().clone());
                    fragment.record_resend(now);
                    resent_bytes += u64::from(fragment.data_size());
                }
                if !missing_packets.is_empty() {
                    tracker.record_transmitted(resent_bytes);
                    tracker.record_selective_round();
                }
            }
            if missing_packets.is_empty() {
                log::debug!(
                    "no missing fragments for message {message_id}, waiting for remaining acks"
                );
            } else {
                log::info!(
                    "selectively retransmitting {} fragment(s) of message {message_id}",
                    missing_packets.len()
                );
                Self::emit_packets(
                    rt,
                    &missing_packets,
                    Some(sa.my_host()),
                    Some(sa.other_host()),
                    false,
                );
            }
        } else {
            // Initial transmission: all fragments.
            let simulate = self.settings.simulate_first_fragment_loss;
            let bytes = Self::emit_packets(
                rt,
                &self.initiating.packets,
                Some(sa.my_host()),
                Some(sa.other_host()),
                simulate,
            );
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.record_transmitted(bytes);
            }
        }

        self.initiating.retransmitted += 1;

        // An ACK processed while sending may have completed the message.
        if self.tracker.as_ref().is_some_and(|t| t.complete()) {
            return ManagerStatus::Ok;
        }

        // The tracker's MID, not the job's: a stale job redirected here must
        // rearm for the message actually in flight.
        let job_mid = self
            .tracker
            .as_ref()
            .map_or(message_id, |t| t.message_id());
        self.retransmit_job = Some(rt.scheduler.schedule_retransmit(
            sa.id(),
            job_mid,
            SELECTIVE_RETRY_DELAY_MS,
        ));
        ManagerStatus::Ok
    }

    fn mobike_transmit(&mut self, idx: usize, packet: &Packet) -> bool {
        match self.queues.active_tasks_mut()[idx].mobike() {
            Some(mobike) => mobike.transmit(packet),
            None => false,
        }
    }

    // ========================================================================
    // RESPONSE PROCESSING
    // ========================================================================

    /// Handle the response matching the in-flight request.
    pub(crate) fn process_response(
        &mut self,
        sa: &mut dyn IkeSa,
        rt: &mut Runtime<'_>,
        msg: &Message,
    ) -> ManagerStatus {
        if msg
            .get_notify(NotifyType::SelectiveRetransmissionSupported)
            .is_some()
        {
            self.peer_supports_selective = true;
            log::info!("peer supports selective fragment retransmission");
        }

        if self.initiating.exchange != Some(msg.exchange()) {
            if msg.exchange() == ExchangeType::Informational && self.initiating.exchange.is_none()
            {
                // A late INFORMATIONAL (the ACK channel) after exchange
                // completion; process it normally.
                log::debug!("INFORMATIONAL response after exchange completion");
            } else {
                log::info!(
                    "received {} response, but expected {}",
                    msg.exchange(),
                    self.initiating
                        .exchange
                        .map_or_else(|| "no exchange".to_string(), |e| e.to_string())
                );
                rt.bus.ike_updown(sa.id(), false);
                return ManagerStatus::DestroyMe;
            }
        }

        // Fatal INVALID_SYNTAX in protected exchanges.
        if matches!(
            msg.exchange(),
            ExchangeType::CreateChildSa | ExchangeType::Informational
        ) && msg.get_notify(NotifyType::InvalidSyntax).is_some()
        {
            log::info!("received INVALID_SYNTAX notify error, destroying IKE_SA");
            rt.bus.ike_updown(sa.id(), false);
            return ManagerStatus::DestroyMe;
        }

        // Pre-process pass.
        let mut i = 0;
        while i < self.queues.active_tasks_mut().len() {
            match self.queues.active_tasks_mut()[i].pre_process(msg) {
                TaskStatus::Success => i += 1,
                TaskStatus::DestroyMe => return ManagerStatus::DestroyMe,
                _ => {
                    // Just ignore the message.
                    log::info!("ignore invalid {} response", msg.exchange());
                    return ManagerStatus::Ok;
                }
            }
        }

        if self.initiating.retransmit_sent {
            rt.bus.alert(sa.id(), Alert::RetransmitSendCleared);
        }

        // Process pass; catch resets issued from inside tasks.
        self.reset_pending = false;
        let mut i = 0;
        while i < self.queues.active_tasks_mut().len() {
            match self.queues.active_tasks_mut()[i].process(msg) {
                TaskStatus::Success => {
                    self.queues.remove(TaskQueue::Active, i);
                }
                TaskStatus::NeedMore => i += 1,
                TaskStatus::Failed => {
                    rt.bus.ike_updown(sa.id(), false);
                    self.queues.remove(TaskQueue::Active, i);
                    return ManagerStatus::DestroyMe;
                }
                TaskStatus::DestroyMe => {
                    self.queues.remove(TaskQueue::Active, i);
                    return ManagerStatus::DestroyMe;
                }
            }
            if self.reset_pending {
                // Start all over again.
                self.reset_pending = false;
                return self.initiate(sa, rt);
            }
        }

        // Post-process pass.
        let mut i = 0;
        while i < self.queues.active_tasks_mut().len() {
            match self.queues.active_tasks_mut()[i].post_process(msg) {
                TaskStatus::Success => {
                    self.queues.remove(TaskQueue::Active, i);
                }
                TaskStatus::NeedMore => i += 1,
                _ => {
                    self.queues.remove(TaskQueue::Active, i);
                    return ManagerStatus::DestroyMe;
                }
            }
        }

        // Exchange complete.
        self.record_request_metrics();
        let old_mid = self.initiating.mid;
        self.initiating.mid += 1;
        self.initiating.exchange = None;

        if self.retransmit_job.take().is_some() {
            log::debug!("clearing retransmit job reference for message {old_mid}");
        }
        if self
            .tracker
            .as_ref()
            .is_some_and(|t| t.message_id() == old_mid)
        {
            // The request was evidently delivered; a late ACK for it is
            // logged and ignored by the no-tracker path.
            self.tracker = None;
        }
        self.initiating.packets.clear();

        self.initiate(sa, rt)
    }
}
