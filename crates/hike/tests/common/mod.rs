// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared harness for exchange manager scenario tests.
//!
//! Provides an in-memory SA over the internal wire form, a recording
//! sender/bus, a manual-clock scheduler and scriptable tasks, so scenarios
//! drive the real manager code paths end to end without a network.

#![allow(dead_code)] // Not every test file uses every helper.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hike::config::Settings;
use hike::protocol::Fragmenter;
use hike::runtime::{Alert, EventBus, JobId, Runtime, Scheduler, Sender};
use hike::sa::{Condition, Extension, IkeSa, ParseStatus, SaId, SaState, UpdateHosts};
use hike::task::{MobikeOps, Task, TaskFactory, TaskSpec, TaskStatus, TaskType};
use hike::{Message, NotifyType, Packet, ProtocolId, TaskManager};

pub fn addr_a() -> SocketAddr {
    "192.0.2.1:500".parse().unwrap()
}

pub fn addr_b() -> SocketAddr {
    "192.0.2.2:500".parse().unwrap()
}

// ---------------------------------------------------------------------------
// SA double
// ---------------------------------------------------------------------------

/// In-memory SA: fragments over the internal wire form, parses nothing away.
pub struct TestSa {
    pub id: SaId,
    pub state: SaState,
    pub initiator: bool,
    pub me: SocketAddr,
    pub other: SocketAddr,
    pub mtu: usize,
    pub extensions: Vec<Extension>,
    pub parse_status: ParseStatus,
    pub config_attached: bool,
    pub conditions: RefCell<Vec<(Condition, bool)>>,
}

impl TestSa {
    pub fn initiator() -> Self {
        Self::new(1, true, addr_a(), addr_b())
    }

    pub fn responder() -> Self {
        Self::new(2, false, addr_b(), addr_a())
    }

    fn new(id: SaId, initiator: bool, me: SocketAddr, other: SocketAddr) -> Self {
        Self {
            id,
            state: SaState::Created,
            initiator,
            me,
            other,
            mtu: 1280,
            extensions: Vec::new(),
            parse_status: ParseStatus::Ok,
            config_attached: true,
            conditions: RefCell::new(Vec::new()),
        }
    }
}

impl IkeSa for TestSa {
    fn id(&self) -> SaId {
        self.id
    }
    fn state(&self) -> SaState {
        self.state
    }
    fn is_initiator(&self) -> bool {
        self.initiator
    }
    fn my_host(&self) -> SocketAddr {
        self.me
    }
    fn other_host(&self) -> SocketAddr {
        self.other
    }
    fn set_my_host(&mut self, addr: SocketAddr) {
        self.me = addr;
    }
    fn set_other_host(&mut self, addr: SocketAddr) {
        self.other = addr;
    }
    fn supports_extension(&self, ext: Extension) -> bool {
        self.extensions.contains(&ext)
    }
    fn set_condition(&mut self, cond: Condition, enabled: bool) {
        self.conditions.borrow_mut().push((cond, enabled));
    }
    fn update_hosts(&mut self, _me: SocketAddr, _other: SocketAddr, _mode: UpdateHosts) {}
    fn generate_message_fragmented(&mut self, msg: &Message) -> hike::Result<Vec<Packet>> {
        Ok(Fragmenter::new(self.mtu).fragment(msg))
    }
    fn generate_message(&mut self, msg: &Message) -> hike::Result<Packet> {
        Ok(msg.to_packet())
    }
    fn parse_body(&mut self, _msg: &mut Message) -> ParseStatus {
        self.parse_status
    }
    fn has_config(&self) -> bool {
        self.config_attached
    }
    fn lookup_config(&mut self, _me: SocketAddr, _other: SocketAddr) -> bool {
        self.config_attached = true;
        true
    }
    fn mark_inbound(&mut self, _now: Instant) {}
}

// ---------------------------------------------------------------------------
// Runtime doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Vec<Packet>,
}

impl Sender for RecordingSender {
    fn send(&mut self, packet: Packet) {
        self.sent.push(packet);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitJob {
    pub id: JobId,
    pub sa: SaId,
    pub message_id: u32,
    pub delay_ms: u32,
}

#[derive(Default)]
pub struct TestScheduler {
    next_id: JobId,
    pub retransmits: Vec<RetransmitJob>,
    pub initiates: Vec<(SaId, Duration)>,
    pub deletes: Vec<(SaId, Duration)>,
}

impl Scheduler for TestScheduler {
    fn schedule_retransmit(&mut self, sa: SaId, message_id: u32, delay_ms: u32) -> JobId {
        self.next_id += 1;
        self.retransmits.push(RetransmitJob {
            id: self.next_id,
            sa,
            message_id,
            delay_ms,
        });
        self.next_id
    }
    fn schedule_initiate(&mut self, sa: SaId, delay: Duration) {
        self.initiates.push((sa, delay));
    }
    fn schedule_delete(&mut self, sa: SaId, delay: Duration) {
        self.deletes.push((sa, delay));
    }
}

#[derive(Default)]
pub struct RecordingBus {
    pub alerts: Vec<Alert>,
    pub updown: Vec<(SaId, bool)>,
    pub reestablishes: Vec<SaId>,
}

impl EventBus for RecordingBus {
    fn alert(&mut self, _sa: SaId, alert: Alert) {
        self.alerts.push(alert);
    }
    fn ike_updown(&mut self, sa: SaId, up: bool) {
        self.updown.push((sa, up));
    }
    fn message(&mut self, _sa: SaId, _msg: &Message, _incoming: bool, _plain: bool) {}
    fn reestablish_requested(&mut self, sa: SaId) {
        self.reestablishes.push(sa);
    }
}

/// Bundles the runtime doubles and lends them out as a [`Runtime`].
#[derive(Default)]
pub struct Harness {
    pub sender: RecordingSender,
    pub scheduler: TestScheduler,
    pub bus: RecordingBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rt(&mut self) -> Runtime<'_> {
        Runtime {
            sender: &mut self.sender,
            scheduler: &mut self.scheduler,
            bus: &mut self.bus,
        }
    }

    /// Drain and return everything sent so far.
    pub fn take_sent(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.sender.sent)
    }

    /// The most recently armed retransmit job.
    pub fn last_retransmit_job(&self) -> Option<RetransmitJob> {
        self.scheduler.retransmits.last().copied()
    }
}

/// Decode an emitted packet back into a logical message, as the peer's
/// ingress would.
pub fn decode_packet(packet: &Packet) -> Message {
    Message::decode(&packet.data, packet.source, packet.destination).expect("emitted packet decodes")
}

// ---------------------------------------------------------------------------
// Scripted tasks
// ---------------------------------------------------------------------------

type BuildStep = (Option<usize>, TaskStatus);

/// A task whose hook results are scripted per call.
///
/// `on_build(Some(n), status)` makes that build call add an `n`-byte notify
/// payload. Exhausted scripts keep returning `NeedMore` without payloads.
pub struct ScriptedTask {
    task_type: TaskType,
    build_script: RefCell<VecDeque<BuildStep>>,
    process_script: RefCell<VecDeque<TaskStatus>>,
    adopts: bool,
    pub adopted: Rc<Cell<bool>>,
    pub builds: Rc<Cell<u32>>,
    pub processes: Rc<Cell<u32>>,
}

impl ScriptedTask {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            build_script: RefCell::new(VecDeque::new()),
            process_script: RefCell::new(VecDeque::new()),
            adopts: false,
            adopted: Rc::new(Cell::new(false)),
            builds: Rc::new(Cell::new(0)),
            processes: Rc::new(Cell::new(0)),
        }
    }

    pub fn on_build(self, payload: Option<usize>, status: TaskStatus) -> Self {
        self.build_script.borrow_mut().push_back((payload, status));
        self
    }

    pub fn on_process(self, status: TaskStatus) -> Self {
        self.process_script.borrow_mut().push_back(status);
        self
    }

    /// Make this task adopt colliding passive tasks.
    pub fn adopting(mut self) -> Self {
        self.adopts = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

impl Task for ScriptedTask {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn build(&mut self, msg: &mut Message) -> TaskStatus {
        self.builds.set(self.builds.get() + 1);
        let (payload, status) = self
            .build_script
            .borrow_mut()
            .pop_front()
            .unwrap_or((None, TaskStatus::NeedMore));
        if let Some(size) = payload {
            msg.add_notify(ProtocolId::None, NotifyType::Cookie2, vec![0x7e; size]);
        }
        status
    }

    fn process(&mut self, _msg: &Message) -> TaskStatus {
        self.processes.set(self.processes.get() + 1);
        self.process_script
            .borrow_mut()
            .pop_front()
            .unwrap_or(TaskStatus::NeedMore)
    }

    fn collide(&mut self, passive: Box<dyn Task>) -> Option<Box<dyn Task>> {
        if self.adopts {
            self.adopted.set(true);
            None
        } else {
            Some(passive)
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Factory producing inert tasks (every hook `NeedMore`-ish), recording
/// what it created.
pub struct ScriptedFactory {
    pub created: Rc<RefCell<Vec<TaskType>>>,
}

impl ScriptedFactory {
    pub fn new() -> (Box<dyn TaskFactory>, Rc<RefCell<Vec<TaskType>>>) {
        let created = Rc::new(RefCell::new(Vec::new()));
        (
            Box::new(Self {
                created: Rc::clone(&created),
            }),
            created,
        )
    }
}

impl TaskFactory for ScriptedFactory {
    fn create(&mut self, spec: &TaskSpec, _initiator: bool) -> Box<dyn Task> {
        self.created.borrow_mut().push(spec.task_type());
        ScriptedTask::new(spec.task_type()).boxed()
    }
}

// ---------------------------------------------------------------------------
// Message crafting
// ---------------------------------------------------------------------------

/// Round-trip a crafted message through the wire form so it arrives like a
/// real inbound packet (outer bytes attached).
pub fn to_wire(msg: &Message) -> Message {
    let packet = msg.to_packet();
    Message::decode(&packet.data, packet.source, packet.destination).unwrap()
}

/// A MID-0 INFORMATIONAL request carrying one FRAGMENT_ACK, as the peer's
/// reassembler would emit it, delivered from `from` to `to`.
pub fn ack_message(ack: &hike::FragmentAck, from: SocketAddr, to: SocketAddr) -> Message {
    let mut msg = Message::new(0, hike::ExchangeType::Informational, true, from, to);
    msg.add_notify(ProtocolId::None, NotifyType::FragmentAck, ack.encode().to_vec());
    let packet = msg.to_packet();
    Message::decode(&packet.data, packet.source, packet.destination).unwrap()
}

/// Build a manager around scripted settings and factory.
pub fn manager(settings: Settings) -> (TaskManager, Rc<RefCell<Vec<TaskType>>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (factory, created) = ScriptedFactory::new();
    (TaskManager::new(settings, factory), created)
}

/// A MOBIKE task double: transmits over its own path, optionally failing
/// (no route), optionally probing.
pub struct MobikeTask {
    pub probing: Rc<Cell<bool>>,
    pub transmit_ok: Rc<Cell<bool>>,
    pub transmits: Rc<Cell<u32>>,
}

impl MobikeTask {
    pub fn new() -> Self {
        Self {
            probing: Rc::new(Cell::new(false)),
            transmit_ok: Rc::new(Cell::new(true)),
            transmits: Rc::new(Cell::new(0)),
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

impl Task for MobikeTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeMobike
    }
    fn build(&mut self, msg: &mut Message) -> TaskStatus {
        msg.add_notify(ProtocolId::None, NotifyType::UpdateSaAddresses, Vec::new());
        TaskStatus::NeedMore
    }
    fn process(&mut self, _msg: &Message) -> TaskStatus {
        TaskStatus::NeedMore
    }
    fn mobike(&mut self) -> Option<&mut dyn MobikeOps> {
        Some(self)
    }
}

impl MobikeOps for MobikeTask {
    fn is_probing(&self) -> bool {
        self.probing.get()
    }
    fn transmit(&mut self, _packet: &Packet) -> bool {
        self.transmits.set(self.transmits.get() + 1);
        self.transmit_ok.get()
    }
    fn enable_probing(&mut self) {
        self.probing.set(true);
    }
    fn roam(&mut self, _address_changed: bool) {}
    fn addresses(&mut self) {}
    fn dpd(&mut self) {}
}
