// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The task seam: units of protocol work the manager sequences.
//!
//! A task implements one piece of an exchange (authenticate, rekey, delete,
//! dead-peer detection, ...). The manager owns tasks, moves them between the
//! queued/active/passive lists and drives their hooks; everything
//! cryptographic stays inside the task and the SA container.
//!
//! Polymorphism is a plain trait object with a type tag for queue scans; no
//! inheritance hierarchy. Hooks the task does not care about keep their
//! defaults, which act like the hook being absent.

use std::net::SocketAddr;

use crate::protocol::{Message, Packet, ProtocolId};
use crate::sa::SaId;

/// Type tags for queue scanning and activation ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    IkeVendor,
    IkeInit,
    IkeNatd,
    IkeCertPre,
    IkeAuth,
    IkeCertPost,
    IkeConfig,
    IkeAuthLifetime,
    IkeMobike,
    IkeEstablish,
    IkeRekey,
    IkeReauth,
    IkeReauthComplete,
    IkeRedirect,
    IkeDelete,
    IkeVerifyPeerCert,
    IkeDpd,
    IkeMidSync,
    ChildCreate,
    ChildRekey,
    ChildDelete,
}

/// Result of a task hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task finished its work; the manager drops it.
    Success,
    /// Task needs at least one more exchange; keep it on its list.
    NeedMore,
    /// Task failed; the SA goes down after the usual notifications.
    Failed,
    /// Critical failure; destroy the SA immediately.
    DestroyMe,
}

/// A unit of protocol work with build/process hooks.
///
/// `build` adds the task's payloads to an outgoing message; `process`
/// consumes the peer's message. The `pre_`/`post_` hooks bracket those for
/// tasks that need to inspect a message before the main pass or act on the
/// generated packets after it. Defaults behave like the hook being absent.
pub trait Task {
    /// Type tag used for queue scans.
    fn task_type(&self) -> TaskType;

    /// Add this task's payloads to an outgoing message.
    fn build(&mut self, msg: &mut Message) -> TaskStatus;

    /// Consume an inbound message.
    fn process(&mut self, msg: &Message) -> TaskStatus;

    /// Inspect an inbound message before any task processes it. `Failed`
    /// means the whole message is ignored.
    fn pre_process(&mut self, _msg: &Message) -> TaskStatus {
        TaskStatus::Success
    }

    /// Act on an inbound message after the main pass.
    fn post_process(&mut self, _msg: &Message) -> TaskStatus {
        TaskStatus::NeedMore
    }

    /// Act on an outgoing message after generation.
    fn post_build(&mut self, _msg: &Message) -> TaskStatus {
        TaskStatus::NeedMore
    }

    /// Derive IKE keys, for key-exchange tasks. Called before protected
    /// inbound messages are parsed and before re-initiating an in-progress
    /// exchange. `Success` retires the task, `NeedMore` keeps it, anything
    /// else destroys the SA.
    fn derive_keys(&mut self) -> TaskStatus {
        TaskStatus::NeedMore
    }

    /// Re-target the task at another SA (reset, adoption).
    fn migrate(&mut self, _sa: SaId) {}

    /// Offer a colliding passive task for adoption. Adopting tasks take
    /// ownership and return `None`; the default declines by handing the
    /// task back.
    fn collide(&mut self, passive: Box<dyn Task>) -> Option<Box<dyn Task>> {
        Some(passive)
    }

    /// MOBIKE capabilities, for the one task type that has them.
    fn mobike(&mut self) -> Option<&mut dyn MobikeOps> {
        None
    }
}

/// Extra surface of the MOBIKE task the retransmission path needs.
pub trait MobikeOps {
    /// Whether the task is currently path-probing.
    fn is_probing(&self) -> bool;

    /// Transmit a packet over the task's candidate path. Returns false when
    /// no route to the peer exists.
    fn transmit(&mut self, packet: &Packet) -> bool;

    /// Turn an already-active MOBIKE task into a probing one.
    fn enable_probing(&mut self);

    /// Record an address-roam trigger.
    fn roam(&mut self, address_changed: bool);

    /// Record an address-list update trigger.
    fn addresses(&mut self);

    /// Use this task as a MOBIKE-based dead peer detection round.
    fn dpd(&mut self);
}

/// Arguments for creating a CHILD_SA with inherited attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildInitArgs {
    /// Reqid to reuse, 0 for a fresh one.
    pub reqid: u32,
    /// Security label, if any.
    pub label: Option<Vec<u8>>,
    /// Narrowed source of the triggering packet.
    pub src: Option<SocketAddr>,
    /// Narrowed destination of the triggering packet.
    pub dst: Option<SocketAddr>,
}

/// Opaque handle to a CHILD_SA configuration owned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildConfigId(pub u64);

/// What kind of task to create, with its construction arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSpec {
    /// A task needing nothing beyond its type.
    Simple(TaskType),
    /// CHILD_SA creation.
    Child {
        config: Option<ChildConfigId>,
        args: Option<ChildInitArgs>,
    },
    /// CHILD_SA rekeying for a specific SA.
    ChildRekey { protocol: ProtocolId, spi: u32 },
    /// CHILD_SA deletion.
    ChildDelete {
        protocol: ProtocolId,
        spi: u32,
        expired: bool,
    },
}

impl TaskSpec {
    /// The type tag the created task will report.
    #[must_use]
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Simple(t) => *t,
            Self::Child { .. } => TaskType::ChildCreate,
            Self::ChildRekey { .. } => TaskType::ChildRekey,
            Self::ChildDelete { .. } => TaskType::ChildDelete,
        }
    }
}

/// Creates task objects. The client supplies this: task internals (crypto,
/// policy, kernel interaction) live outside the exchange manager.
pub trait TaskFactory {
    /// Create a task. `initiator` tells the task which side of the exchange
    /// it drives.
    fn create(&mut self, spec: &TaskSpec, initiator: bool) -> Box<dyn Task>;
}
