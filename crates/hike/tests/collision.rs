// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exchange collisions: both peers start a rekey at the same time, and the
//! active task adopts the passive one so only one rekey proceeds.

mod common;

use std::rc::Rc;

use common::*;
use hike::{
    ExchangeType, ManagerStatus, Message, NotifyType, Payload, ProtocolId, Settings, TaskQueue,
    TaskStatus, TaskType,
};

#[test]
fn test_simultaneous_ike_rekey_adopts_passive_task() {
    let mut sa = TestSa::initiator();
    sa.state = hike::SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, created) = manager(Settings::default());

    // Our own rekey goes out first.
    let rekey = ScriptedTask::new(TaskType::IkeRekey).adopting().on_build(Some(40), TaskStatus::NeedMore);
    let adopted = Rc::clone(&rekey.adopted);
    mgr.queue_task(rekey.boxed());
    assert_eq!(mgr.initiate(&mut sa, &mut h.rt()), ManagerStatus::Ok);
    assert_eq!(h.take_sent().len(), 1);
    assert!(mgr.busy());

    // The peer's CREATE_CHILD_SA request arrives: no traffic selectors, so
    // it is an IKE rekey and collides with ours.
    let request = to_wire(&Message::new(
        0,
        ExchangeType::CreateChildSa,
        true,
        addr_b(),
        addr_a(),
    ));
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), request),
        ManagerStatus::Ok
    );

    // The passive rekey was spawned, offered and adopted; a response still
    // went out and the window advanced.
    assert!(created.borrow().contains(&TaskType::IkeRekey));
    assert!(adopted.get());
    assert_eq!(mgr.tasks(TaskQueue::Passive).count(), 0);
    assert!(!h.sender.sent.is_empty());
    assert_eq!(mgr.get_mid(false), 1);

    // Our own exchange is still in flight.
    assert!(mgr.busy());
    assert_eq!(
        mgr.tasks(TaskQueue::Active).next().unwrap().task_type(),
        TaskType::IkeRekey
    );
}

#[test]
fn test_child_rekey_request_classification() {
    // A CREATE_CHILD_SA with traffic selectors and a REKEY_SA notify for
    // ESP spawns a CHILD rekey, not an IKE rekey.
    let mut sa = TestSa::responder();
    sa.state = hike::SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, created) = manager(Settings::default());

    let mut request = Message::new(0, ExchangeType::CreateChildSa, true, addr_a(), addr_b());
    request.add_notify(ProtocolId::Esp, NotifyType::RekeySa, vec![0, 0, 0, 1]);
    request.add_payload(Payload::TsInitiator);
    request.add_payload(Payload::TsResponder);
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), to_wire(&request)),
        ManagerStatus::Ok
    );
    assert_eq!(created.borrow().as_slice(), &[TaskType::ChildRekey]);
}

#[test]
fn test_child_create_request_classification() {
    // Traffic selectors without a rekey notify mean CHILD_SA creation.
    let mut sa = TestSa::responder();
    sa.state = hike::SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, created) = manager(Settings::default());

    let mut request = Message::new(0, ExchangeType::CreateChildSa, true, addr_a(), addr_b());
    request.add_payload(Payload::TsInitiator);
    request.add_payload(Payload::TsResponder);
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), to_wire(&request)),
        ManagerStatus::Ok
    );
    assert_eq!(created.borrow().as_slice(), &[TaskType::ChildCreate]);
}

#[test]
fn test_create_child_sa_rejected_on_unestablished_sa() {
    let mut sa = TestSa::responder();
    sa.state = hike::SaState::Connecting;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    let request = to_wire(&Message::new(
        0,
        ExchangeType::CreateChildSa,
        true,
        addr_a(),
        addr_b(),
    ));
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), request),
        ManagerStatus::DestroyMe
    );
}
