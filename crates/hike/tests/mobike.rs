// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MOBIKE interaction with the retransmission controller: transmission over
//! the task's path, deferral when no route exists, and probing cadence.

mod common;

use std::rc::Rc;

use common::*;
use hike::config::ROUTABILITY_CHECK_INTERVAL_MS;
use hike::sa::{Condition, SaState};
use hike::{ManagerStatus, Settings};

#[test]
fn test_mobike_no_route_defers_exchange() {
    let mut sa = TestSa::initiator();
    sa.state = SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    let task = MobikeTask::new();
    let transmit_ok = Rc::clone(&task.transmit_ok);
    let transmits = Rc::clone(&task.transmits);
    transmit_ok.set(false);
    mgr.queue_task(task.boxed());

    // No route: the exchange is deferred, the SA goes stale, no timer.
    assert_eq!(
        mgr.initiate(&mut sa, &mut h.rt()),
        ManagerStatus::InvalidState
    );
    assert_eq!(transmits.get(), 1);
    assert!(h.sender.sent.is_empty(), "packets go over the MOBIKE path");
    assert!(h.scheduler.retransmits.is_empty());
    assert!(sa
        .conditions
        .borrow()
        .contains(&(Condition::Stale, true)));

    // A path appears again: initiate re-enters the deferred exchange.
    transmit_ok.set(true);
    assert_eq!(mgr.initiate(&mut sa, &mut h.rt()), ManagerStatus::Ok);
    assert_eq!(transmits.get(), 2);
    assert_eq!(h.scheduler.retransmits.len(), 1);
}

#[test]
fn test_mobike_probing_uses_routability_interval() {
    let mut sa = TestSa::initiator();
    sa.state = SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    let task = MobikeTask::new();
    let probing = Rc::clone(&task.probing);
    mgr.queue_task(task.boxed());

    assert_eq!(mgr.initiate(&mut sa, &mut h.rt()), ManagerStatus::Ok);
    probing.set(true);

    // With probing active, the timer runs the aggressive interval.
    assert_eq!(mgr.retransmit(&mut sa, &mut h.rt(), 0), ManagerStatus::Ok);
    assert_eq!(
        h.last_retransmit_job().unwrap().delay_ms,
        ROUTABILITY_CHECK_INTERVAL_MS
    );
}
