// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Responder side: response caching and replay, the rejection matrix, and
//! per-fragment acknowledgment of inbound fragmented requests.

mod common;

use common::*;
use hike::protocol::Fragmenter;
use hike::runtime::Alert;
use hike::sa::SaState;
use hike::{
    ExchangeType, FragmentAck, ManagerStatus, Message, NotifyType, ProtocolId, Settings,
};

fn init_request(payload: usize) -> Message {
    let mut msg = Message::new(0, ExchangeType::IkeSaInit, true, addr_a(), addr_b());
    msg.add_notify(ProtocolId::None, NotifyType::Cookie2, vec![0x42; payload]);
    to_wire(&msg)
}

// ---------------------------------------------------------------------------
// Scenario: retransmitted request answered from the cache
// ---------------------------------------------------------------------------

#[test]
fn test_retransmitted_request_replays_cached_response() {
    let mut sa = TestSa::responder();
    let mut h = Harness::new();
    let (mut mgr, created) = manager(Settings::default());

    let request = init_request(40);
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), request.clone()),
        ManagerStatus::Ok
    );
    assert_eq!(mgr.get_mid(false), 1);

    let response = h.take_sent();
    assert!(!response.is_empty());
    // IKE_SA_INIT responses advertise selective retransmission support.
    assert!(decode_packet(&response[0])
        .get_notify(NotifyType::SelectiveRetransmissionSupported)
        .is_some());
    let tasks_created = created.borrow().len();
    assert!(tasks_created > 0);

    // The identical request again: cached response replayed, no task
    // re-run, window unchanged.
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), request),
        ManagerStatus::Ok
    );
    let replayed = h.take_sent();
    assert_eq!(replayed.len(), response.len());
    assert_eq!(replayed[0].data, response[0].data);
    assert_eq!(mgr.get_mid(false), 1);
    assert_eq!(created.borrow().len(), tasks_created);
    assert!(h
        .bus
        .alerts
        .contains(&Alert::RetransmitReceive { message_id: 0 }));
}

#[test]
fn test_unrelated_old_mid_request_is_ignored() {
    let mut sa = TestSa::responder();
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), init_request(40)),
        ManagerStatus::Ok
    );
    h.take_sent();

    // Same MID but different bytes: the first-fragment hash disagrees, so
    // this is no retransmission and gets dropped.
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), init_request(41)),
        ManagerStatus::Ok
    );
    assert!(h.sender.sent.is_empty());
}

#[test]
fn test_duplicate_without_cached_response_is_dropped() {
    let mut sa = TestSa::responder();
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    // The window sits at 1 but nothing was ever cached.
    mgr.incr_mid(false);
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), init_request(40)),
        ManagerStatus::Ok
    );
    assert!(h.sender.sent.is_empty());
    assert_eq!(mgr.get_mid(false), 1);
}

// ---------------------------------------------------------------------------
// Rejection matrix
// ---------------------------------------------------------------------------

#[test]
fn test_ike_sa_init_rejected_outside_created() {
    let mut sa = TestSa::responder();
    sa.state = SaState::Established;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), init_request(40)),
        ManagerStatus::Failed
    );
    assert!(h.sender.sent.is_empty());
}

#[test]
fn test_rekeyed_sa_accepts_only_informational() {
    let mut sa = TestSa::responder();
    sa.state = SaState::Rekeyed;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    let create = to_wire(&Message::new(
        0,
        ExchangeType::CreateChildSa,
        true,
        addr_a(),
        addr_b(),
    ));
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), create),
        ManagerStatus::Failed
    );
}

#[test]
fn test_half_open_initiator_rejects_requests_but_not_acks() {
    let mut sa = TestSa::initiator();
    sa.state = SaState::Connecting;
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    // A plain INFORMATIONAL request on a half-open SA we initiated: dropped.
    let info = to_wire(&Message::new(
        0,
        ExchangeType::Informational,
        true,
        addr_b(),
        addr_a(),
    ));
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), info),
        ManagerStatus::Failed
    );

    // The ACK channel still reaches us so IKE_AUTH fragments get confirmed.
    let ack = FragmentAck::from_received(1, 3, [1]);
    let msg = ack_message(&ack, addr_b(), addr_a());
    assert_eq!(mgr.process_message(&mut sa, &mut h.rt(), msg), ManagerStatus::Ok);
}

// ---------------------------------------------------------------------------
// Inbound fragments trigger immediate cumulative ACKs
// ---------------------------------------------------------------------------

#[test]
fn test_inbound_fragments_are_acknowledged_cumulatively() {
    let mut sa = TestSa::responder();
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings::default());

    // A fragmented IKE_SA_INIT request, as the peer would emit it.
    let mut big = Message::new(0, ExchangeType::IkeSaInit, true, addr_a(), addr_b());
    big.add_notify(ProtocolId::None, NotifyType::Cookie2, vec![0x42; 500]);
    let carriers: Vec<Message> = Fragmenter::new(200)
        .fragment(&big)
        .iter()
        .map(decode_packet)
        .collect();
    assert_eq!(carriers.len(), 3);

    // Fragments 1 and 2: absorbed, each answered with a growing bitmap.
    for (idx, carrier) in carriers.iter().take(2).enumerate() {
        assert_eq!(
            mgr.process_message(&mut sa, &mut h.rt(), carrier.clone()),
            ManagerStatus::Ok
        );
        let sent = h.take_sent();
        assert_eq!(sent.len(), 1, "fragment {} acked", idx + 1);
        let ack_msg = decode_packet(&sent[0]);
        assert_eq!(ack_msg.mid(), 0);
        assert!(ack_msg.is_request());
        let notify = ack_msg.get_notify(NotifyType::FragmentAck).unwrap();
        let ack = FragmentAck::decode(&notify.data).unwrap();
        let expected: Vec<u16> = (1..=idx as u16 + 1).collect();
        assert_eq!(ack.acked().collect::<Vec<_>>(), expected);
    }

    // The last fragment completes reassembly: full bitmap, then the
    // reassembled request is processed and answered.
    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), carriers[2].clone()),
        ManagerStatus::Ok
    );
    let sent = h.take_sent();
    assert!(sent.len() >= 2, "full-bitmap ack plus the response");
    let ack_msg = decode_packet(&sent[0]);
    let ack = FragmentAck::decode(&ack_msg.get_notify(NotifyType::FragmentAck).unwrap().data)
        .unwrap();
    assert_eq!(ack.acked().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(mgr.get_mid(false), 1);
}

#[test]
fn test_no_acks_when_selective_disabled() {
    let mut sa = TestSa::responder();
    let mut h = Harness::new();
    let (mut mgr, _) = manager(Settings {
        selective_fragment_retransmission: false,
        ..Settings::default()
    });

    let mut big = Message::new(0, ExchangeType::IkeSaInit, true, addr_a(), addr_b());
    big.add_notify(ProtocolId::None, NotifyType::Cookie2, vec![0x42; 500]);
    let carriers: Vec<Message> = Fragmenter::new(200)
        .fragment(&big)
        .iter()
        .map(decode_packet)
        .collect();

    assert_eq!(
        mgr.process_message(&mut sa, &mut h.rt(), carriers[0].clone()),
        ManagerStatus::Ok
    );
    assert!(h.sender.sent.is_empty(), "pre-SFR behavior: no fragment acks");
}
