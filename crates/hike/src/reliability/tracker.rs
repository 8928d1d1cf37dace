// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragment state tracking for one outbound fragmented message.
//!
//! The tracker retains every outer packet of the last fragmented message so
//! individual fragments can be resent, and folds incoming cumulative ACK
//! bitmaps into per-fragment flags. Acknowledgment is accumulate-only: a
//! fragment once acknowledged stays acknowledged, so duplicated or reordered
//! ACKs can never regress the count.

use std::time::Instant;

use crate::protocol::{FragmentAck, Packet};

/// Send state of a single outbound fragment.
#[derive(Debug)]
pub struct FragmentState {
    fragment_id: u16,
    packet: Packet,
    acknowledged: bool,
    last_sent: Option<Instant>,
    retransmit_count: u32,
    data_size: u32,
    total_transmitted: u64,
}

impl FragmentState {
    fn new(fragment_id: u16, packet: Packet) -> Self {
        let data_size = packet.len() as u32;
        Self {
            fragment_id,
            packet,
            acknowledged: false,
            last_sent: None,
            retransmit_count: 0,
            data_size,
            total_transmitted: 0,
        }
    }

    /// 1-based fragment number.
    #[must_use]
    pub fn fragment_id(&self) -> u16 {
        self.fragment_id
    }

    /// The retained outer packet.
    #[must_use]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// When this fragment was last handed to the sender, if ever resent.
    #[must_use]
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Times this fragment was individually resent.
    #[must_use]
    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    /// Size of the retained packet in bytes.
    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Bytes this fragment contributed via selective resends.
    #[must_use]
    pub fn total_transmitted(&self) -> u64 {
        self.total_transmitted
    }

    /// Book a selective resend of this fragment.
    pub fn record_resend(&mut self, now: Instant) {
        self.retransmit_count += 1;
        self.last_sent = Some(now);
        self.total_transmitted += u64::from(self.data_size);
    }
}

/// ACK state and byte accounting for one outbound fragmented message.
#[derive(Debug)]
pub struct FragmentTracker {
    message_id: u32,
    total_fragments: u16,
    acked_fragments: u16,
    last_ack: Option<Instant>,
    selective_retransmission_supported: bool,
    fragments: Vec<FragmentState>,
    total_original_size: u64,
    total_transmitted_size: u64,
    retransmission_count: u32,
}

impl FragmentTracker {
    /// Create a tracker with an empty fragment list and zeroed counters.
    pub fn new(message_id: u32, total_fragments: u16) -> Self {
        Self {
            message_id,
            total_fragments,
            acked_fragments: 0,
            last_ack: None,
            selective_retransmission_supported: false,
            fragments: Vec::with_capacity(usize::from(total_fragments)),
            total_original_size: 0,
            total_transmitted_size: 0,
            retransmission_count: 0,
        }
    }

    /// Append a fragment. Transport accounting of the initial send happens
    /// in the send path, not here; only the original size accumulates.
    pub fn add(&mut self, fragment_id: u16, packet: Packet) {
        self.total_original_size += packet.len() as u64;
        self.fragments.push(FragmentState::new(fragment_id, packet));
    }

    /// MID of the tracked message.
    #[must_use]
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    #[must_use]
    pub fn total_fragments(&self) -> u16 {
        self.total_fragments
    }

    /// Fragments acknowledged so far. Monotonically non-decreasing.
    #[must_use]
    pub fn acked_fragments(&self) -> u16 {
        self.acked_fragments
    }

    /// Whether the peer advertised SFR support when this message was sent.
    #[must_use]
    pub fn selective_supported(&self) -> bool {
        self.selective_retransmission_supported
    }

    pub fn set_selective_supported(&mut self, supported: bool) {
        self.selective_retransmission_supported = supported;
    }

    /// When the last ACK for this message arrived.
    #[must_use]
    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    /// Sum of the fragment packet sizes as generated.
    #[must_use]
    pub fn total_original_size(&self) -> u64 {
        self.total_original_size
    }

    /// Bytes handed to the sender for this message, including resends.
    #[must_use]
    pub fn total_transmitted_size(&self) -> u64 {
        self.total_transmitted_size
    }

    /// Selective resend rounds performed.
    #[must_use]
    pub fn retransmission_count(&self) -> u32 {
        self.retransmission_count
    }

    /// All fragments in wire order.
    #[must_use]
    pub fn fragments(&self) -> &[FragmentState] {
        &self.fragments
    }

    /// Unacknowledged fragments in numerical order.
    pub fn missing(&self) -> impl Iterator<Item = &FragmentState> {
        self.fragments.iter().filter(|f| !f.acknowledged)
    }

    /// Mutable access to the unacknowledged fragments, for resend booking.
    pub fn missing_mut(&mut self) -> impl Iterator<Item = &mut FragmentState> {
        self.fragments.iter_mut().filter(|f| !f.acknowledged)
    }

    /// All fragments acknowledged.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.acked_fragments == self.total_fragments
    }

    /// Fold a cumulative ACK bitmap into the per-fragment flags.
    ///
    /// Returns the number of *newly* acknowledged fragments. Bits for
    /// fragments this tracker does not hold are ignored; acknowledgment
    /// never regresses.
    pub fn mark_acked(&mut self, ack: &FragmentAck, now: Instant) -> u16 {
        let mut newly = 0;
        for fragment in &mut self.fragments {
            if !fragment.acknowledged && ack.is_acked(fragment.fragment_id) {
                fragment.acknowledged = true;
                newly += 1;
            }
        }
        self.acked_fragments += newly;
        self.last_ack = Some(now);
        if newly > 0 {
            log::debug!(
                "fragment ack update: {}/{} fragments acknowledged for message {}",
                self.acked_fragments,
                self.total_fragments,
                self.message_id
            );
        }
        newly
    }

    /// Accumulate bytes handed to the sender (initial send or full resend).
    pub fn record_transmitted(&mut self, bytes: u64) {
        self.total_transmitted_size += bytes;
    }

    /// Book one selective resend round.
    pub fn record_selective_round(&mut self) {
        self.retransmission_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn packet(len: usize) -> Packet {
        let addr: SocketAddr = "127.0.0.1:500".parse().unwrap();
        Packet::new(vec![0u8; len], addr, addr)
    }

    fn tracker_with(total: u16, sizes: &[usize]) -> FragmentTracker {
        let mut tracker = FragmentTracker::new(1, total);
        for (idx, len) in sizes.iter().enumerate() {
            tracker.add(idx as u16 + 1, packet(*len));
        }
        tracker
    }

    #[test]
    fn test_ack_accumulation_is_monotonic() {
        let mut tracker = tracker_with(3, &[100, 100, 100]);
        let now = Instant::now();

        // Cumulative bitmaps 0x0001, 0x0003, 0x0007 as they arrive in order.
        assert_eq!(
            tracker.mark_acked(&FragmentAck::from_received(1, 3, [1]), now),
            1
        );
        assert_eq!(
            tracker.mark_acked(&FragmentAck::from_received(1, 3, [1, 2]), now),
            1
        );
        assert_eq!(
            tracker.mark_acked(&FragmentAck::from_received(1, 3, [1, 2, 3]), now),
            1
        );
        assert_eq!(tracker.acked_fragments(), 3);
        assert!(tracker.complete());
    }

    #[test]
    fn test_duplicate_and_out_of_order_acks() {
        let mut tracker = tracker_with(3, &[100, 100, 100]);
        let now = Instant::now();

        // A later cumulative bitmap arriving first...
        assert_eq!(
            tracker.mark_acked(&FragmentAck::from_received(1, 3, [1, 2]), now),
            2
        );
        // ...followed by the older, smaller one: no regression, no double
        // counting.
        assert_eq!(
            tracker.mark_acked(&FragmentAck::from_received(1, 3, [1]), now),
            0
        );
        assert_eq!(tracker.acked_fragments(), 2);
        assert!(!tracker.complete());
    }

    #[test]
    fn test_missing_in_numerical_order() {
        let mut tracker = tracker_with(4, &[10, 20, 30, 40]);
        tracker.mark_acked(&FragmentAck::from_received(1, 4, [2, 4]), Instant::now());

        let missing: Vec<u16> = tracker.missing().map(FragmentState::fragment_id).collect();
        assert_eq!(missing, vec![1, 3]);
    }

    #[test]
    fn test_bits_for_unknown_fragments_ignored() {
        let mut tracker = tracker_with(2, &[10, 20]);
        // Bitmap claims fragment 5, which we never sent.
        let newly = tracker.mark_acked(&FragmentAck::from_received(1, 2, [1, 5]), Instant::now());
        assert_eq!(newly, 1);
        assert_eq!(tracker.acked_fragments(), 1);
    }

    #[test]
    fn test_byte_accounting() {
        let mut tracker = tracker_with(3, &[100, 200, 300]);
        assert_eq!(tracker.total_original_size(), 600);
        assert_eq!(tracker.total_transmitted_size(), 0);

        // Initial send accounted by the send path.
        tracker.record_transmitted(600);

        // Selective resend of fragment 1.
        let now = Instant::now();
        for fragment in tracker.missing_mut().filter(|f| f.fragment_id() == 1) {
            fragment.record_resend(now);
        }
        tracker.record_transmitted(100);
        tracker.record_selective_round();

        assert_eq!(tracker.total_transmitted_size(), 700);
        assert_eq!(tracker.retransmission_count(), 1);
        assert_eq!(tracker.fragments()[0].retransmit_count(), 1);
        assert_eq!(tracker.fragments()[0].total_transmitted(), 100);
    }
}
