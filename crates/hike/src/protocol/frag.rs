// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MTU-driven splitting of encoded messages into fragment-carrier packets.
//!
//! A message whose wire form exceeds the MTU is chopped into slices, each
//! wrapped in its own carrier message holding a single `Fragment` payload
//! with 1-based numbering. Carriers share the MID, exchange type and
//! direction of the original so receivers can route them before reassembly.

use super::message::{Message, Packet, Payload};

/// Per-carrier overhead of the internal wire form: message header plus the
/// fragment payload header.
const CARRIER_OVERHEAD: usize = 17;

/// Splits encoded messages into MTU-sized fragment carriers.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    mtu: usize,
}

impl Fragmenter {
    /// Create a fragmenter for the given MTU.
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// Encode `msg` and split it into one or more addressed packets.
    ///
    /// Messages that fit the MTU yield a single packet holding the message
    /// itself; larger ones yield fragment carriers in wire order.
    pub fn fragment(&self, msg: &Message) -> Vec<Packet> {
        let encoded = msg.encode();
        if encoded.len() <= self.mtu {
            return vec![Packet::new(encoded, msg.source(), msg.destination())];
        }

        let chunk_size = self.mtu.saturating_sub(CARRIER_OVERHEAD).max(1);
        let chunks: Vec<&[u8]> = encoded.chunks(chunk_size).collect();
        let total = chunks.len() as u16;

        chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let mut carrier = Message::new(
                    msg.mid(),
                    msg.exchange(),
                    msg.is_request(),
                    msg.source(),
                    msg.destination(),
                );
                carrier.add_payload(Payload::Fragment {
                    number: idx as u16 + 1,
                    total,
                    data: chunk.to_vec(),
                });
                carrier.to_packet()
            })
            .collect()
    }
}
