// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound defragmentation.
//!
//! One [`Defrag`] exists per in-progress inbound message (request or
//! response half). Fragments arrive in any order; duplicates are absorbed
//! without double counting; a conflicting total or an out-of-range fragment
//! number fails the reassembly. On completion the concatenated slices are
//! decoded back into the logical message.
//!
//! The defragmenter also exports the set of fragment numbers held so far,
//! which is exactly what a cumulative FRAGMENT_ACK needs.

use crate::protocol::{ExchangeType, Message};
use crate::{Error, Result};
use std::net::SocketAddr;

/// Outcome of feeding one fragment to the defragmenter.
#[derive(Debug)]
pub enum DefragStatus {
    /// Fragment absorbed, more are needed.
    NeedMore,
    /// All fragments present; the reassembled message.
    Complete(Message),
}

/// Reassembly state for one fragmented inbound message.
#[derive(Debug)]
pub struct Defrag {
    mid: u32,
    exchange: ExchangeType,
    request: bool,
    source: SocketAddr,
    destination: SocketAddr,
    total: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: u16,
}

impl Defrag {
    /// Start reassembly from the first fragment seen (any number).
    pub fn new(msg: &Message) -> Result<Self> {
        let (_, total, _) = msg.fragment().ok_or(Error::Malformed("not a fragment"))?;
        if total == 0 {
            return Err(Error::FragmentNumberInvalid { number: 0, total });
        }
        Ok(Self {
            mid: msg.mid(),
            exchange: msg.exchange(),
            request: msg.is_request(),
            source: msg.source(),
            destination: msg.destination(),
            total,
            chunks: vec![None; usize::from(total)],
            received: 0,
        })
    }

    /// Total fragment count announced by the sender.
    #[must_use]
    pub fn total(&self) -> u16 {
        self.total
    }

    /// Number of distinct fragments held.
    #[must_use]
    pub fn received_count(&self) -> u16 {
        self.received
    }

    /// Fragment numbers held so far, ascending.
    pub fn received(&self) -> impl Iterator<Item = u16> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(idx, _)| idx as u16 + 1)
    }

    /// Feed one fragment carrier.
    ///
    /// Duplicates are ignored. A carrier disagreeing on MID, exchange type
    /// or total count fails the reassembly.
    pub fn add(&mut self, msg: &Message) -> Result<DefragStatus> {
        let (number, total, data) = msg.fragment().ok_or(Error::Malformed("not a fragment"))?;

        if msg.mid() != self.mid || msg.exchange() != self.exchange {
            return Err(Error::Malformed("fragment belongs to another message"));
        }
        if total != self.total {
            return Err(Error::FragmentTotalMismatch {
                expected: self.total,
                got: total,
            });
        }
        if number == 0 || number > self.total {
            return Err(Error::FragmentNumberInvalid {
                number,
                total: self.total,
            });
        }

        let slot = &mut self.chunks[usize::from(number - 1)];
        if slot.is_none() {
            *slot = Some(data.to_vec());
            self.received += 1;
        }

        if self.received < self.total {
            return Ok(DefragStatus::NeedMore);
        }

        let mut combined = Vec::new();
        for chunk in &self.chunks {
            combined.extend_from_slice(chunk.as_deref().unwrap_or_default());
        }
        let reassembled = Message::decode_reassembled(&combined, self.source, self.destination)?;
        if reassembled.mid() != self.mid || reassembled.is_request() != self.request {
            return Err(Error::Malformed("reassembled message disagrees with carriers"));
        }
        Ok(DefragStatus::Complete(reassembled))
    }
}
