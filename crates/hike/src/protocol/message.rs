// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logical message and packet model with a compact wire form.
//!
//! A [`Message`] is what the exchange manager routes: message ID, exchange
//! type, direction flag and a payload list. A [`Packet`] is an addressed
//! byte buffer handed to the sender. The SA container owns the real IKEv2
//! codec (encryption, integrity, payload parsing); the TLV encoding here
//! exists so that generation, fragmentation and reassembly round-trip
//! in-process and under test.
//!
//! # Wire Form
//!
//! ```text
//! +----------+------+----------+-------+---------------+-----------+
//! | magic    | mid  | exchange | flags | payload_count | payloads  |
//! | 2 bytes  | u32  | u8       | u8    | u16           | ...       |
//! +----------+------+----------+-------+---------------+-----------+
//! ```
//!
//! All multi-byte fields big-endian. Flag bit 0 marks a request.

use std::net::SocketAddr;

use super::{ExchangeType, NotifyType, ProtocolId};
use crate::{Error, Result};

/// Magic prefix of the internal wire form.
const MAGIC: [u8; 2] = *b"hk";

/// Request flag bit.
const FLAG_REQUEST: u8 = 0x01;

// Payload tags of the wire form.
const TAG_NOTIFY: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_TS_INITIATOR: u8 = 3;
const TAG_TS_RESPONDER: u8 = 4;
const TAG_FRAGMENT: u8 = 5;
const TAG_UNKNOWN: u8 = 6;

/// A notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// Protocol the notification applies to.
    pub protocol: ProtocolId,
    /// Notification type.
    pub kind: NotifyType,
    /// Notification data, empty for capability notifies.
    pub data: Vec<u8>,
}

/// Payloads the exchange manager classifies on.
///
/// Cryptographic payloads (KE, AUTH, SA proposals, ...) are opaque to the
/// manager and never reach this level; tasks consume them inside the SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Notification payload.
    Notify(Notify),
    /// Delete payload carrying SPIs of the SAs to remove.
    Delete { protocol: ProtocolId, spis: Vec<u32> },
    /// Initiator traffic selector (marker; selectors are task-internal).
    TsInitiator,
    /// Responder traffic selector (marker).
    TsResponder,
    /// Encrypted-fragment carrier: one slice of a fragmented message.
    Fragment { number: u16, total: u16, data: Vec<u8> },
    /// Payload the parser did not recognize.
    Unknown { kind: u8, critical: bool, data: Vec<u8> },
}

/// An addressed outer packet, ready for the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Wire bytes.
    pub data: Vec<u8>,
    /// Local endpoint the packet leaves from.
    pub source: SocketAddr,
    /// Remote endpoint.
    pub destination: SocketAddr,
}

impl Packet {
    pub fn new(data: Vec<u8>, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            data,
            source,
            destination,
        }
    }

    /// Packet length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A logical IKEv2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    mid: u32,
    exchange: ExchangeType,
    request: bool,
    source: SocketAddr,
    destination: SocketAddr,
    payloads: Vec<Payload>,
    /// Outer bytes this message arrived in, if it came off the wire.
    /// Reassembled messages have none (their fragments were hashed instead).
    packet_data: Option<Vec<u8>>,
}

impl Message {
    /// Create an outbound message.
    pub fn new(
        mid: u32,
        exchange: ExchangeType,
        request: bool,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Self {
            mid,
            exchange,
            request,
            source,
            destination,
            payloads: Vec::new(),
            packet_data: None,
        }
    }

    /// Message ID.
    #[must_use]
    pub fn mid(&self) -> u32 {
        self.mid
    }

    /// Exchange type.
    #[must_use]
    pub fn exchange(&self) -> ExchangeType {
        self.exchange
    }

    /// Rewrite the exchange type (tasks may do this during build).
    pub fn set_exchange(&mut self, exchange: ExchangeType) {
        self.exchange = exchange;
    }

    /// True for requests, false for responses.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.request
    }

    #[must_use]
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    #[must_use]
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Outer packet bytes as received, if any.
    #[must_use]
    pub fn packet_data(&self) -> Option<&[u8]> {
        self.packet_data.as_deref()
    }

    /// Payload list in wire order.
    #[must_use]
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Append an arbitrary payload.
    pub fn add_payload(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Append a notification payload.
    pub fn add_notify(&mut self, protocol: ProtocolId, kind: NotifyType, data: Vec<u8>) {
        self.payloads.push(Payload::Notify(Notify {
            protocol,
            kind,
            data,
        }));
    }

    /// First notification of the given type, if present.
    #[must_use]
    pub fn get_notify(&self, kind: NotifyType) -> Option<&Notify> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Notify(n) if n.kind == kind => Some(n),
            _ => None,
        })
    }

    /// The fragment carrier of this message, if it is one.
    #[must_use]
    pub fn fragment(&self) -> Option<(u16, u16, &[u8])> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Fragment {
                number,
                total,
                data,
            } => Some((*number, *total, data.as_slice())),
            _ => None,
        })
    }

    /// Type byte of the first unknown payload flagged critical, if any.
    #[must_use]
    pub fn unsupported_critical_payload(&self) -> Option<u8> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Unknown { kind, critical, .. } if *critical => Some(*kind),
            _ => None,
        })
    }

    /// Encode to the internal wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.mid.to_be_bytes());
        buf.push(self.exchange as u8);
        buf.push(if self.request { FLAG_REQUEST } else { 0 });
        buf.extend_from_slice(&(self.payloads.len() as u16).to_be_bytes());
        for payload in &self.payloads {
            encode_payload(&mut buf, payload);
        }
        buf
    }

    /// Decode a message from wire bytes, retaining them for hashing.
    pub fn decode(data: &[u8], source: SocketAddr, destination: SocketAddr) -> Result<Self> {
        let mut msg = Self::decode_body(data, source, destination)?;
        msg.packet_data = Some(data.to_vec());
        Ok(msg)
    }

    /// Decode without retaining outer bytes (reassembled messages).
    pub fn decode_reassembled(
        data: &[u8],
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Self> {
        Self::decode_body(data, source, destination)
    }

    fn decode_body(data: &[u8], source: SocketAddr, destination: SocketAddr) -> Result<Self> {
        let mut r = Reader::new(data);
        if r.take(2)? != MAGIC {
            return Err(Error::Malformed("bad magic"));
        }
        let mid = u32::from_be_bytes(r.take(4)?.try_into().unwrap());
        let exchange = ExchangeType::from_wire(r.u8()?).ok_or(Error::Malformed("exchange type"))?;
        let request = r.u8()? & FLAG_REQUEST != 0;
        let count = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
        let mut payloads = Vec::with_capacity(count as usize);
        for _ in 0..count {
            payloads.push(decode_payload(&mut r)?);
        }
        Ok(Self {
            mid,
            exchange,
            request,
            source,
            destination,
            payloads,
            packet_data: None,
        })
    }

    /// Wrap this message into a single addressed packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(self.encode(), self.source, self.destination)
    }
}

fn encode_payload(buf: &mut Vec<u8>, payload: &Payload) {
    match payload {
        Payload::Notify(n) => {
            buf.push(TAG_NOTIFY);
            buf.push(n.protocol as u8);
            buf.extend_from_slice(&(n.kind as u16).to_be_bytes());
            buf.extend_from_slice(&(n.data.len() as u16).to_be_bytes());
            buf.extend_from_slice(&n.data);
        }
        Payload::Delete { protocol, spis } => {
            buf.push(TAG_DELETE);
            buf.push(*protocol as u8);
            buf.extend_from_slice(&(spis.len() as u16).to_be_bytes());
            for spi in spis {
                buf.extend_from_slice(&spi.to_be_bytes());
            }
        }
        Payload::TsInitiator => buf.push(TAG_TS_INITIATOR),
        Payload::TsResponder => buf.push(TAG_TS_RESPONDER),
        Payload::Fragment {
            number,
            total,
            data,
        } => {
            buf.push(TAG_FRAGMENT);
            buf.extend_from_slice(&number.to_be_bytes());
            buf.extend_from_slice(&total.to_be_bytes());
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
        Payload::Unknown {
            kind,
            critical,
            data,
        } => {
            buf.push(TAG_UNKNOWN);
            buf.push(*kind);
            buf.push(u8::from(*critical));
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
    }
}

fn decode_payload(r: &mut Reader<'_>) -> Result<Payload> {
    match r.u8()? {
        TAG_NOTIFY => {
            let protocol = ProtocolId::from_wire(r.u8()?).ok_or(Error::Malformed("protocol id"))?;
            let kind = NotifyType::from_wire(u16::from_be_bytes(r.take(2)?.try_into().unwrap()))
                .ok_or(Error::Malformed("notify type"))?;
            let len = u16::from_be_bytes(r.take(2)?.try_into().unwrap()) as usize;
            Ok(Payload::Notify(Notify {
                protocol,
                kind,
                data: r.take(len)?.to_vec(),
            }))
        }
        TAG_DELETE => {
            let protocol = ProtocolId::from_wire(r.u8()?).ok_or(Error::Malformed("protocol id"))?;
            let count = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
            let mut spis = Vec::with_capacity(count as usize);
            for _ in 0..count {
                spis.push(u32::from_be_bytes(r.take(4)?.try_into().unwrap()));
            }
            Ok(Payload::Delete { protocol, spis })
        }
        TAG_TS_INITIATOR => Ok(Payload::TsInitiator),
        TAG_TS_RESPONDER => Ok(Payload::TsResponder),
        TAG_FRAGMENT => {
            let number = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
            let total = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
            let len = u16::from_be_bytes(r.take(2)?.try_into().unwrap()) as usize;
            Ok(Payload::Fragment {
                number,
                total,
                data: r.take(len)?.to_vec(),
            })
        }
        TAG_UNKNOWN => {
            let kind = r.u8()?;
            let critical = r.u8()? != 0;
            let len = u16::from_be_bytes(r.take(2)?.try_into().unwrap()) as usize;
            Ok(Payload::Unknown {
                kind,
                critical,
                data: r.take(len)?.to_vec(),
            })
        }
        _ => Err(Error::Malformed("payload tag")),
    }
}

/// Bounds-checked byte cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn sample_message() -> Message {
        let mut msg = Message::new(3, ExchangeType::Informational, true, addr(500), addr(4500));
        msg.add_notify(ProtocolId::None, NotifyType::AuthLifetime, vec![1, 2, 3]);
        msg.add_payload(Payload::Delete {
            protocol: ProtocolId::Esp,
            spis: vec![0xdead_beef, 0x1234_5678],
        });
        msg.add_payload(Payload::TsInitiator);
        msg
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample_message();
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes, addr(500), addr(4500)).unwrap();

        assert_eq!(decoded.mid(), 3);
        assert_eq!(decoded.exchange(), ExchangeType::Informational);
        assert!(decoded.is_request());
        assert_eq!(decoded.payloads(), msg.payloads());
        assert_eq!(decoded.packet_data(), Some(bytes.as_slice()));
    }

    #[test]
    fn test_get_notify() {
        let msg = sample_message();
        assert!(msg.get_notify(NotifyType::AuthLifetime).is_some());
        assert!(msg.get_notify(NotifyType::FragmentAck).is_none());
    }

    #[test]
    fn test_unsupported_critical_payload() {
        let mut msg = sample_message();
        assert_eq!(msg.unsupported_critical_payload(), None);

        msg.add_payload(Payload::Unknown {
            kind: 201,
            critical: false,
            data: vec![],
        });
        assert_eq!(msg.unsupported_critical_payload(), None);

        msg.add_payload(Payload::Unknown {
            kind: 202,
            critical: true,
            data: vec![9],
        });
        assert_eq!(msg.unsupported_critical_payload(), Some(202));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(b"xx", addr(1), addr(2)).is_err());
        assert!(Message::decode(&[], addr(1), addr(2)).is_err());

        // Valid magic, truncated header.
        assert!(Message::decode(b"hk\x00\x00", addr(1), addr(2)).is_err());
    }

    #[test]
    fn test_fragment_accessor() {
        let mut msg = Message::new(1, ExchangeType::IkeAuth, true, addr(1), addr(2));
        assert!(msg.fragment().is_none());
        msg.add_payload(Payload::Fragment {
            number: 2,
            total: 5,
            data: vec![0xaa; 16],
        });
        let (number, total, data) = msg.fragment().unwrap();
        assert_eq!((number, total, data.len()), (2, 5, 16));
    }
}
