// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IKEv2 protocol surface: exchange types, notify types, payload model and
//! the internal wire form.
//!
//! The full IKEv2 payload codec lives in the SA container; this module only
//! defines what the exchange manager needs to classify and route messages,
//! plus a compact encoding so fragmentation and reassembly round-trip
//! without the real codec.
//!
//! ## Submodules
//!
//! | Module | Role |
//! |--------|------|
//! | [`message`] | Logical message / packet model + TLV encoding |
//! | [`frag`] | MTU-driven splitting into fragment-carrier packets |
//! | [`ack`] | FRAGMENT_ACK notification record codec |

pub mod ack;
pub mod frag;
pub mod message;

pub use ack::FragmentAck;
pub use frag::Fragmenter;
pub use message::{Message, Notify, Packet, Payload};

/// IKEv2 exchange types (RFC 7296 Sec.3.1, RFC 9242 for IKE_INTERMEDIATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// Initial exchange, unprotected.
    IkeSaInit = 34,
    /// Authentication exchange.
    IkeAuth = 35,
    /// CHILD_SA creation / rekeying, IKE_SA rekeying.
    CreateChildSa = 36,
    /// Notifications, deletions, DPD, MOBIKE, the ACK channel.
    Informational = 37,
    /// Intermediate key exchange rounds between INIT and AUTH.
    IkeIntermediate = 43,
}

impl ExchangeType {
    /// Decode from the wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            34 => Some(Self::IkeSaInit),
            35 => Some(Self::IkeAuth),
            36 => Some(Self::CreateChildSa),
            37 => Some(Self::Informational),
            43 => Some(Self::IkeIntermediate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IkeSaInit => "IKE_SA_INIT",
            Self::IkeAuth => "IKE_AUTH",
            Self::CreateChildSa => "CREATE_CHILD_SA",
            Self::Informational => "INFORMATIONAL",
            Self::IkeIntermediate => "IKE_INTERMEDIATE",
        };
        f.write_str(name)
    }
}

/// Protocol identifiers used in notify and delete payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// No protocol (status notifies).
    None = 0,
    /// The IKE_SA itself.
    Ike = 1,
    /// Authentication Header CHILD_SA.
    Ah = 2,
    /// Encapsulating Security Payload CHILD_SA.
    Esp = 3,
}

impl ProtocolId {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Ike),
            2 => Some(Self::Ah),
            3 => Some(Self::Esp),
            _ => None,
        }
    }
}

/// Notify message types the exchange manager classifies on.
///
/// Wire numbers follow the IANA IKEv2 registry; the two selective
/// retransmission notifies live in the private-use range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    // Error types
    UnsupportedCriticalPayload = 1,
    InvalidSyntax = 7,
    NoProposalChosen = 14,
    AuthenticationFailed = 24,

    // Status types
    NatDetectionSourceIp = 16388,
    NatDetectionDestinationIp = 16389,
    RekeySa = 16393,
    MobikeSupported = 16396,
    AdditionalIp4Address = 16397,
    AdditionalIp6Address = 16398,
    NoAdditionalAddresses = 16399,
    UpdateSaAddresses = 16400,
    Cookie2 = 16401,
    NoNatsAllowed = 16402,
    AuthLifetime = 16403,
    Redirect = 16407,
    MessageIdSync = 16422,
    ReplayCounterSync = 16423,

    // Private use (40960+)
    UnexpectedNatDetected = 40961,
    UnacceptableAddresses = 40962,
    /// Bitmap acknowledgment of received fragments (see [`ack`]).
    FragmentAck = 40969,
    /// Empty-bodied capability advertisement in IKE_SA_INIT.
    SelectiveRetransmissionSupported = 40970,
}

impl NotifyType {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::UnsupportedCriticalPayload),
            7 => Some(Self::InvalidSyntax),
            14 => Some(Self::NoProposalChosen),
            24 => Some(Self::AuthenticationFailed),
            16388 => Some(Self::NatDetectionSourceIp),
            16389 => Some(Self::NatDetectionDestinationIp),
            16393 => Some(Self::RekeySa),
            16396 => Some(Self::MobikeSupported),
            16397 => Some(Self::AdditionalIp4Address),
            16398 => Some(Self::AdditionalIp6Address),
            16399 => Some(Self::NoAdditionalAddresses),
            16400 => Some(Self::UpdateSaAddresses),
            16401 => Some(Self::Cookie2),
            16402 => Some(Self::NoNatsAllowed),
            16403 => Some(Self::AuthLifetime),
            16407 => Some(Self::Redirect),
            16422 => Some(Self::MessageIdSync),
            16423 => Some(Self::ReplayCounterSync),
            40961 => Some(Self::UnexpectedNatDetected),
            40962 => Some(Self::UnacceptableAddresses),
            40969 => Some(Self::FragmentAck),
            40970 => Some(Self::SelectiveRetransmissionSupported),
            _ => None,
        }
    }

    /// Whether this notify belongs to the MOBIKE family and spawns a MOBIKE
    /// task when seen in an INFORMATIONAL request.
    pub fn is_mobike_family(self) -> bool {
        matches!(
            self,
            Self::AdditionalIp4Address
                | Self::AdditionalIp6Address
                | Self::NoAdditionalAddresses
                | Self::UpdateSaAddresses
                | Self::NoNatsAllowed
                | Self::UnacceptableAddresses
                | Self::UnexpectedNatDetected
                | Self::Cookie2
                | Self::NatDetectionSourceIp
                | Self::NatDetectionDestinationIp
        )
    }

    /// Whether this notify is part of a message-ID synchronization exchange.
    pub fn is_sync(self) -> bool {
        matches!(self, Self::MessageIdSync | Self::ReplayCounterSync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_wire_roundtrip() {
        for ex in [
            ExchangeType::IkeSaInit,
            ExchangeType::IkeAuth,
            ExchangeType::CreateChildSa,
            ExchangeType::Informational,
            ExchangeType::IkeIntermediate,
        ] {
            assert_eq!(ExchangeType::from_wire(ex as u8), Some(ex));
        }
        assert_eq!(ExchangeType::from_wire(0), None);
    }

    #[test]
    fn test_notify_type_private_range() {
        assert!(NotifyType::FragmentAck as u16 >= 40960);
        assert!(NotifyType::SelectiveRetransmissionSupported as u16 >= 40960);
    }

    #[test]
    fn test_mobike_family_classification() {
        assert!(NotifyType::UpdateSaAddresses.is_mobike_family());
        assert!(NotifyType::Cookie2.is_mobike_family());
        assert!(!NotifyType::AuthLifetime.is_mobike_family());
        assert!(!NotifyType::FragmentAck.is_mobike_family());
    }
}
