// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SA container seam.
//!
//! The security association owns key material, configuration, the real
//! IKEv2 codec and its own state; the exchange manager only consumes the
//! narrow contract below. The SA owns the manager and hands itself in on
//! every entry point, so no back-references exist in either direction.

use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::{Message, Packet};
use crate::Result;

/// Identifier of a security association, unique per daemon.
pub type SaId = u64;

/// SA establishment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SaState {
    /// Freshly created, nothing sent.
    Created,
    /// IKE_SA_INIT / IKE_AUTH in progress.
    Connecting,
    /// Authenticated and usable.
    Established,
    /// A rekey exchange is in progress.
    Rekeying,
    /// Replaced by a rekeyed SA, awaiting deletion.
    Rekeyed,
    /// Being torn down.
    Deleting,
}

/// Peer-negotiated protocol extensions the manager cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// MOBIKE (RFC 4555): explicit address updates, no implicit ones.
    Mobike,
    /// Message-ID synchronization (RFC 6311).
    MessageIdSync,
}

/// SA condition flags the manager toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// No route to the peer; exchanges are deferred.
    Stale,
    /// This end originally initiated the SA.
    OriginalInitiator,
}

/// How to apply endpoint updates learned from an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateHosts {
    /// Update only unset endpoints.
    Default,
    /// Force both endpoints (NAT-T port changes during IKE_AUTH).
    ForceAddrs,
    /// Force the local endpoint only (first response reveals it).
    ForceLocal,
}

/// Outcome of parsing and verifying a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Body parsed and verified.
    Ok,
    /// Malformed payloads.
    ParseError,
    /// Semantically invalid (bad lengths, wrong payload order).
    VerifyError,
    /// Integrity check failed; the message is silently dropped.
    IntegrityFailed,
    /// Encrypted message but no key material yet.
    NoKeys,
}

/// The services the exchange manager consumes from its SA.
pub trait IkeSa {
    /// Unique SA identifier.
    fn id(&self) -> SaId;

    /// Current establishment state.
    fn state(&self) -> SaState;

    /// Whether this end initiated the SA.
    fn is_initiator(&self) -> bool;

    /// Local endpoint.
    fn my_host(&self) -> SocketAddr;

    /// Remote endpoint.
    fn other_host(&self) -> SocketAddr;

    /// Pin the local endpoint (learned from an inbound request).
    fn set_my_host(&mut self, addr: SocketAddr);

    /// Pin the remote endpoint.
    fn set_other_host(&mut self, addr: SocketAddr);

    /// Whether the peer negotiated the given extension.
    fn supports_extension(&self, ext: Extension) -> bool;

    /// Toggle a condition flag.
    fn set_condition(&mut self, cond: Condition, enabled: bool);

    /// Apply endpoint updates from an inbound message.
    fn update_hosts(&mut self, me: SocketAddr, other: SocketAddr, mode: UpdateHosts);

    /// Encrypt, encode and fragment an outgoing message into outer packets.
    fn generate_message_fragmented(&mut self, msg: &Message) -> Result<Vec<Packet>>;

    /// Encrypt and encode an outgoing message into a single packet.
    fn generate_message(&mut self, msg: &Message) -> Result<Packet>;

    /// Decrypt, parse and verify an inbound message body.
    fn parse_body(&mut self, msg: &mut Message) -> ParseStatus;

    /// Whether a connection configuration is attached yet.
    fn has_config(&self) -> bool;

    /// Look up and attach a configuration for the given endpoints. Returns
    /// false when none matches.
    fn lookup_config(&mut self, me: SocketAddr, other: SocketAddr) -> bool;

    /// Record inbound activity for keepalive statistics.
    fn mark_inbound(&mut self, now: Instant);
}
