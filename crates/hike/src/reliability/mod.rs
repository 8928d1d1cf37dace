// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Selective fragment retransmission
//!
//! Reliability machinery for outbound fragmented messages. The exchange has
//! exactly one outstanding request per direction, so reliability here is
//! per-message, not per-stream: the question is never *which messages* are
//! missing but *which fragments of the one in-flight message*.
//!
//! ## Protocol Flow
//!
//! ```text
//! Initiator                                 Responder
//!   |                                          |
//!   |--- fragment 1/3 -----------X (lost)      |
//!   |--- fragment 2/3 ------------------------>|
//!   |                                          |<- holds {2}
//!   |<-- FRAGMENT_ACK bitmap 0x0002 -----------|
//!   |--- fragment 3/3 ------------------------>|
//!   |<-- FRAGMENT_ACK bitmap 0x0006 -----------|
//!   |                                          |
//!   |   (selective retry, 1.8 s)               |
//!   |--- fragment 1/3 [resend] --------------->|
//!   |                                          | (reassembles, processes)
//!   |<-- FRAGMENT_ACK bitmap 0x0007 -----------|
//!   |<-- response ----------------------------->
//! ```
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`FragmentTracker`] | Per-message fragment ACK state and byte accounting |
//! | [`retransmission_timeout`] | Whole-message exponential backoff with jitter |
//! | [`ExchangeMetrics`] | Observability counters for transmission efficiency |
//!
//! Without peer support (no capability notify seen), the tracker still
//! records accounting but retransmission stays on the whole-message path.

mod backoff;
mod metrics;
mod tracker;

pub use backoff::retransmission_timeout;
pub use metrics::{ExchangeMetrics, MetricsSnapshot};
pub use tracker::{FragmentState, FragmentTracker};
