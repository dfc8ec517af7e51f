//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::packet::State;
use crate::session::{PollState, SessionKey};
use crate::sla::LatencyReport;

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a SessionKey),
    SessionDelete(&'a SessionKey),
    SessionClientReg(&'a SessionKey, &'a str),
    SessionClientUnreg(&'a SessionKey, &'a str),
    FsmTransition(&'a SessionKey, State, State),
    DetectionTimeExpiry(&'a SessionKey),
    EchoDetectionTimeExpiry(&'a SessionKey),
    PollSequenceStart(&'a SessionKey),
    PollStateChange(&'a SessionKey, PollState, PollState),
    SlaReport(&'a SessionKey, &'a LatencyReport),
    PacketDiscard(&'a SessionKey, &'a str),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(sess_key) | Debug::SessionDelete(sess_key) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::SessionClientReg(sess_key, client)
            | Debug::SessionClientUnreg(sess_key, client) => {
                debug_span!("session", key = ?sess_key, %client).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(sess_key, old_state, new_state) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!(?old_state, ?new_state, "{}", self);
                });
            }
            Debug::DetectionTimeExpiry(sess_key)
            | Debug::EchoDetectionTimeExpiry(sess_key)
            | Debug::PollSequenceStart(sess_key) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::PollStateChange(sess_key, old, new) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!(?old, ?new, "{}", self);
                });
            }
            Debug::SlaReport(sess_key, report) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!(
                        latency_ms = report.latency_ms,
                        jitter_ms = ?report.jitter_ms,
                        "{}", self
                    );
                });
            }
            Debug::PacketDiscard(sess_key, reason) => {
                debug_span!("session", key = ?sess_key).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::SessionClientReg(..) => {
                write!(f, "client registered peer")
            }
            Debug::SessionClientUnreg(..) => {
                write!(f, "client unregistered peer")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
            Debug::EchoDetectionTimeExpiry(..) => {
                write!(f, "echo detection timer expired")
            }
            Debug::PollSequenceStart(..) => {
                write!(f, "poll sequence started")
            }
            Debug::PollStateChange(..) => {
                write!(f, "poll sequence state change")
            }
            Debug::SlaReport(..) => {
                write!(f, "SLA report")
            }
            Debug::PacketDiscard(..) => {
                write!(f, "packet discarded")
            }
        }
    }
}
