//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_new::new;
use generational_arena::{Arena, Index};

use crate::error::Error;
use crate::packet::{DiagnosticCode, State};
use crate::sla::Sla;
use crate::timer::{IntervalTask, TimeoutTask};

// The slow Tx interval is used to conserve bandwidth for sessions that
// haven't reached the Up state yet (RFC 5880 §6.8.3).
pub const SLOW_TX_INTERVAL: u32 = 1_000_000;

pub type SessionId = usize;
pub type SessionIndex = Index;

// ===== session key =====

// A BFD session is keyed either by the RFC 5881 single-hop tuple {peer
// address, local interface} or by the RFC 5883 multihop tuple {peer address,
// local address, VRF}. Exactly one applies per session.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SessionKey {
    SingleHop {
        ifname: Option<String>,
        peer: IpAddr,
    },
    MultiHop {
        local: IpAddr,
        peer: IpAddr,
        vrf: Option<String>,
    },
}

impl SessionKey {
    pub fn new_single_hop(ifname: Option<String>, peer: IpAddr) -> SessionKey {
        SessionKey::SingleHop { ifname, peer }
    }

    pub fn new_multihop(
        local: IpAddr,
        peer: IpAddr,
        vrf: Option<String>,
    ) -> SessionKey {
        SessionKey::MultiHop { local, peer, vrf }
    }

    pub fn peer(&self) -> IpAddr {
        match self {
            SessionKey::SingleHop { peer, .. } => *peer,
            SessionKey::MultiHop { peer, .. } => *peer,
        }
    }

    pub fn is_single_hop(&self) -> bool {
        matches!(self, SessionKey::SingleHop { .. })
    }

    pub fn is_multihop(&self) -> bool {
        matches!(self, SessionKey::MultiHop { .. })
    }
}

// ===== polling sub-state =====

// Explicit Poll Sequence sub-state (Design Notes §9), promoted from the two
// shadow fields the reference implementation uses so that tests can observe
// it directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollState {
    Idle,
    PollingSent,
    FinalReceived,
}

impl Default for PollState {
    fn default() -> PollState {
        PollState::Idle
    }
}

// ===== session flags =====

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SessionFlags: u16 {
        const ADMIN_SHUTDOWN = 1 << 0;
        const ECHO_REQUESTED = 1 << 1;
        const ECHO_ACTIVE    = 1 << 2;
        const IPV6           = 1 << 3;
        const MULTIHOP       = 1 << 4;
        const TRACK_SLA      = 1 << 5;
        // Reserved: VXLAN encapsulation is a future extension (§9), never
        // set or interpreted by this core.
        const VXLAN          = 1 << 6;
    }
}

// ===== configuration =====

// Configuration submitted by the external config collaborator (§6). One
// `SessionConfig` applies per session; there is no per-client negotiation.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub local_multiplier: u8,
    // Advertised once the session is Up (`up_min_tx`); slow-start always
    // uses SLOW_TX_INTERVAL regardless of this value.
    pub desired_min_tx: u32,
    pub required_min_rx: u32,
    // 0 disables the echo function locally even if `echo_mode` is set.
    pub required_min_echo: u32,
    pub echo_mode: bool,
    pub admin_down: bool,
    pub track_sla: bool,
    pub label: Option<String>,
    // Single-hop only.
    pub src: Option<IpAddr>,
    // Multihop only.
    pub tx_ttl: Option<u8>,
    pub rx_ttl: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            local_multiplier: 3,
            desired_min_tx: SLOW_TX_INTERVAL,
            required_min_rx: SLOW_TX_INTERVAL,
            required_min_echo: 0,
            echo_mode: false,
            admin_down: false,
            track_sla: false,
            label: None,
            src: None,
            tx_ttl: None,
            rx_ttl: None,
        }
    }
}

// ===== remote info =====

// Parameters learned from the last valid packet received from the peer.
#[derive(Clone, Copy, Debug, new)]
pub struct RemoteInfo {
    pub state: State,
    pub discr: u32,
    pub diag: u8,
    pub multiplier: u8,
    pub min_tx: u32,
    pub min_rx: u32,
    pub min_echo_rx: u32,
}

// ===== session =====

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub config: SessionConfig,
    pub config_enabled: bool,
    pub state: SessionState,
    pub statistics: SessionStatistics,
    pub sla: Sla,
    // External collaborators (e.g. routing protocol instances) currently
    // holding a reference to this session. Delete is refused while
    // non-empty (§4.E).
    pub refs: HashSet<String>,
    pub echo_seq: u32,
}

#[derive(Debug)]
pub struct SessionState {
    pub local_state: State,
    pub local_discr: u32,
    pub local_diag: DiagnosticCode,
    pub remote_discr: u32,
    pub remote: Option<RemoteInfo>,
    // Desired Min Tx/Required Min Rx actually in effect right now (slow
    // start until Up, operational value afterwards).
    pub curr_min_tx: u32,
    pub curr_min_rx: u32,
    pub poll: PollState,
    // Staged {desired_min_tx, required_min_rx}, committed on Final receipt.
    pub new_timers: Option<(u32, u32)>,
    pub echo_active: bool,
    pub last_xmit_ts: Option<DateTime<Utc>>,
    pub last_echo_xmit_ts: Option<DateTime<Utc>>,
    pub tx_interval: Option<IntervalTask>,
    pub detection_timer: Option<TimeoutTask>,
    pub echo_tx_interval: Option<IntervalTask>,
    pub echo_detection_timer: Option<TimeoutTask>,
    // Transmit socket and destination address. Rx is handled by the
    // per-path-type shared sockets owned by the daemon context.
    pub socket_tx: Option<std::sync::Arc<crate::socket::UdpSocket>>,
    pub sockaddr: Option<std::net::SocketAddr>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            local_state: State::Down,
            local_discr: 0,
            local_diag: DiagnosticCode::Nothing,
            remote_discr: 0,
            remote: None,
            curr_min_tx: SLOW_TX_INTERVAL,
            curr_min_rx: SLOW_TX_INTERVAL,
            poll: PollState::Idle,
            new_timers: None,
            echo_active: false,
            last_xmit_ts: None,
            last_echo_xmit_ts: None,
            tx_interval: None,
            detection_timer: None,
            echo_tx_interval: None,
            echo_detection_timer: None,
            socket_tx: None,
            sockaddr: None,
        }
    }
}

#[derive(Debug)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub last_down_time: Option<DateTime<Utc>>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub state_change_count: u32,
    pub rx_ctrl: u64,
    pub tx_ctrl: u64,
    pub rx_echo: u64,
    pub tx_echo: u64,
    pub rx_error_count: u64,
    pub tx_error_count: u64,
}

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_state_change_time: None,
            last_down_time: None,
            last_up_time: None,
            state_change_count: 0,
            rx_ctrl: 0,
            tx_ctrl: 0,
            rx_echo: 0,
            tx_echo: 0,
            rx_error_count: 0,
            tx_error_count: 0,
        }
    }
}

// ===== impl Session =====

impl Session {
    fn new(id: SessionId, key: SessionKey, local_discr: u32) -> Session {
        let mut state = SessionState::default();
        state.local_discr = local_discr;

        Session {
            id,
            key,
            config: Default::default(),
            config_enabled: false,
            state,
            statistics: Default::default(),
            sla: Sla::new(),
            refs: HashSet::new(),
            echo_seq: 0,
        }
    }

    // Computed flags (§3), derived rather than stored redundantly so they
    // can never drift from the fields that back them (invariant 3 and 4).
    pub fn flags(&self) -> SessionFlags {
        let mut flags = SessionFlags::empty();
        if self.config.admin_down {
            flags.insert(SessionFlags::ADMIN_SHUTDOWN);
        }
        if self.config.echo_mode {
            flags.insert(SessionFlags::ECHO_REQUESTED);
        }
        if self.state.echo_active {
            flags.insert(SessionFlags::ECHO_ACTIVE);
        }
        if matches!(self.key.peer(), IpAddr::V6(_)) {
            flags.insert(SessionFlags::IPV6);
        }
        if self.key.is_multihop() {
            flags.insert(SessionFlags::MULTIHOP);
        }
        if self.config.track_sla {
            flags.insert(SessionFlags::TRACK_SLA);
        }
        flags
    }

    // Returns whether the session can be deleted: not statically configured
    // and not referenced by any external collaborator.
    pub fn deletable(&self) -> bool {
        !self.config_enabled && self.refs.is_empty()
    }
}

// ===== impl Sessions (registry, §4.B) =====

#[derive(Debug, Default)]
pub struct Sessions {
    arena: Arena<Session>,
    id_tree: HashMap<SessionId, SessionIndex>,
    key_tree: BTreeMap<SessionKey, SessionIndex>,
    discr_tree: HashMap<u32, SessionIndex>,
    next_id: SessionId,
}

impl Sessions {
    pub fn new() -> Sessions {
        Default::default()
    }

    // Inserts a new session for `key`, allocating its local discriminator
    // via `local_discr`, unless a session already exists for that key (in
    // which case it is returned unchanged).
    //
    // Fails with `RegistryConflict` if `local_discr` collides with an
    // already-registered discriminator.
    pub fn insert(
        &mut self,
        key: SessionKey,
        local_discr: u32,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        if let Some(sess_idx) = self.key_tree.get(&key).copied() {
            return Ok((sess_idx, &mut self.arena[sess_idx]));
        }
        if self.discr_tree.contains_key(&local_discr) {
            return Err(Error::RegistryConflict(local_discr));
        }

        let id = self.next_id();
        let sess = Session::new(id, key.clone(), local_discr);
        let sess_idx = self.arena.insert(sess);

        self.id_tree.insert(id, sess_idx);
        self.key_tree.insert(key, sess_idx);
        self.discr_tree.insert(local_discr, sess_idx);

        Ok((sess_idx, &mut self.arena[sess_idx]))
    }

    // Deletes the session at `sess_idx` unconditionally. Callers should
    // check `Session::deletable` first (`delete_check` does this).
    fn delete(&mut self, sess_idx: SessionIndex) {
        let Some(sess) = self.arena.get(sess_idx) else {
            return;
        };
        self.id_tree.remove(&sess.id);
        self.key_tree.remove(&sess.key);
        self.discr_tree.remove(&sess.state.local_discr);
        self.arena.remove(sess_idx);
    }

    // Removes the session at `sess_idx` only if it's deletable (§4.E). No-op
    // (and safe) if the index no longer resolves, making delete idempotent.
    pub fn delete_check(&mut self, sess_idx: SessionIndex) {
        let Some(sess) = self.arena.get(sess_idx) else {
            return;
        };
        if sess.deletable() {
            self.delete(sess_idx);
        }
    }

    pub fn get(&self, sess_idx: SessionIndex) -> Option<&Session> {
        self.arena.get(sess_idx)
    }

    pub fn get_mut(&mut self, sess_idx: SessionIndex) -> Option<&mut Session> {
        self.arena.get_mut(sess_idx)
    }

    pub fn get_by_id(
        &self,
        id: SessionId,
    ) -> Option<(SessionIndex, &Session)> {
        self.id_tree
            .get(&id)
            .copied()
            .map(|sess_idx| (sess_idx, &self.arena[sess_idx]))
    }

    pub fn get_mut_by_id(
        &mut self,
        id: SessionId,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    pub fn get_by_key(&self, key: &SessionKey) -> Option<(SessionIndex, &Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(|sess_idx| (sess_idx, &self.arena[sess_idx]))
    }

    pub fn get_mut_by_key(
        &mut self,
        key: &SessionKey,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    pub fn get_by_discr(&self, discr: u32) -> Option<(SessionIndex, &Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(|sess_idx| (sess_idx, &self.arena[sess_idx]))
    }

    pub fn get_mut_by_discr(
        &mut self,
        discr: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Single-hop lookup with optional-interface fallback (§4.B): if an
    // exact {peer, Some(ifname)} match fails, retry with {peer, None}.
    pub fn find_by_shop(
        &self,
        peer: IpAddr,
        ifname: Option<&str>,
    ) -> Option<(SessionIndex, &Session)> {
        let key = SessionKey::SingleHop {
            ifname: ifname.map(str::to_owned),
            peer,
        };
        if let Some(found) = self.get_by_key(&key) {
            return Some(found);
        }
        if ifname.is_some() {
            let fallback = SessionKey::SingleHop { ifname: None, peer };
            return self.get_by_key(&fallback);
        }
        None
    }

    pub fn find_by_mhop(
        &self,
        local: IpAddr,
        peer: IpAddr,
        vrf: Option<&str>,
    ) -> Option<(SessionIndex, &Session)> {
        let key = SessionKey::MultiHop {
            local,
            peer,
            vrf: vrf.map(str::to_owned),
        };
        self.get_by_key(&key)
    }

    // Resolves the session a received packet belongs to (RFC 5880 §6.8.6,
    // §4.B). Returns `None` when the packet cannot be demultiplexed and
    // must be silently dropped.
    //
    // Note: the reference C implementation's discriminator lookup returns a
    // match only when the peer address does *not* equal the session's
    // stored peer, which contradicts its own comment. This is treated as a
    // bug in the reference and NOT reproduced here: a discriminator match
    // is honored only when the peer address DOES match.
    #[allow(clippy::too_many_arguments)]
    pub fn session_for_packet(
        &mut self,
        your_discr: u32,
        pkt_state: State,
        peer: IpAddr,
        local: IpAddr,
        localif: Option<&str>,
        vrf: Option<&str>,
        is_mhop: bool,
    ) -> Option<(SessionIndex, &mut Session)> {
        if your_discr != 0 {
            let sess_idx = self.get_by_discr(your_discr).map(|(idx, _)| idx)?;
            let sess = &self.arena[sess_idx];
            if sess.key.peer() != peer {
                return None;
            }
            return Some((sess_idx, &mut self.arena[sess_idx]));
        }

        if !matches!(pkt_state, State::Down | State::AdminDown) {
            return None;
        }

        let sess_idx = if is_mhop {
            self.find_by_mhop(local, peer, vrf).map(|(idx, _)| idx)?
        } else {
            self.find_by_shop(peer, localif).map(|(idx, _)| idx)?
        };
        Some((sess_idx, &mut self.arena[sess_idx]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.key_tree.values().map(|sess_idx| &self.arena[*sess_idx])
    }

    fn next_id(&mut self) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

impl std::ops::Index<SessionIndex> for Sessions {
    type Output = Session;

    fn index(&self, index: SessionIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<SessionIndex> for Sessions {
    fn index_mut(&mut self, index: SessionIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
