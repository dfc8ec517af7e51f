//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::Utc;
use tracing::trace;

use crate::debug::Debug;
use crate::error::Error;
use crate::master::Master;
use crate::network::PacketInfo;
use crate::observer::Observer;
use crate::packet::{DiagnosticCode, EchoPacket, Packet, PacketFlags, State};
use crate::session::{PollState, Session, SessionId};

// ===== impl Session: derived timer/packet helpers (§4.D) =====

impl Session {
    // Locally configured Detect Mult, possibly overridden by a client.
    pub(crate) fn local_multiplier(&self) -> u8 {
        self.config.local_multiplier
    }

    // Desired Min Tx Interval to advertise. RFC 5880 §6.8.3: while the
    // session isn't Up, this MUST NOT be faster than the slow-start value.
    pub(crate) fn desired_tx_interval(&self) -> u32 {
        if self.state.local_state != State::Up {
            return crate::session::SLOW_TX_INTERVAL;
        }
        self.config.desired_min_tx
    }

    pub(crate) fn required_min_rx(&self) -> u32 {
        self.config.required_min_rx
    }

    // Last Required Min Rx Interval received from the peer; 1 microsecond
    // (the RFC's "unset" sentinel) if nothing has been received yet.
    fn remote_min_rx_interval(&self) -> u32 {
        self.state.remote.map(|r| r.min_rx).unwrap_or(1)
    }

    fn remote_desired_min_tx(&self) -> u32 {
        self.state.remote.map(|r| r.min_tx).unwrap_or(1)
    }

    // Invariant 5: xmt_TO = max(local.desired_min_tx, remote.required_min_rx).
    pub(crate) fn negotiated_tx_interval(&self) -> Option<u32> {
        let remote_min_rx = self.remote_min_rx_interval();
        if remote_min_rx == 0 {
            // A system MUST NOT periodically transmit if
            // RemoteMinRxInterval is zero.
            return None;
        }
        Some(std::cmp::max(self.desired_tx_interval(), remote_min_rx))
    }

    fn negotiated_rx_interval(&self) -> Option<u32> {
        self.state
            .remote
            .map(|remote| std::cmp::max(self.required_min_rx(), remote.min_tx))
    }

    // Invariant 6: detect_TO with echo inactive.
    pub(crate) fn detection_time(&self) -> Option<u32> {
        if self.state.echo_active {
            return self.echo_detection_time();
        }
        let remote = self.state.remote?;
        Some(remote.multiplier as u32 * self.negotiated_rx_interval()?)
    }

    pub(crate) fn echo_negotiated_interval(&self) -> Option<u32> {
        let remote = self.state.remote?;
        if remote.min_echo_rx == 0 || self.config.required_min_echo == 0 {
            return None;
        }
        Some(std::cmp::max(self.config.required_min_echo, remote.min_echo_rx))
    }

    // Invariant 6: detect_TO with echo active.
    fn echo_detection_time(&self) -> Option<u32> {
        let interval = self.echo_negotiated_interval()?;
        Some(self.local_multiplier() as u32 * interval)
    }

    // Echo activation condition (§4.D): Up, requested locally, remote
    // willing (required_min_echo > 0), and single-hop (invariant 4).
    fn echo_wanted(&self) -> bool {
        self.state.local_state == State::Up
            && self.config.echo_mode
            && self.key.is_single_hop()
            && self
                .state
                .remote
                .is_some_and(|r| r.min_echo_rx > 0)
    }

    pub(crate) fn generate_packet(&self) -> Packet {
        let mut flags = PacketFlags::empty();
        if self.state.poll == PollState::PollingSent {
            flags.insert(PacketFlags::P);
        }

        Packet {
            version: Packet::VERSION,
            diag: self.state.local_diag as u8,
            state: self.state.local_state,
            flags,
            detect_mult: self.local_multiplier(),
            my_discr: self.state.local_discr,
            your_discr: self.state.remote_discr,
            desired_min_tx: self.desired_tx_interval(),
            req_min_rx: self.required_min_rx(),
            req_min_echo_rx: self.config.required_min_echo,
        }
    }

    pub(crate) fn generate_final_packet(&self) -> Packet {
        let mut packet = self.generate_packet();
        packet.flags.remove(PacketFlags::P);
        packet.flags.insert(PacketFlags::F);
        packet
    }

    pub(crate) fn generate_echo_packet(&mut self) -> EchoPacket {
        self.echo_seq = self.echo_seq.wrapping_add(1);
        EchoPacket::new(self.state.local_discr, self.echo_seq)
    }

    // Initiates a Poll Sequence, staging the values to commit on Final
    // (§4.D). Idempotent: re-entering from PollingSent keeps the first
    // staged values in flight.
    pub(crate) fn poll_sequence_start(&mut self) {
        if self.state.poll == PollState::Idle {
            let old = self.state.poll;
            self.state.poll = PollState::PollingSent;
            self.state.new_timers =
                Some((self.desired_tx_interval(), self.required_min_rx()));
            Debug::PollSequenceStart(&self.key).log();
            Debug::PollStateChange(&self.key, old, self.state.poll).log();
        }
    }

    // Commits the staged timer values on Final receipt and returns to Idle.
    fn poll_sequence_commit(&mut self) {
        if self.state.poll != PollState::PollingSent {
            return;
        }
        let old = self.state.poll;
        self.state.poll = PollState::FinalReceived;
        if let Some((tx, rx)) = self.state.new_timers.take() {
            self.state.curr_min_tx = tx;
            self.state.curr_min_rx = rx;
        }
        self.state.poll = PollState::Idle;
        Debug::PollStateChange(&self.key, old, self.state.poll).log();
    }

    // Updates the FSM state, notifying the observer and refreshing
    // statistics, per §4.D's transition table and §9's invariant 3.
    pub(crate) fn state_update(
        &mut self,
        state: State,
        diag: DiagnosticCode,
        observer: &mut impl Observer,
    ) {
        let old_state = self.state.local_state;
        self.state.local_state = state;
        self.state.local_diag = diag;

        Debug::FsmTransition(&self.key, old_state, state).log();

        self.statistics.last_state_change_time = Some(Utc::now());
        self.statistics.state_change_count += 1;
        match state {
            State::Down => {
                self.statistics.last_down_time = Some(Utc::now());
                // Invariant 7: remote discriminator clears on entry to Down.
                self.state.remote_discr = 0;
                self.state.remote = None;
                self.deactivate_echo();
            }
            State::Up => {
                self.statistics.last_up_time = Some(Utc::now());
            }
            State::AdminDown => {
                self.deactivate_echo();
            }
            State::Init => {}
        }

        if old_state == State::Up && state != State::Up {
            self.state.curr_min_tx = crate::session::SLOW_TX_INTERVAL;
        } else if state == State::Up && old_state != State::Up {
            // Negotiate the (possibly faster) operational timers.
            self.poll_sequence_start();
        }

        if state == State::Up && self.echo_wanted() {
            self.activate_echo();
        }

        observer.on_state_change(self);
    }

    fn activate_echo(&mut self) {
        if !self.state.echo_active {
            self.state.echo_active = true;
        }
    }

    pub(crate) fn deactivate_echo(&mut self) {
        self.state.echo_active = false;
        self.state.echo_tx_interval = None;
        self.state.echo_detection_timer = None;
    }
}

// ===== ingress processing (§4.D) =====

pub fn process_control_packet(
    master: &mut Master,
    packet_info: PacketInfo,
    packet: Packet,
) -> Result<(), Error> {
    trace!(?packet_info, ?packet, "received control packet");

    validate_bfd_packet(&packet)?;

    let peer = packet_info.src_addr();
    let is_mhop = matches!(packet_info, PacketInfo::IpMultihop { .. });
    let (local, localif, vrf) = match &packet_info {
        PacketInfo::IpSingleHop { ifname, .. } => {
            (None, ifname.as_deref(), None)
        }
        PacketInfo::IpMultihop { dst, .. } => (Some(*dst), None, None),
    };
    let local = local.unwrap_or(peer);

    let Some((sess_idx, sess)) = master.sessions.session_for_packet(
        packet.your_discr,
        packet.state,
        peer,
        local,
        localif,
        vrf,
        is_mhop,
    ) else {
        return Err(Error::SessionNoMatch(packet_info, packet.your_discr));
    };

    if is_mhop
        && let PacketInfo::IpMultihop { ttl, .. } = &packet_info
        && let Some(rx_ttl) = sess.config.rx_ttl
        && *ttl < rx_ttl
    {
        sess.statistics.rx_error_count += 1;
        return Err(Error::IoError(crate::error::IoError::UdpTtlCheckFailed(
            *ttl,
        )));
    }

    sess.statistics.rx_ctrl += 1;

    sess.state.remote_discr = packet.my_discr;
    sess.state.remote = Some(crate::session::RemoteInfo::new(
        packet.state,
        packet.my_discr,
        packet.diag,
        packet.detect_mult,
        packet.desired_min_tx,
        packet.req_min_rx,
        packet.req_min_echo_rx,
    ));

    // On Final receipt while polling, commit staged timers (§4.D).
    if packet.flags.contains(PacketFlags::F) {
        sess.poll_sequence_commit();
    }

    // Fold an SLA sample before recomputing the detect timer so the
    // latency reflects the interval since the last transmit (§4.E).
    if sess.config.track_sla
        && let Some(last_xmit) = sess.state.last_xmit_ts
    {
        let elapsed_ms = (Utc::now() - last_xmit).num_milliseconds().max(0) as u64;
        let rx_total = sess.statistics.rx_ctrl + sess.statistics.rx_echo;
        if let Some(report) =
            sess.sla.record_sample(elapsed_ms, sess.local_multiplier(), rx_total)
        {
            Debug::SlaReport(&sess.key, &report).log();
            master.observer.on_sla_report(&master.sessions[sess_idx], &report);
        }
        let tx_total = sess.statistics.tx_ctrl + sess.statistics.tx_echo;
        if let Some(loss_pct) = sess.sla.maybe_loss_report(tx_total, rx_total) {
            master.observer.on_loss_report(&master.sessions[sess_idx], loss_pct);
        }
    }

    let sess = &mut master.sessions[sess_idx];

    let next_state = match (sess.state.local_state, packet.state) {
        (State::AdminDown, _) => {
            Debug::PacketDiscard(&sess.key, "local session is AdminDown").log();
            return Ok(());
        }
        (State::Init | State::Up, State::AdminDown) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        (State::Down, State::Down) => {
            Some((State::Init, DiagnosticCode::Nothing))
        }
        (State::Down, State::Init) => Some((State::Up, DiagnosticCode::Nothing)),
        (State::Init, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Up, State::Down) => Some((State::Down, DiagnosticCode::NbrDown)),
        _ => None,
    };
    if let Some((state, diag)) = next_state {
        sess.state_update(state, diag, &mut master.observer);
    }

    master.rearm_session_timers(sess_idx);

    if packet.flags.contains(PacketFlags::P) {
        master.send_final(sess_idx);
    }

    Ok(())
}

fn validate_bfd_packet(packet: &Packet) -> Result<(), Error> {
    if packet.version != Packet::VERSION {
        return Err(Error::VersionMismatch(packet.version));
    }
    if packet.detect_mult == 0 {
        return Err(Error::InvalidDetectMult(packet.detect_mult));
    }
    if packet.flags.contains(PacketFlags::M) {
        return Err(Error::InvalidFlags(packet.flags));
    }
    if packet.my_discr == 0 {
        return Err(Error::InvalidMyDiscriminator(packet.my_discr));
    }
    if packet.your_discr == 0
        && !matches!(packet.state, State::Down | State::AdminDown)
    {
        return Err(Error::InvalidYourDiscriminator(packet.your_discr));
    }
    // Authentication TLVs are an explicit Non-goal: any A=1 packet is
    // rejected outright rather than partially validated.
    if packet.flags.contains(PacketFlags::A) {
        return Err(Error::AuthError);
    }

    Ok(())
}

pub fn process_echo_packet(
    master: &mut Master,
    my_discr: u32,
) -> Result<(), Error> {
    let Some((sess_idx, sess)) = master.sessions.get_mut_by_discr(my_discr)
    else {
        return Ok(());
    };
    if !sess.state.echo_active {
        return Ok(());
    }
    sess.statistics.rx_echo += 1;
    master.rearm_echo_detection_timer(sess_idx);
    Ok(())
}

pub fn process_detection_timer_expiry(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master
        .sessions
        .get_mut_by_id(sess_id)
        .ok_or(Error::SessionIdNotFound(sess_id))?;

    Debug::DetectionTimeExpiry(&sess.key).log();
    sess.state_update(
        State::Down,
        DiagnosticCode::TimeExpired,
        &mut master.observer,
    );

    Ok(())
}

pub fn process_echo_detection_timer_expiry(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master
        .sessions
        .get_mut_by_id(sess_id)
        .ok_or(Error::SessionIdNotFound(sess_id))?;

    Debug::EchoDetectionTimeExpiry(&sess.key).log();
    sess.state_update(
        State::Down,
        DiagnosticCode::TimeExpired,
        &mut master.observer,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::observer::NullObserver;
    use crate::session::{RemoteInfo, SessionKey, Sessions};

    use super::*;

    fn peer(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    fn new_session(sessions: &mut Sessions) -> crate::session::SessionIndex {
        let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));
        let (idx, _) = sessions.insert(key, 1).unwrap();
        idx
    }

    // S1's slow-start value: no remote info yet, session not Up.
    #[test]
    fn negotiated_tx_interval_defaults_to_slow_start() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.config.desired_min_tx = 300_000;

        assert_eq!(
            sess.negotiated_tx_interval(),
            Some(crate::session::SLOW_TX_INTERVAL)
        );
    }

    // S1's final negotiated interval once Up and both sides agree on
    // 300ms: xmt_TO = max(local.desired_min_tx, remote.required_min_rx).
    #[test]
    fn negotiated_tx_interval_uses_max_of_local_and_remote_once_up() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.config.desired_min_tx = 300_000;
        sess.state.local_state = State::Up;
        sess.state.remote = Some(RemoteInfo::new(
            State::Up, 99, 0, 3, 300_000, 300_000, 0,
        ));

        assert_eq!(sess.negotiated_tx_interval(), Some(300_000));
    }

    #[test]
    fn negotiated_tx_interval_is_none_when_remote_min_rx_is_zero() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.local_state = State::Up;
        sess.state.remote =
            Some(RemoteInfo::new(State::Up, 99, 0, 3, 300_000, 0, 0));

        assert_eq!(sess.negotiated_tx_interval(), None);
    }

    // Invariant 6: detect_TO = remote.detect_mult * negotiated_rx_interval.
    #[test]
    fn detection_time_uses_remote_multiplier() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.config.required_min_rx = 300_000;
        sess.state.remote = Some(RemoteInfo::new(
            State::Up, 99, 0, 3, 300_000, 300_000, 0,
        ));

        assert_eq!(sess.detection_time(), Some(900_000));
    }

    #[test]
    fn detection_time_defers_to_echo_when_active() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.config.local_multiplier = 3;
        sess.config.required_min_echo = 50_000;
        sess.state.echo_active = true;
        sess.state.remote = Some(RemoteInfo::new(
            State::Up, 99, 0, 3, 300_000, 300_000, 50_000,
        ));

        assert_eq!(sess.detection_time(), Some(150_000));
    }

    // Property 7: toggling echo-mode doesn't perturb the negotiated echo
    // interval, since it's a function of required_min_echo/remote only.
    #[test]
    fn echo_negotiated_interval_unaffected_by_mode_toggling() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.config.required_min_echo = 50_000;
        sess.config.echo_mode = true;
        sess.state.remote = Some(RemoteInfo::new(
            State::Up, 99, 0, 3, 300_000, 300_000, 50_000,
        ));

        let baseline = sess.echo_negotiated_interval();
        assert_eq!(baseline, Some(50_000));

        sess.config.echo_mode = false;
        assert_eq!(sess.echo_negotiated_interval(), baseline);

        sess.config.echo_mode = true;
        assert_eq!(sess.echo_negotiated_interval(), baseline);
    }

    #[test]
    fn activate_echo_is_idempotent() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];

        sess.activate_echo();
        assert!(sess.state.echo_active);
        sess.activate_echo();
        assert!(sess.state.echo_active);
    }

    #[test]
    fn deactivate_echo_clears_echo_timers() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.echo_active = true;

        sess.deactivate_echo();

        assert!(!sess.state.echo_active);
        assert!(sess.state.echo_tx_interval.is_none());
        assert!(sess.state.echo_detection_timer.is_none());
    }

    // Property 6: a Poll Sequence stages new timers and only commits them
    // on Final, and re-entering from PollingSent doesn't restage.
    #[test]
    fn poll_sequence_stages_and_commits_new_timers() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.local_state = State::Up;
        sess.config.desired_min_tx = 100_000;
        sess.config.required_min_rx = 100_000;
        sess.state.curr_min_tx = 300_000;
        sess.state.curr_min_rx = 300_000;

        sess.poll_sequence_start();
        assert_eq!(sess.state.poll, PollState::PollingSent);
        assert_eq!(sess.state.new_timers, Some((100_000, 100_000)));

        // Idempotent re-entry: staged values aren't replaced mid-poll.
        sess.config.desired_min_tx = 200_000;
        sess.poll_sequence_start();
        assert_eq!(sess.state.new_timers, Some((100_000, 100_000)));

        sess.poll_sequence_commit();
        assert_eq!(sess.state.poll, PollState::Idle);
        assert_eq!(sess.state.curr_min_tx, 100_000);
        assert_eq!(sess.state.curr_min_rx, 100_000);
    }

    #[test]
    fn poll_sequence_commit_is_noop_outside_polling_sent() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.curr_min_tx = 300_000;

        sess.poll_sequence_commit();

        assert_eq!(sess.state.poll, PollState::Idle);
        assert_eq!(sess.state.curr_min_tx, 300_000);
    }

    // Invariant 7: the remote discriminator and learned parameters clear on
    // entry to Down, and any active echo session is torn down.
    #[test]
    fn state_update_resets_remote_info_and_echo_on_down() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.remote_discr = 42;
        sess.state.remote =
            Some(RemoteInfo::new(State::Up, 42, 0, 3, 300_000, 300_000, 0));
        sess.state.echo_active = true;

        let mut observer = NullObserver;
        sess.state_update(State::Down, DiagnosticCode::TimeExpired, &mut observer);

        assert_eq!(sess.state.local_state, State::Down);
        assert_eq!(sess.state.local_diag, DiagnosticCode::TimeExpired);
        assert_eq!(sess.state.remote_discr, 0);
        assert!(sess.state.remote.is_none());
        assert!(!sess.state.echo_active);
    }

    #[test]
    fn state_update_starts_poll_sequence_on_transition_to_up() {
        let mut sessions = Sessions::new();
        let idx = new_session(&mut sessions);
        let sess = &mut sessions[idx];
        sess.state.remote =
            Some(RemoteInfo::new(State::Up, 42, 0, 3, 300_000, 300_000, 0));

        let mut observer = NullObserver;
        sess.state_update(State::Up, DiagnosticCode::Nothing, &mut observer);

        assert_eq!(sess.state.poll, PollState::PollingSent);
    }

    fn base_packet() -> Packet {
        Packet {
            version: Packet::VERSION,
            diag: 0,
            state: State::Down,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr: 1,
            your_discr: 0,
            desired_min_tx: 300_000,
            req_min_rx: 300_000,
            req_min_echo_rx: 0,
        }
    }

    #[test]
    fn validate_rejects_auth_flag() {
        let mut packet = base_packet();
        packet.flags.insert(PacketFlags::A);
        assert!(matches!(
            validate_bfd_packet(&packet),
            Err(Error::AuthError)
        ));
    }

    #[test]
    fn validate_rejects_zero_detect_mult() {
        let mut packet = base_packet();
        packet.detect_mult = 0;
        assert!(matches!(
            validate_bfd_packet(&packet),
            Err(Error::InvalidDetectMult(0))
        ));
    }

    #[test]
    fn validate_rejects_multipoint_flag() {
        let mut packet = base_packet();
        packet.flags.insert(PacketFlags::M);
        assert!(matches!(
            validate_bfd_packet(&packet),
            Err(Error::InvalidFlags(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_your_discr_outside_down_or_admindown() {
        let mut packet = base_packet();
        packet.state = State::Init;
        packet.your_discr = 0;
        assert!(matches!(
            validate_bfd_packet(&packet),
            Err(Error::InvalidYourDiscriminator(0))
        ));
    }

    #[test]
    fn validate_accepts_zero_your_discr_while_down() {
        let packet = base_packet();
        assert!(validate_bfd_packet(&packet).is_ok());
    }
}
