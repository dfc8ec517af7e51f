//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// End-to-end scenarios driven through the public API (config + FSM ingress
// entry points) against a `Master` built with the `testing` feature, so no
// real sockets or `tokio` timers are involved: timer firing is simulated by
// calling the expiry entry points directly rather than waiting on a clock.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bfd_core::network::PacketInfo;
use bfd_core::observer::{NullObserver, SystemInterfaceResolver};
use bfd_core::packet::{DiagnosticCode, Packet, PacketFlags, State};
use bfd_core::session::SessionKey;
use bfd_core::sla::LatencyReport;
use bfd_core::{config, fsm, ConfigOp, Error, Master, Observer, PeerConfig, Session};

fn peer(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

fn new_master(observer: impl Observer + Send + 'static) -> Master {
    Master::new(Box::new(observer), Box::new(SystemInterfaceResolver))
}

fn base_peer_config(key: SessionKey) -> PeerConfig {
    PeerConfig {
        key,
        local_multiplier: 3,
        desired_min_tx: 300_000,
        required_min_rx: 300_000,
        required_min_echo: 0,
        echo_mode: false,
        admin_down: false,
        track_sla: false,
        label: None,
        src: None,
        tx_ttl: None,
        rx_ttl: None,
        discriminator: None,
        create_only: false,
    }
}

fn inbound(state: State, my_discr: u32, your_discr: u32) -> Packet {
    Packet {
        version: Packet::VERSION,
        diag: 0,
        state,
        flags: PacketFlags::empty(),
        detect_mult: 3,
        my_discr,
        your_discr,
        desired_min_tx: 300_000,
        req_min_rx: 300_000,
        req_min_echo_rx: 0,
    }
}

fn packet_info(peer_addr: IpAddr) -> PacketInfo {
    PacketInfo::IpSingleHop {
        src: SocketAddr::new(peer_addr, 49152),
        ifname: None,
    }
}

#[derive(Clone, Default)]
struct RecordingObserver {
    transitions: Arc<Mutex<Vec<State>>>,
}

impl Observer for RecordingObserver {
    fn on_state_change(&mut self, session: &Session) {
        self.transitions.lock().unwrap().push(session.state.local_state);
    }
    fn on_config_change(&mut self, _op: ConfigOp, _session: &Session) {}
    fn on_sla_report(&mut self, _session: &Session, _report: &LatencyReport) {}
    fn on_loss_report(&mut self, _session: &Session, _loss_pct: f64) {}
}

// S1 — Three-way bring-up.
#[tokio::test]
async fn three_way_bring_up() {
    let observer = RecordingObserver::default();
    let transitions = observer.transitions.clone();
    let mut master = new_master(observer);

    let peer_addr = peer("198.51.100.2");
    let key = SessionKey::new_single_hop(None, peer_addr);
    let sess_id = config::apply(&mut master, base_peer_config(key)).unwrap();

    let (_, sess) = master.sessions.get_by_id(sess_id).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    let local_discr = sess.state.local_discr;
    assert_ne!(local_discr, 0);

    // Peer reports Down, referencing our discriminator: Down -> Init.
    let packet = inbound(State::Down, 0x9000_0001, local_discr);
    fsm::process_control_packet(&mut master, packet_info(peer_addr), packet).unwrap();
    assert_eq!(
        master.sessions.get_by_id(sess_id).unwrap().1.state.local_state,
        State::Init
    );

    // Peer reports Init: Init -> Up, a Poll Sequence begins internally.
    let packet = inbound(State::Init, 0x9000_0001, local_discr);
    fsm::process_control_packet(&mut master, packet_info(peer_addr), packet).unwrap();
    assert_eq!(
        master.sessions.get_by_id(sess_id).unwrap().1.state.local_state,
        State::Up
    );

    // Peer echoes Up with Final: commits the staged timers.
    let mut packet = inbound(State::Up, 0x9000_0001, local_discr);
    packet.flags.insert(PacketFlags::F);
    fsm::process_control_packet(&mut master, packet_info(peer_addr), packet).unwrap();

    let (_, sess) = master.sessions.get_by_id(sess_id).unwrap();
    assert_eq!(sess.state.local_state, State::Up);
    assert_eq!(sess.state.remote_discr, 0x9000_0001);
    assert_eq!(sess.state.curr_min_tx, 300_000);
    assert_eq!(sess.state.curr_min_rx, 300_000);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![State::Down, State::Init, State::Up],
    );
}

async fn bring_up(master: &mut Master, peer_addr: IpAddr) -> (bfd_core::SessionId, u32) {
    let key = SessionKey::new_single_hop(None, peer_addr);
    let sess_id = config::apply(master, base_peer_config(key)).unwrap();
    let local_discr = master.sessions.get_by_id(sess_id).unwrap().1.state.local_discr;

    let packet = inbound(State::Down, 0x9000_0001, local_discr);
    fsm::process_control_packet(master, packet_info(peer_addr), packet).unwrap();
    let packet = inbound(State::Init, 0x9000_0001, local_discr);
    fsm::process_control_packet(master, packet_info(peer_addr), packet).unwrap();
    let mut packet = inbound(State::Up, 0x9000_0001, local_discr);
    packet.flags.insert(PacketFlags::F);
    fsm::process_control_packet(master, packet_info(peer_addr), packet).unwrap();

    (sess_id, local_discr)
}

// S2 — Detect timeout. The real clock is replaced by directly invoking the
// expiry entry point, since only event ordering (not wall-clock time) is
// under test here.
#[tokio::test]
async fn detect_timeout_brings_session_down() {
    let mut master = new_master(NullObserver);
    let peer_addr = peer("198.51.100.3");
    let (sess_id, _) = bring_up(&mut master, peer_addr).await;

    fsm::process_detection_timer_expiry(&mut master, sess_id).unwrap();

    let (_, sess) = master.sessions.get_by_id(sess_id).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::TimeExpired);
    assert_eq!(sess.state.remote_discr, 0);
    assert!(sess.state.remote.is_none());
}

// S3 — Peer AdminDown.
#[tokio::test]
async fn peer_admin_down_brings_session_down_immediately() {
    let mut master = new_master(NullObserver);
    let peer_addr = peer("198.51.100.4");
    let (sess_id, local_discr) = bring_up(&mut master, peer_addr).await;

    let packet = inbound(State::AdminDown, 0x9000_0001, local_discr);
    fsm::process_control_packet(&mut master, packet_info(peer_addr), packet).unwrap();

    let (_, sess) = master.sessions.get_by_id(sess_id).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::NbrDown);
    assert!(!sess.state.echo_active);
}

// S4 — Discriminator collision on create.
#[tokio::test]
async fn discriminator_collision_on_create_is_rejected() {
    let mut master = new_master(NullObserver);

    let key_a = SessionKey::new_single_hop(None, peer("198.51.100.5"));
    let mut cfg_a = base_peer_config(key_a.clone());
    cfg_a.discriminator = Some(0x1234_5678);
    let sess_a = config::apply(&mut master, cfg_a).unwrap();

    let key_b = SessionKey::new_single_hop(None, peer("198.51.100.6"));
    let mut cfg_b = base_peer_config(key_b);
    cfg_b.discriminator = Some(0x1234_5678);
    let result = config::apply(&mut master, cfg_b);

    assert!(matches!(result, Err(Error::RegistryConflict(0x1234_5678))));
    // Session A is unaffected.
    assert!(master.sessions.get_by_id(sess_a).is_some());
    assert_eq!(master.sessions.get_by_key(&key_a).unwrap().0, master.sessions.get_by_id(sess_a).unwrap().0);
}

// Config lifecycle: AdminDown via config transitions immediately, and
// reverting brings the session back to Down to restart the handshake.
#[tokio::test]
async fn config_admin_down_and_recovery() {
    let mut master = new_master(NullObserver);
    let peer_addr = peer("198.51.100.7");
    let (sess_id, _) = bring_up(&mut master, peer_addr).await;

    let key = SessionKey::new_single_hop(None, peer_addr);
    let mut cfg = base_peer_config(key.clone());
    cfg.admin_down = true;
    config::apply(&mut master, cfg).unwrap();

    assert_eq!(
        master.sessions.get_by_id(sess_id).unwrap().1.state.local_state,
        State::AdminDown
    );

    let cfg = base_peer_config(key);
    config::apply(&mut master, cfg).unwrap();

    assert_eq!(
        master.sessions.get_by_id(sess_id).unwrap().1.state.local_state,
        State::Down
    );
}

// Delete is refused while an external collaborator still references the
// session, and idempotent once released.
#[tokio::test]
async fn delete_is_refused_while_referenced() {
    let mut master = new_master(NullObserver);
    let peer_addr = peer("198.51.100.8");
    let key = SessionKey::new_single_hop(None, peer_addr);
    config::apply(&mut master, base_peer_config(key.clone())).unwrap();

    config::register_client(&mut master, &key, "bgp").unwrap();
    config::delete(&mut master, &key).unwrap();
    assert!(master.sessions.get_by_key(&key).is_some());

    config::unregister_client(&mut master, &key, "bgp");
    assert!(master.sessions.get_by_key(&key).is_none());

    // Deleting again is a no-op, not an error.
    assert!(config::delete(&mut master, &key).is_ok());
}

#[tokio::test]
async fn create_only_rejects_existing_key() {
    let mut master = new_master(NullObserver);
    let key = SessionKey::new_single_hop(None, peer("198.51.100.9"));
    config::apply(&mut master, base_peer_config(key.clone())).unwrap();

    let mut cfg = base_peer_config(key);
    cfg.create_only = true;
    assert!(matches!(
        config::apply(&mut master, cfg),
        Err(Error::SessionAlreadyExists)
    ));
}
