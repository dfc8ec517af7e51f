//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::warn;

use crate::error::Error;
use crate::master::Master;
use crate::observer::ConfigOp;
use crate::packet::{DiagnosticCode, State};
use crate::session::{SessionConfig, SessionId, SessionKey};

// Parameters submitted by the external configuration collaborator for a
// single peer (§6). One `PeerConfig` fully describes the desired state of
// a session; `apply` diffs it against whatever is currently installed.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub key: SessionKey,
    pub local_multiplier: u8,
    pub desired_min_tx: u32,
    pub required_min_rx: u32,
    pub required_min_echo: u32,
    pub echo_mode: bool,
    pub admin_down: bool,
    pub track_sla: bool,
    pub label: Option<String>,
    pub src: Option<IpAddr>,
    pub tx_ttl: Option<u8>,
    pub rx_ttl: Option<u8>,
    // When set, used verbatim instead of allocating a fresh discriminator.
    // Rejected with `RegistryConflict` if already in use by another session.
    pub discriminator: Option<u32>,
    // When set, `apply` fails with `SessionAlreadyExists` if `key` already
    // has a session installed, instead of falling through to an update.
    pub create_only: bool,
}

impl PeerConfig {
    fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            local_multiplier: self.local_multiplier,
            desired_min_tx: self.desired_min_tx,
            required_min_rx: self.required_min_rx,
            required_min_echo: self.required_min_echo,
            echo_mode: self.echo_mode,
            admin_down: self.admin_down,
            track_sla: self.track_sla,
            label: self.label.clone(),
            src: self.src,
            tx_ttl: self.tx_ttl,
            rx_ttl: self.rx_ttl,
        }
    }
}

// Creates or updates the session for `cfg.key` (§4.E). Returns the
// session's stable ID either way.
pub fn apply(master: &mut Master, cfg: PeerConfig) -> Result<SessionId, Error> {
    if master.sessions.get_by_key(&cfg.key).is_some() {
        if cfg.create_only {
            return Err(Error::SessionAlreadyExists);
        }
        return update(master, cfg);
    }
    create(master, cfg)
}

fn create(master: &mut Master, cfg: PeerConfig) -> Result<SessionId, Error> {
    let local_discr = match cfg.discriminator {
        Some(discr) => discr,
        None => master.discriminator.allocate(),
    };

    let (sess_idx, sess) = master.sessions.insert(cfg.key.clone(), local_discr)?;
    sess.config = cfg.to_session_config();
    sess.config_enabled = true;
    sess.state.local_discr = local_discr;

    let initial_state = if sess.config.admin_down {
        State::AdminDown
    } else {
        State::Down
    };
    sess.state_update(initial_state, DiagnosticCode::Nothing, &mut master.observer);

    install_label(master, sess_idx, cfg.label.as_deref());

    master.update_udp_rx_tasks();
    master.rearm_session_timers(sess_idx);

    let sess_id = master.sessions[sess_idx].id;
    master
        .observer
        .on_config_change(ConfigOp::Add, &master.sessions[sess_idx]);

    Ok(sess_id)
}

fn update(master: &mut Master, cfg: PeerConfig) -> Result<SessionId, Error> {
    let (sess_idx, sess) = master
        .sessions
        .get_mut_by_key(&cfg.key)
        .ok_or_else(|| Error::SessionKeyNotFound(cfg.key.clone()))?;

    let was_admin_down = sess.config.admin_down;
    let was_up = sess.state.local_state == State::Up;
    let timers_changed = sess.config.desired_min_tx != cfg.desired_min_tx
        || sess.config.required_min_rx != cfg.required_min_rx;

    if cfg.label.as_deref() != sess.config.label.as_deref() {
        uninstall_label(master, sess_idx);
        install_label(master, sess_idx, cfg.label.as_deref());
    }

    let sess = &mut master.sessions[sess_idx];
    sess.config = cfg.to_session_config();

    match (was_admin_down, cfg.admin_down) {
        (false, true) => {
            sess.state_update(
                State::AdminDown,
                DiagnosticCode::AdminDown,
                &mut master.observer,
            );
            master.disarm_session(sess_idx);
        }
        (true, false) => {
            let sess = &mut master.sessions[sess_idx];
            sess.state_update(State::Down, DiagnosticCode::Nothing, &mut master.observer);
            master.rearm_session_timers(sess_idx);
        }
        _ => {
            if was_up && timers_changed {
                master.sessions[sess_idx].poll_sequence_start();
            }
            master.rearm_session_timers(sess_idx);
        }
    }

    let sess_id = master.sessions[sess_idx].id;
    master
        .observer
        .on_config_change(ConfigOp::Update, &master.sessions[sess_idx]);

    Ok(sess_id)
}

// Marks the session for `key` as unconfigured and removes it from the
// registry once no external collaborator still references it (§4.E).
// Idempotent: a missing key is not an error.
pub fn delete(master: &mut Master, key: &SessionKey) -> Result<(), Error> {
    let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(key) else {
        return Ok(());
    };
    sess.config_enabled = false;
    uninstall_label(master, sess_idx);

    master.sessions.delete_check(sess_idx);
    master.update_udp_rx_tasks();

    Ok(())
}

// Registers an external collaborator's interest in a session, preventing
// its deletion until a matching `unregister_client` call (§4.B, §4.E).
pub fn register_client(
    master: &mut Master,
    key: &SessionKey,
    client: &str,
) -> Result<(), Error> {
    let (_, sess) = master
        .sessions
        .get_mut_by_key(key)
        .ok_or_else(|| Error::SessionKeyNotFound(key.clone()))?;
    sess.refs.insert(client.to_owned());
    Ok(())
}

pub fn unregister_client(master: &mut Master, key: &SessionKey, client: &str) {
    let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(key) else {
        return;
    };
    sess.refs.remove(client);
    master.sessions.delete_check(sess_idx);
}

// Installs the optional label→session mapping, failing softly (logging and
// leaving the session unlabeled) if the label is already taken (§4.E).
fn install_label(master: &mut Master, sess_idx: crate::session::SessionIndex, label: Option<&str>) {
    let Some(label) = label else {
        return;
    };
    if master.labels.contains_key(label) {
        warn!(%label, "label already in use, session created without it");
        return;
    }
    let sess_id = master.sessions[sess_idx].id;
    master.labels.insert(label.to_owned(), sess_id);
}

fn uninstall_label(master: &mut Master, sess_idx: crate::session::SessionIndex) {
    if let Some(label) = master.sessions[sess_idx].config.label.clone() {
        master.labels.remove(&label);
    }
}
