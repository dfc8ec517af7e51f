//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bfd_core::error::Error;
use bfd_core::packet::State;
use bfd_core::session::{Sessions, SessionKey};

fn peer(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

#[test]
fn insert_is_keyed_and_discriminator_indexed() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(Some("eth0".to_owned()), peer("198.51.100.2"));

    let (idx, sess) = sessions.insert(key.clone(), 7).unwrap();
    sess.config_enabled = true;
    let id = sess.id;

    assert_eq!(sessions.get(idx).unwrap().id, id);
    assert_eq!(sessions.get_by_id(id).unwrap().0, idx);
    assert_eq!(sessions.get_by_key(&key).unwrap().0, idx);
    assert_eq!(sessions.get_by_discr(7).unwrap().0, idx);
}

#[test]
fn insert_is_idempotent_on_existing_key() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));

    let (idx1, _) = sessions.insert(key.clone(), 1).unwrap();
    let (idx2, _) = sessions.insert(key, 2).unwrap();

    assert_eq!(idx1, idx2);
    // The second `local_discr` argument is ignored since the key already
    // resolves to a session.
    assert!(sessions.get_by_discr(2).is_none());
    assert!(sessions.get_by_discr(1).is_some());
}

#[test]
fn insert_rejects_discriminator_collision_across_keys() {
    let mut sessions = Sessions::new();
    let key_a = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    let key_b = SessionKey::new_single_hop(None, peer("198.51.100.3"));

    sessions.insert(key_a.clone(), 0x1234_5678).unwrap();
    let result = sessions.insert(key_b, 0x1234_5678);

    assert!(matches!(result, Err(Error::RegistryConflict(0x1234_5678))));
    // The first session is unaffected.
    assert!(sessions.get_by_key(&key_a).is_some());
}

#[test]
fn find_by_shop_falls_back_to_wildcard_interface() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    let (idx, _) = sessions.insert(key, 1).unwrap();

    let (found_idx, _) =
        sessions.find_by_shop(peer("198.51.100.2"), Some("eth1")).unwrap();
    assert_eq!(found_idx, idx);
}

#[test]
fn find_by_shop_prefers_exact_interface_match() {
    let mut sessions = Sessions::new();
    let wildcard = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    let specific =
        SessionKey::new_single_hop(Some("eth0".to_owned()), peer("198.51.100.2"));
    let (wildcard_idx, _) = sessions.insert(wildcard, 1).unwrap();
    let (specific_idx, _) = sessions.insert(specific, 2).unwrap();
    assert_ne!(wildcard_idx, specific_idx);

    let (found_idx, _) =
        sessions.find_by_shop(peer("198.51.100.2"), Some("eth0")).unwrap();
    assert_eq!(found_idx, specific_idx);
}

#[test]
fn session_for_packet_matches_by_discriminator_only_when_peer_agrees() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    sessions.insert(key, 42).unwrap();

    // Correct discriminator, correct peer: matches.
    let found = sessions.session_for_packet(
        42,
        State::Up,
        peer("198.51.100.2"),
        peer("198.51.100.2"),
        None,
        None,
        false,
    );
    assert!(found.is_some());

    // Correct discriminator, wrong peer: the reference implementation's
    // inverted check is not reproduced here, so this must not match.
    let found = sessions.session_for_packet(
        42,
        State::Up,
        peer("203.0.113.9"),
        peer("203.0.113.9"),
        None,
        None,
        false,
    );
    assert!(found.is_none());
}

#[test]
fn session_for_packet_falls_back_to_key_lookup_when_your_discr_is_zero() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    sessions.insert(key, 1).unwrap();

    // your_discr == 0 is only acceptable while the peer reports Down or
    // AdminDown; demux then falls back to the {peer, ifname} key.
    let found = sessions.session_for_packet(
        0,
        State::Down,
        peer("198.51.100.2"),
        peer("198.51.100.2"),
        None,
        None,
        false,
    );
    assert!(found.is_some());

    // Same packet claiming Init: not a valid first-packet state, no match.
    let found = sessions.session_for_packet(
        0,
        State::Init,
        peer("198.51.100.2"),
        peer("198.51.100.2"),
        None,
        None,
        false,
    );
    assert!(found.is_none());
}

#[test]
fn delete_check_is_refused_while_referenced_and_idempotent_otherwise() {
    let mut sessions = Sessions::new();
    let key = SessionKey::new_single_hop(None, peer("198.51.100.2"));
    let (idx, sess) = sessions.insert(key.clone(), 1).unwrap();
    sess.refs.insert("bgp".to_owned());

    sessions.delete_check(idx);
    assert!(sessions.get(idx).is_some(), "still referenced, must not delete");

    sessions.get_mut(idx).unwrap().refs.remove("bgp");
    sessions.delete_check(idx);
    assert!(sessions.get(idx).is_none());

    // Deleting twice (or an unknown index) is a no-op, not a panic.
    sessions.delete_check(idx);
    assert!(sessions.get_by_key(&key).is_none());
}
