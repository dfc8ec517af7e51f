//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bfd_core::packet::{DecodeError, EchoPacket, Packet, PacketFlags, State};

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DecodeError>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
                0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
                0x00, 0x00, 0xc3, 0x50,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Up,
                flags: PacketFlags::empty(),
                detect_mult: 3,
                my_discr: 0x9fb205d6,
                your_discr: 0x4a2357dc,
                desired_min_tx: 300000,
                req_min_rx: 300000,
                req_min_echo_rx: 50000,
            }),
        )
    });

// A Down-state packet carrying Poll, as seen during the three-way handshake.
static PACKET2: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0x60, 0x03, 0x18, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x0f, 0x42, 0x40,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Down,
                flags: PacketFlags::P,
                detect_mult: 3,
                my_discr: 1,
                your_discr: 0,
                desired_min_tx: 1_000_000,
                req_min_rx: 1_000_000,
                req_min_echo_rx: 0,
            }),
        )
    });

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_decode_packet(bytes, packet);
}

#[test]
fn decode_rejects_packet_shorter_than_mandatory_section() {
    let short = vec![0u8; 23];
    assert_eq!(Packet::decode(&short), Err(DecodeError::IncompletePacket));
}

#[test]
fn decode_rejects_zero_detect_mult() {
    let mut bytes = PACKET1.0.clone();
    bytes[2] = 0;
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidDetectMult(0))
    );
}

#[test]
fn decode_rejects_unsupported_version() {
    let mut bytes = PACKET1.0.clone();
    bytes[0] = (2 << 5) | (bytes[0] & 0x1F);
    assert_eq!(Packet::decode(&bytes), Err(DecodeError::InvalidVersion(2)));
}

#[test]
fn echo_packet_round_trips() {
    let echo = EchoPacket::new(0x1234_5678, 42);
    let bytes = echo.encode();
    assert_eq!(EchoPacket::decode(&bytes).unwrap(), echo);
}

#[test]
fn echo_packet_decode_rejects_short_buffer() {
    let bytes = [0u8; 4];
    assert_eq!(EchoPacket::decode(&bytes), Err(DecodeError::IncompletePacket));
}
