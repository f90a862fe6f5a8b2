// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exercises [`xrd_core::HostCore`] the way the binary's recv loop does:
//! fragments delivered over a real UDP socket, out of order, with one
//! fragment dropped so the timeout sweep has to reclaim the slot.

use std::net::UdpSocket;

use xrd_core::HostCore;

#[test]
fn fragments_delivered_out_of_order_over_udp_reassemble_correctly() {
    let matrix = xrd_csi2::PixelMatrix::zeroed(256, 256, 16).unwrap();
    let mut packets = xrd_transport::fragment_matrix(&matrix, 42, 0, 4096);
    packets.reverse();

    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.connect(server_addr).unwrap();

    for packet in &packets {
        client.send(packet).unwrap();
    }

    let mut host = HostCore::new(500_000_000);
    let mut completed = None;
    let mut buf = [0u8; 8192 + 64];
    for _ in 0..packets.len() {
        let (n, source) = server.recv_from(&mut buf).unwrap();
        if let Some(frame) = host.ingest(source, &buf[..n], 0) {
            completed = Some(frame);
        }
    }

    let frame = completed.expect("all fragments arrived, frame should complete");
    assert_eq!(frame.frame_id, 42);
    assert_eq!(frame.matrix, matrix);
}

/// A frame that never gets its last fragment sits in the table until the
/// timeout sweep reclaims it, mirroring the binary's periodic
/// `cleanup_expired` call between `recv_from`s.
#[test]
fn a_stalled_frame_is_reclaimed_by_the_timeout_sweep() {
    let matrix = xrd_csi2::PixelMatrix::zeroed(256, 256, 16).unwrap();
    let packets = xrd_transport::fragment_matrix(&matrix, 43, 0, 4096);
    assert!(packets.len() > 1, "need at least one packet to withhold");

    let mut host = HostCore::new(100);
    let source = "127.0.0.1:9".parse().unwrap();
    for packet in &packets[..packets.len() - 1] {
        assert!(host.ingest(source, packet, 0).is_none());
    }

    let evicted = host.cleanup_expired(10_000);
    assert_eq!(evicted, 1);

    // The slot is gone, so even the withheld final packet now starts a
    // fresh (incomplete) frame instead of completing the old one.
    let last = packets.last().unwrap();
    assert!(host.ingest(source, last, 10_000).is_none());
}
