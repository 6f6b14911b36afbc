#![no_main]

use std::time::Duration;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use quanta::Clock;
use raknet_transport::wire::OfflinePacket;
use raknet_transport::{Responder, Response, SessionConfig};

/// Fuzz a server session with arbitrary inbound bytes.
///
/// Exercises datagram dedup, ACK/NACK handling, split reassembly, the
/// ordering lanes and the handshake state machine. Input is cut into
/// packets on 0xFF 0x00 markers; the clock advances between packets.
fuzz_target!(|data: &[u8]| {
    let (clock, mock) = Clock::mock();
    let responder = Responder::new(SessionConfig::default(), 2, "");
    let from = "10.0.0.1:50000".parse().unwrap();
    let request = OfflinePacket::OpenConnectionRequest2 {
        server_address: "10.0.0.2:19132".parse().unwrap(),
        mtu: 1400,
        client_guid: 1,
    };
    let Response::Accept { mut session, .. } = responder.handle(&request, from, clock.now()) else {
        return;
    };

    let mut start = 0;
    for i in 0..data.len() {
        if i + 1 < data.len() && data[i] == 0xFF && data[i + 1] == 0x00 {
            session.receive(Bytes::copy_from_slice(&data[start..i]), clock.now());
            start = i + 2;
            mock.increment(Duration::from_millis(50));
            session.tick(clock.now());
            session.drain_output().for_each(drop);
            session.drain_events().for_each(drop);
        }
    }
    session.receive(Bytes::copy_from_slice(&data[start..]), clock.now());
    session.tick(clock.now());
});
