#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use raknet_transport::datagram::Datagram;
use raknet_transport::record::RecordSet;
use raknet_transport::wire::{OfflinePacket, Packet};

/// Every top-level decoder must return an error, never panic.
///
/// Packet::decode dispatches on the first byte to ACK/NACK record sets,
/// datagrams (and their frames) or the offline packets.
fuzz_target!(|data: &[u8]| {
    let raw = Bytes::copy_from_slice(data);

    if let Ok(packet) = Packet::decode(raw.clone()) {
        // Anything that decodes must survive a re-encode.
        let _ = packet.encode();
    }
    let _ = Datagram::decode(raw.clone());
    let _ = OfflinePacket::decode(raw.clone());

    let mut buf = &data[..];
    let _ = RecordSet::decode(&mut buf);
});
