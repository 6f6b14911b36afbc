#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use raknet_transport::wire::ConnectedMessage;

/// Connected control message decoding, including the address lists in
/// ConnectionRequestAccepted and NewIncomingConnection.
fuzz_target!(|data: &[u8]| {
    let _ = ConnectedMessage::decode(&Bytes::copy_from_slice(data));
});
