#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_binary_protocol::{HANDSHAKE_LEN, Handshake};

fuzz_target!(|data: &[u8]| {
    if let Ok((h, size)) = Handshake::deserialize(data) {
        assert_eq!(size, HANDSHAKE_LEN);
        assert_eq!(&h.to_bytes()[..], &data[..HANDSHAKE_LEN]);
    }
});
