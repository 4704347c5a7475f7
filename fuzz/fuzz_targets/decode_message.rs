#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_binary_protocol::{MAX_MSG_LEN, MessageBorrowed, frame_len};

fuzz_target!(|data: &[u8]| {
    // Whatever decodes must report a frame length that fits the input and agrees with
    // frame_len, and must serialize back to exactly that many bytes.
    if let Ok((msg, size)) = MessageBorrowed::deserialize_with_max_len(data, MAX_MSG_LEN) {
        assert!(size <= data.len());
        assert_eq!(frame_len(data, MAX_MSG_LEN).ok(), Some(size));
        let mut out = Vec::new();
        assert_eq!(msg.serialize(&mut out), size);
        assert_eq!(&out[..], &data[..size]);
    }
});
