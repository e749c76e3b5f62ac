#![no_main]

use libfuzzer_sys::fuzz_target;
use meshradio_protocol::{MeshFrame, SignalMessage};

fuzz_target!(|data: &[u8]| {
    // Peer channels and the rendezvous carry untrusted text; decoding must
    // never panic
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(frame) = MeshFrame::decode(text) {
        if let Ok(encoded) = frame.encode() {
            let _ = MeshFrame::decode(&encoded);
        }
    }

    if let Ok(message) = SignalMessage::decode(text) {
        let _ = message.target();
        let _ = message.encode();
    }
});
