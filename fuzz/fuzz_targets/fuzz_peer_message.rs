#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_realtime_client::protocol::PeerMessage;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<PeerMessage>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(message) = serde_json::from_str::<PeerMessage>(s) {
            // Whatever parses must serialize again.
            let _ = serde_json::to_string(&message);
        }
    }
});
