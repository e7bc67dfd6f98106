#![no_main]

//! Feeds arbitrary message sequences to a connecting client. The state
//! machine must never panic, whatever order the servers answer in.

use std::collections::VecDeque;

use libfuzzer_sys::fuzz_target;
use relay_realtime_client::protocol::{OperationRequest, PeerMessage};
use relay_realtime_client::settings::{AppSettings, ConnectionProtocol};
use relay_realtime_client::{Peer, RealtimeClient, RealtimeError};

struct ReplayPeer {
    batches: VecDeque<Vec<PeerMessage>>,
}

impl Peer for ReplayPeer {
    fn connect(&mut self, _address: &str, _app_id: &str, _token: Option<&str>) -> bool {
        true
    }

    fn disconnect(&mut self) {}

    fn send_operation(&mut self, _request: &OperationRequest, _reliable: bool) -> bool {
        true
    }

    fn establish_encryption(&mut self) -> bool {
        false
    }

    fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }

    fn send_acks(&mut self) {}

    fn set_protocol(&mut self, _protocol: ConnectionProtocol) {}
}

fuzz_target!(|data: &[u8]| {
    let Ok(batches) = serde_json::from_slice::<Vec<Vec<PeerMessage>>>(data) else {
        return;
    };
    let rounds = batches.len();
    let mut client = RealtimeClient::new(ReplayPeer {
        batches: batches.into(),
    });
    client.connect_using_settings(AppSettings::new("fuzz").with_fixed_region("eu"));
    for _ in 0..rounds {
        let _ = client.service();
        let _ = client.heartbeat();
    }
});
