//! Fuzz target for relay message deserialization.
//!
//! Arbitrary bytes must never crash the decoder. Malformed data has to come back as an
//! error, and anything that does decode must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;

use lockstep_sync::network::codec;
use lockstep_sync::{InboundMessage, OutboundMessage};

type Inbound = InboundMessage<u8, Vec<u8>>;
type Outbound = OutboundMessage<u8, Vec<u8>>;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = codec::decode_value::<Inbound>(data) {
        let _serialized = codec::encode(&msg);
    }
    if let Ok(msg) = codec::decode_value::<Outbound>(data) {
        let _serialized = codec::encode(&msg);
    }
});
