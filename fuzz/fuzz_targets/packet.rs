#![no_main]

use bip151_core::packet::{split_messages, EncAck, EncInit};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz wire-message parsing - should never panic on any input
    let _ = EncInit::parse(data);
    let _ = EncAck::parse(data);
    let _ = split_messages(data);
});
