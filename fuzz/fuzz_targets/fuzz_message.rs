#![no_main]
use libfuzzer_sys::fuzz_target;
use lanswarm::Message;

fuzz_target!(|data: &[u8]| {
    // decode() should never panic, and whatever it accepts must survive a re-encode
    if let Ok(message) = Message::decode(data) {
        let _ = Message::decode(&message.encode());
    }
});
