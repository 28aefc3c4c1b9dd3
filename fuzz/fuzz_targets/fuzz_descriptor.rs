#![no_main]
use libfuzzer_sys::fuzz_target;
use lanswarm::TorrentDescriptor;

fuzz_target!(|data: &str| {
    // parse() should never panic on arbitrary UTF-8 strings
    let _ = TorrentDescriptor::parse(data, 16);
});
