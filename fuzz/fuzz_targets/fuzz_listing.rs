#![no_main]
use libfuzzer_sys::fuzz_target;
use lanswarm::catalog::parse_listing;

fuzz_target!(|data: &str| {
    let _ = parse_listing(data);
});
