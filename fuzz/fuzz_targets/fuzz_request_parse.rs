//! Fuzz target for request line parsing.
//!
//! Parsing never panics, and anything that parses re-parses to the same
//! request from its canonical form.

#![no_main]

use circulation_mesh::protocol::Request;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    if let Ok(request) = raw.parse::<Request>() {
        let canonical = request.to_string();
        let reparsed: Request = canonical.parse().expect("canonical form must parse");
        assert_eq!(reparsed, request);
    }
});
