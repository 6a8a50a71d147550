//! Fuzz target for catalog seed lines.

#![no_main]

use circulation_mesh::model::Book;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|line: &str| {
    if let Ok(book) = Book::parse_seed_line(line) {
        assert!(!book.id.as_str().is_empty());
    }
});
