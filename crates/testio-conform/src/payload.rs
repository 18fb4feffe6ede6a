//! Random write payloads.
//!
//! Payloads travel to the tester as a command-line argument, so they are
//! restricted to ASCII letters: no NUL, no whitespace, nothing a shell or
//! argument splitter would touch.

use rand::Rng;

/// Length of the payload each write scenario sends.
pub const WRITE_PAYLOAD_LEN: usize = 10_000;

/// Alphabet payloads are drawn from.
pub const ASCII_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate `len` random ASCII letters.
pub fn random_letters(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(ASCII_LETTERS[rng.random_range(0..ASCII_LETTERS.len())]))
        .collect()
}

/// Generate a standard write payload.
pub fn write_payload() -> String {
    random_letters(WRITE_PAYLOAD_LEN)
}
