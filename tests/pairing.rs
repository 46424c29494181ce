//! Integration tests for the pairing-token redemption path (C3 -> C2).

#[path = "pairing/redemption_test.rs"]
mod redemption_test;
