//! Integration tests for rule-matched notification fan-out (C11).

#[path = "notification/fanout_test.rs"]
mod fanout_test;
