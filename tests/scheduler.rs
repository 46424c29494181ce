//! Integration tests for the cron-driven scheduler (C12).

#[path = "scheduler/cron_fidelity_test.rs"]
mod cron_fidelity_test;
