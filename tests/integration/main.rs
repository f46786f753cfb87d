//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against mock adapters. All tests run on the host (x86_64) with no
//! broker or flash required.

mod channel_tests;
mod engine_tests;
mod update_flow_tests;
