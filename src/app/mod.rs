//! Hexagonal boundary of the engine.
//!
//! Everything the protocol core needs from the outside world (broker,
//! clock, flash, device actions) is reached through the **port traits**
//! in [`ports`], keeping the core testable without a network or hardware.

pub mod ports;
