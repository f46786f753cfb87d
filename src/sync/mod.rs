//! Cross-task synchronization: bounded waits and the peripheral pause
//! barrier used while a firmware image is written.

pub mod barrier;
pub mod timed;
