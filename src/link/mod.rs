//! Reliable publish/subscribe link: transport vocabulary, the retry pool
//! for unacknowledged messages, subscription bookkeeping and the channel
//! that ties them to a connection lifecycle.

pub mod channel;
pub mod pool;
pub mod topics;
pub mod transport;
