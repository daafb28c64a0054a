pub mod blocklist;
pub mod consumer;
