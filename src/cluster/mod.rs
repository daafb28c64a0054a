pub mod credentials;
pub mod heartbeat;
pub mod registration;
