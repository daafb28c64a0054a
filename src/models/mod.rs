pub mod control;
pub mod credentials;
pub mod exclude;
pub mod task;
