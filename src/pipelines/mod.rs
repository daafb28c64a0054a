pub mod blocked;
pub mod wait;
