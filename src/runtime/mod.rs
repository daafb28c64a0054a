pub mod context;
pub mod control;
pub mod dispatch;
pub mod registry;
pub mod runner;
pub mod sink;
