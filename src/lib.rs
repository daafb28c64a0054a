pub mod cluster;
pub mod error;
pub mod models;
pub mod node;
pub mod pipelines;
pub mod queue;
pub mod runtime;
pub mod settings;
pub mod storage;

pub use error::EngineError;
pub use node::{Backends, WorkerNode};
pub use settings::Settings;
