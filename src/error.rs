use thiserror::Error;

/// First-class engine failures callers are expected to match on. Everything
/// else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node name '{0}' is already registered; set force_register to overwrite")]
    NodeAlreadyRegistered(String),

    #[error("credential endpoint rejected the login for user '{0}'")]
    CredentialsRejected(String),

    #[error("no task registered under the name '{0}'")]
    UnknownTask(String),
}
