use serde::{Serialize, Deserialize};
use std::collections::HashMap;

/// Per-tenant connection strings handed out by the control plane.
/// Keys can rotate, so the whole document must be re-fetchable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementCredentials {
    pub mongodb: DocumentStoreCredentials,
    pub rabbitmq: BrokerCredentials,
    pub redis: CacheCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStoreCredentials {
    pub url: String,
    #[serde(default)]
    pub extra_args: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCredentials {
    pub url: String,
    #[serde(default)]
    pub key_prefix: String,
}
