use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::error::EngineError;
use crate::models::credentials::ManagementCredentials;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// Fetches per-namespace backend credentials from the management API.
/// Credentials can rotate server-side, so a retriever stays around and is
/// asked again when a connection needs rebuilding.
pub struct CredentialsRetriever {
    endpoint: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl CredentialsRetriever {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn login(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/login", self.endpoint))
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .context("management api unreachable")?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::CredentialsRejected(self.username.clone()).into());
        }
        let login: LoginResponse = response
            .error_for_status()
            .context("login failed")?
            .json()
            .await
            .context("malformed login response")?;
        Ok(login.access_token)
    }

    pub async fn fetch(
        &self,
        namespace: &str,
        namespace_key: &str,
    ) -> Result<ManagementCredentials> {
        let token = self.login().await?;
        debug!(namespace, "fetching namespace credentials");
        let response = self
            .client
            .get(format!(
                "{}/api/v1/namespaces/{}/credentials",
                self.endpoint, namespace
            ))
            .query(&[("key", namespace_key)])
            .bearer_auth(token)
            .send()
            .await
            .context("management api unreachable")?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::CredentialsRejected(namespace.to_string()).into());
        }
        let credentials = response
            .error_for_status()
            .context("credentials request failed")?
            .json()
            .await
            .context("malformed credentials response")?;
        Ok(credentials)
    }
}
