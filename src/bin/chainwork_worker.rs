use anyhow::{Result, anyhow};
use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use chainwork::cluster::credentials::CredentialsRetriever;
use chainwork::models::task::ArgumentMap;
use chainwork::node::{Backends, WorkerNode};
use chainwork::runtime::context::TaskContext;
use chainwork::runtime::registry::TaskOutput;
use chainwork::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name announced to the cluster
    #[arg(long, default_value = "worker01")]
    node_name: String,

    /// Namespace (tenant) this node serves
    #[arg(long, default_value = "")]
    namespace: String,

    /// Redis connection URL (direct mode)
    #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    /// Management API endpoint; when set, backend credentials are fetched
    /// from it instead of using --redis
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, default_value = "")]
    username: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Namespace key for the credentials request
    #[arg(long, default_value = "")]
    namespace_key: String,

    /// Path to a YAML settings file
    #[arg(long)]
    settings: Option<String>,
}

async fn echo(arguments: ArgumentMap, ctx: TaskContext) -> Result<TaskOutput> {
    let message = arguments
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("(empty)");
    ctx.log(message).await?;
    Ok(TaskOutput::none())
}

/// Chains into itself until the counter runs out. Demonstrates follow-up
/// tasks with replacement arguments.
async fn countdown(arguments: ArgumentMap, ctx: TaskContext) -> Result<TaskOutput> {
    let steps = arguments
        .get("steps")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("missing argument 'steps'"))?;
    ctx.log(&format!("countdown: {}", steps)).await?;
    if steps <= 1 {
        return Ok(TaskOutput::none());
    }
    let mut next = ArgumentMap::new();
    next.insert("steps".into(), Value::from(steps - 1));
    Ok(TaskOutput::task("countdown").with_arguments(next))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::from_yaml(path)?,
        None => Settings::default(),
    };

    let backends = match &args.endpoint {
        Some(endpoint) => {
            let retriever = CredentialsRetriever::new(endpoint, &args.username, &args.password);
            let credentials = retriever.fetch(&args.namespace, &args.namespace_key).await?;
            Backends::from_credentials(&credentials)?
        }
        None => Backends::redis(&args.redis, &args.namespace)?,
    };

    let mut node = WorkerNode::new(&args.node_name, &args.namespace, settings, backends);
    node.add_task(
        "echo",
        Arc::new(echo),
        HashMap::from([("message".to_string(), "str".to_string())]),
        false,
    );
    node.add_task(
        "countdown",
        Arc::new(countdown),
        HashMap::from([("steps".to_string(), "int".to_string())]),
        false,
    );

    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    info!(node = %args.node_name, namespace = %args.namespace, "starting worker");
    node.listen().await
}
