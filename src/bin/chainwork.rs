use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use chainwork::cluster::heartbeat::read_heartbeat;
use chainwork::models::control::{BlockListEntry, COMMAND_ABORT, COMMAND_STOP};
use chainwork::models::task::{ArgumentMap, Task};
use chainwork::queue::blocklist::BlockList;
use chainwork::queue::consumer::QueuePublisher;
use chainwork::runtime::control::publish_control;
use chainwork::settings::Settings;
use chainwork::storage::redis::{RedisBroker, RedisKeyValueStore};
use chainwork::storage::{QueueBroker, QueueOptions};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
    redis: String,

    /// Namespace (tenant) to operate on
    #[arg(long, default_value = "")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new workflow by publishing its root task
    Start {
        /// Registered task name
        name: String,
        /// Task arguments as key=value pairs
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Restrict execution to these nodes
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Tags recorded on the workflow
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Ask the node running a workflow to stop it gracefully
    Stop { workflow_id: String },
    /// Abort a running workflow immediately
    Abort { workflow_id: String },
    /// Show the number of ready messages on a queue
    Depth {
        /// Base queue name, e.g. it_queue
        queue: String,
    },
    /// Check whether a node's heartbeat is current
    Liveness { node_name: String },
    /// Add a blocklist entry for a node/task pair
    Block {
        /// Node name or "*"
        name: String,
        /// Task name or "*"
        content: String,
        /// Purge matching tasks instead of holding them
        #[arg(long)]
        delete: bool,
        /// Target the wait blocklist instead of the incoming one
        #[arg(long)]
        wait_list: bool,
    },
    /// Remove a blocklist entry
    Unblock {
        name: String,
        content: String,
        #[arg(long)]
        delete: bool,
        #[arg(long)]
        wait_list: bool,
    },
}

fn parse_arguments(pairs: &[String]) -> Result<ArgumentMap> {
    let mut arguments = ArgumentMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("argument '{}' is not key=value", pair))?;
        arguments.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(arguments)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let settings = Settings::default();
    let namespace = cli.namespace.clone();

    match cli.command {
        Commands::Start { name, args, nodes, tags } => {
            let broker: Arc<dyn QueueBroker> = Arc::new(RedisBroker::connect(&cli.redis)?);
            let queue = settings.namespaced(&namespace, &settings.task_queue);
            let publisher = QueuePublisher::new(broker, queue, QueueOptions::default()).await?;
            let mut task = Task::new(name, parse_arguments(&args)?);
            task.node_names = nodes;
            if !tags.is_empty() {
                task.tags = Some(tags);
            }
            publisher.send(&task).await?;
            info!(task = %task.name, "workflow root task published");
        }
        Commands::Stop { workflow_id } => {
            let kv = RedisKeyValueStore::connect(&cli.redis, &namespace)?;
            let channel = settings.namespaced(&namespace, &settings.task_control_channel);
            publish_control(&kv, &channel, &workflow_id, COMMAND_STOP).await?;
            info!(workflow_id = %workflow_id, "stop command published");
        }
        Commands::Abort { workflow_id } => {
            let kv = RedisKeyValueStore::connect(&cli.redis, &namespace)?;
            let channel = settings.namespaced(&namespace, &settings.task_control_channel);
            publish_control(&kv, &channel, &workflow_id, COMMAND_ABORT).await?;
            info!(workflow_id = %workflow_id, "abort command published");
        }
        Commands::Depth { queue } => {
            let broker = RedisBroker::connect(&cli.redis)?;
            let queue = settings.namespaced(&namespace, &queue);
            let count = broker.message_count(&queue).await?;
            println!("{} {}", queue, count);
        }
        Commands::Liveness { node_name } => {
            let kv = RedisKeyValueStore::connect(&cli.redis, &namespace)?;
            let key = settings.namespaced(&namespace, &settings.heartbeat_key);
            match read_heartbeat(&kv, &key, &node_name).await? {
                Some(heartbeat) => {
                    let active = heartbeat.is_active(settings.heartbeat_interval as i64);
                    println!(
                        "{} last seen {} ({})",
                        node_name,
                        heartbeat.last_time_seen,
                        if active { "active" } else { "stale" }
                    );
                }
                None => println!("{} has no heartbeat record", node_name),
            }
        }
        Commands::Block { name, content, delete, wait_list } => {
            let kv = Arc::new(RedisKeyValueStore::connect(&cli.redis, &namespace)?);
            let base = if wait_list {
                &settings.wait_block_list_key
            } else {
                &settings.incoming_block_list_key
            };
            let block_list = BlockList::new(settings.namespaced(&namespace, base), kv);
            block_list.init().await?;
            let added = block_list.add(BlockListEntry { name, content, delete }).await?;
            println!("{}", if added { "added" } else { "already present" });
        }
        Commands::Unblock { name, content, delete, wait_list } => {
            let kv = Arc::new(RedisKeyValueStore::connect(&cli.redis, &namespace)?);
            let base = if wait_list {
                &settings.wait_block_list_key
            } else {
                &settings.incoming_block_list_key
            };
            let block_list = BlockList::new(settings.namespaced(&namespace, base), kv);
            let removed = block_list.remove(&BlockListEntry { name, content, delete }).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
    }
    Ok(())
}
