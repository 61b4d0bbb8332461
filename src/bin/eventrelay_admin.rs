//! eventrelay-admin: provisioning and operator CLI
//!
//! - `subscriber`: register, remove and list subscribers in the registry
//! - `acl`: register ACL functions and map them to event types
//! - `subscribe` / `edit` / `unsubscribe` / `list`: manage subscriptions
//!   through a subscriber's agent
//! - `publish`: put an event on the inbound channel
//!
//! ## Configuration
//! - EVENTRELAY_CONFIG: path to a YAML config file (default: config.yaml)

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use eventrelay::bus::init_delivery_channel;
use eventrelay::client::AgentClient;
use eventrelay::config::{Config, AGENT_TOKEN_ENV_VAR};
use eventrelay::event::{Event, EVENT_TYPE_FIELD};
use eventrelay::registry::{init_registry, Registry, RegistryStore, Role, Subscriber};
use eventrelay::utils::bootstrap::init_tracing;

const DEFAULT_AGENT: &str = "127.0.0.1:8021";
const AGENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "eventrelay-admin", about = "eventrelay provisioning and operator CLI")]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage subscribers in the registry
    Subscriber {
        #[command(subcommand)]
        action: SubscriberAction,
    },
    /// Manage ACL functions and event mappings in the registry
    Acl {
        #[command(subcommand)]
        action: AclAction,
    },
    /// Add or replace a subscription through an agent
    Subscribe {
        #[command(flatten)]
        agent: AgentArgs,
        username: String,
        event_type: String,
        command: String,
    },
    /// Replace the command of an existing subscription through an agent
    Edit {
        #[command(flatten)]
        agent: AgentArgs,
        username: String,
        event_type: String,
        command: String,
    },
    /// Remove a subscription through an agent
    Unsubscribe {
        #[command(flatten)]
        agent: AgentArgs,
        username: String,
        event_type: String,
    },
    /// List subscriptions through an agent
    List {
        #[command(flatten)]
        agent: AgentArgs,
        username: String,
        #[arg(long)]
        event_type: Option<String>,
    },
    /// Publish an event to the inbound channel
    Publish {
        /// Event type
        event_type: String,
        /// Additional payload fields as key=value
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        /// Full JSON body, merged under the fields above
        #[arg(long)]
        json: Option<String>,
    },
}

#[derive(Subcommand)]
enum SubscriberAction {
    /// Register a subscriber, or update role, token and endpoint of an existing one
    Add {
        username: String,
        #[arg(long, default_value = "user")]
        role: String,
        /// Bearer token the relay presents to the subscriber's agent
        #[arg(long)]
        token: String,
        /// Delivery channel (default: <username>-events.fifo)
        #[arg(long)]
        channel: Option<String>,
        /// Agent address, host:port or URL
        #[arg(long)]
        agent_endpoint: Option<String>,
    },
    /// Remove a subscriber and its subscriptions
    Remove { username: String },
    /// List subscribers
    List,
}

#[derive(Subcommand)]
enum AclAction {
    /// Register an ACL function under a predicate reference
    Register { name: String, reference: String },
    /// Remove an ACL function and its mappings
    Remove { name: String },
    /// Append an ACL function to an event type's chain
    Map { event_type: String, name: String },
    /// Remove an ACL function from an event type's chain
    Unmap { event_type: String, name: String },
    /// Show the chain of an event type, or all functions
    List {
        #[arg(long)]
        event_type: Option<String>,
    },
}

#[derive(clap::Args)]
struct AgentArgs {
    /// Agent address, host:port or URL
    #[arg(long, default_value = DEFAULT_AGENT)]
    agent: String,
    /// Agent bearer token
    #[arg(long, env = AGENT_TOKEN_ENV_VAR)]
    token: String,
}

impl AgentArgs {
    fn client(&self) -> Result<AgentClient, Box<dyn std::error::Error>> {
        Ok(AgentClient::new(&self.agent, self.token.clone(), AGENT_TIMEOUT)?)
    }
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Subscriber { action } => run_subscriber(&config, action).await?,
        Commands::Acl { action } => run_acl(&config, action).await?,
        Commands::Subscribe {
            agent,
            username,
            event_type,
            command,
        } => {
            let status = agent.client()?.subscribe(&username, &event_type, &command).await?;
            println!("{}", status);
        }
        Commands::Edit {
            agent,
            username,
            event_type,
            command,
        } => {
            let status = agent.client()?.edit(&username, &event_type, &command).await?;
            println!("{}", status);
        }
        Commands::Unsubscribe {
            agent,
            username,
            event_type,
        } => {
            let status = agent.client()?.unsubscribe(&username, &event_type).await?;
            println!("{}", status);
        }
        Commands::List {
            agent,
            username,
            event_type,
        } => {
            let subscriptions = agent
                .client()?
                .list_subscriptions(&username, event_type.as_deref())
                .await?;
            for s in subscriptions {
                println!("{}\t{}\t{}", s.username, s.event_type, s.command);
            }
        }
        Commands::Publish {
            event_type,
            fields,
            json,
        } => run_publish(&config, event_type, fields, json).await?,
    }

    Ok(())
}

async fn run_subscriber(
    config: &Config,
    action: SubscriberAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = init_registry(&config.registry).await?;

    match action {
        SubscriberAction::Add {
            username,
            role,
            token,
            channel,
            agent_endpoint,
        } => {
            let role: Role = role.parse()?;
            let channel = channel.unwrap_or_else(|| format!("{}-events.fifo", username));
            let mut subscriber = Subscriber::new(&username, role, channel, token);
            subscriber.agent_endpoint = agent_endpoint;
            registry.upsert_subscriber(&subscriber).await?;

            // The stored channel wins over the requested one for existing subscribers.
            if let Some(stored) = registry.subscriber(&username).await? {
                println!("{}\t{}\t{}", stored.username, stored.role, stored.channel_ref);
            }
        }
        SubscriberAction::Remove { username } => {
            if registry.delete_subscriber(&username).await? {
                println!("Removed {}", username);
            } else {
                println!("No subscriber {}", username);
            }
        }
        SubscriberAction::List => {
            for s in registry.subscribers().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    s.username,
                    s.role,
                    s.channel_ref,
                    s.agent_endpoint.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

async fn run_acl(config: &Config, action: AclAction) -> Result<(), Box<dyn std::error::Error>> {
    let registry = init_registry(&config.registry).await?;

    match action {
        AclAction::Register { name, reference } => {
            registry.register_acl_function(&name, &reference).await?;
            println!("Registered {} -> {}", name, reference);
        }
        AclAction::Remove { name } => {
            if registry.delete_acl_function(&name).await? {
                println!("Removed {}", name);
            } else {
                println!("No ACL function {}", name);
            }
        }
        AclAction::Map { event_type, name } => {
            registry.map_acl_function(&event_type, &name).await?;
            println!("Mapped {} to {}", name, event_type);
        }
        AclAction::Unmap { event_type, name } => {
            if registry.unmap_acl_function(&event_type, &name).await? {
                println!("Unmapped {} from {}", name, event_type);
            } else {
                println!("{} was not mapped to {}", name, event_type);
            }
        }
        AclAction::List { event_type } => {
            let functions = match event_type {
                Some(event_type) => registry.acl_chain_for_event(&event_type).await?,
                None => registry.acl_functions().await?,
            };
            for f in functions {
                println!("{}\t{}", f.name, f.reference);
            }
        }
    }
    Ok(())
}

async fn run_publish(
    config: &Config,
    event_type: String,
    fields: Vec<(String, String)>,
    json: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut payload = match json {
        Some(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => map,
            _ => return Err("--json must be a JSON object".into()),
        },
        None => Map::new(),
    };
    for (key, value) in fields {
        payload.insert(key, Value::String(value));
    }
    payload.insert(EVENT_TYPE_FIELD.to_string(), Value::String(event_type));

    let event = Event::from_payload(payload)?;
    let body = serde_json::to_string(&event.payload)?;

    config.require_shared_messaging("eventrelay-admin publish")?;
    let channel = init_delivery_channel(&config.messaging)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    let message_id = channel
        .send(&config.dispatcher.inbound_channel, &body, &event.event_type)
        .await?;
    println!("{}", message_id);
    Ok(())
}
